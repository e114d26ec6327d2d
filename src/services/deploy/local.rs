//! 本地动作：构建与版本控制推送
//!
//! 编排器只依赖 [`LocalActions`]，默认实现在本地项目目录中执行配置好的命令

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LocalConfig;
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{LocalCommandError, LocalRunner};

/// 单条 git 命令的超时
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait LocalActions: Send + Sync {
    /// 本地项目根目录（打包与数据库路径以此为基准）
    fn project_dir(&self) -> &Path;

    /// 产出构建结果；失败为致命
    async fn build(&self, cancel: &CancellationToken) -> DeployResult<()>;

    /// 提交并推送本地改动
    async fn sync_vcs(&self) -> DeployResult<()>;
}

/// 在本地 shell 中执行构建与 git 命令
pub struct ShellWorkspace {
    config: LocalConfig,
}

impl ShellWorkspace {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    async fn git(&self, args: &[&str]) -> DeployResult<std::process::Output> {
        LocalRunner::run_simple("git", args, &self.config.project_dir, GIT_TIMEOUT)
            .await
            .map_err(|e| DeployError::VcsSync(format!("git {}: {}", args.join(" "), e)))
    }
}

#[async_trait]
impl LocalActions for ShellWorkspace {
    fn project_dir(&self) -> &Path {
        &self.config.project_dir
    }

    async fn build(&self, cancel: &CancellationToken) -> DeployResult<()> {
        let output = LocalRunner::run_shell(
            &self.config.build_command,
            &self.config.project_dir,
            cancel,
            self.config.build_timeout,
        )
        .await
        .map_err(|e| match e {
            LocalCommandError::Cancelled => DeployError::Cancelled,
            LocalCommandError::Timeout => DeployError::TimedOut {
                command: self.config.build_command.clone(),
                after: self.config.build_timeout,
            },
            other => DeployError::Build(other.to_string()),
        })?;

        if output.status.success() {
            info!(command = %self.config.build_command, "Build finished");
            Ok(())
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(DeployError::Build(format!(
                "`{}` exited with {}: {}",
                self.config.build_command,
                code,
                output.stderr_tail.join("\n")
            )))
        }
    }

    async fn sync_vcs(&self) -> DeployResult<()> {
        let add = self.git(&["add", "."]).await?;
        if !add.status.success() {
            return Err(DeployError::VcsSync(format!(
                "git add: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            )));
        }

        // 没有改动时 commit 返回 1，属于正常情况
        let commit = self
            .git(&["commit", "-m", self.config.commit_message.as_str()])
            .await?;
        if !commit.status.success() {
            info!("Nothing to commit");
        }

        let push = self
            .git(&[
                "push",
                self.config.git_remote.as_str(),
                self.config.git_branch.as_str(),
            ])
            .await?;
        if !push.status.success() {
            let stderr = String::from_utf8_lossy(&push.stderr).trim().to_string();
            warn!(remote = %self.config.git_remote, "git push failed");
            return Err(DeployError::VcsSync(format!("git push: {}", stderr)));
        }

        info!(
            remote = %self.config.git_remote,
            branch = %self.config.git_branch,
            "Pushed local changes"
        );
        Ok(())
    }
}

/// 相对路径以项目目录为基准
pub fn project_path<L: LocalActions + ?Sized>(local: &L, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        local.project_dir().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &Path, build_command: &str) -> ShellWorkspace {
        ShellWorkspace::new(LocalConfig {
            project_dir: dir.to_path_buf(),
            build_command: build_command.to_string(),
            build_timeout: Duration::from_secs(10),
            git_remote: "origin".to_string(),
            git_branch: "master".to_string(),
            commit_message: "Auto-deploy update".to_string(),
        })
    }

    #[tokio::test]
    async fn test_build_success() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), "mkdir -p dist && echo ok > dist/index.html");
        ws.build(&CancellationToken::new()).await.unwrap();
        assert!(dir.path().join("dist/index.html").exists());
    }

    #[tokio::test]
    async fn test_build_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), "echo 'vite: not found' >&2; exit 127");
        let err = ws.build(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeployError::Build(ref m) if m.contains("vite: not found")));
    }

    #[tokio::test]
    async fn test_build_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ws.build(&cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
    }

    #[tokio::test]
    async fn test_sync_outside_repository_is_vcs_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = workspace(dir.path(), "true").sync_vcs().await.unwrap_err();
        assert!(matches!(err, DeployError::VcsSync(_)));
    }

    #[test]
    fn test_project_path() {
        let ws = workspace(Path::new("/work/app"), "true");
        assert_eq!(
            project_path(&ws, Path::new("server/database.sqlite")),
            PathBuf::from("/work/app/server/database.sqlite")
        );
        assert_eq!(
            project_path(&ws, Path::new("/data/db.sqlite")),
            PathBuf::from("/data/db.sqlite")
        );
    }
}
