//! 命令执行器
//!
//! 提供统一的命令执行接口：
//! - 远程命令：经 SSH 会话执行，捕获 stdout/stderr/退出码，带超时
//! - 本地命令：构建与 git 等外部动作，逐行写入日志，支持超时与取消

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::remote::CommandResult;
use crate::error::{DeployError, DeployResult};
use crate::infra::shell::ShellCommand;
use crate::infra::ssh::RemoteHost;

/// 远程命令执行器
///
/// 无状态；非零退出码只记录在结果中，不作为错误返回
#[derive(Clone, Debug)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 执行命令并等待完成
    ///
    /// 仅在传输失败或超时时返回错误
    pub async fn run(
        &self,
        session: &mut dyn RemoteHost,
        command: &ShellCommand,
    ) -> DeployResult<CommandResult> {
        let text = command.render();
        info!(command = %text, "[remote] executing");

        let result = match tokio::time::timeout(self.timeout, session.exec(&text)).await {
            Ok(result) => result?,
            Err(_) => {
                error!(command = %text, "Remote command timed out after {:?}", self.timeout);
                return Err(DeployError::TimedOut {
                    command: text,
                    after: self.timeout,
                });
            }
        };

        let stdout = result.stdout.trim();
        let stderr = result.stderr.trim();
        if !stdout.is_empty() {
            debug!(exit_code = result.exit_code, "stdout: {}", stdout);
        }
        if !stderr.is_empty() {
            if result.success() {
                debug!(exit_code = result.exit_code, "stderr: {}", stderr);
            } else {
                warn!(exit_code = result.exit_code, "stderr: {}", stderr);
            }
        }
        if !result.success() {
            warn!(command = %text, exit_code = result.exit_code, "Remote command failed");
        }

        Ok(result)
    }

    /// 执行命令，非零退出码转换为 `CommandExecution` 错误
    pub async fn run_checked(
        &self,
        session: &mut dyn RemoteHost,
        command: &ShellCommand,
    ) -> DeployResult<CommandResult> {
        let result = self.run(session, command).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(DeployError::CommandExecution {
                command: result.command.clone(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }
}

/// 本地命令执行错误
#[derive(Debug)]
pub enum LocalCommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout,
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for LocalCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalCommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            LocalCommandError::Timeout => write!(f, "Command timed out"),
            LocalCommandError::Cancelled => write!(f, "Command was cancelled"),
            LocalCommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for LocalCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LocalCommandError::SpawnFailed(e) | LocalCommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 本地命令执行结果
pub struct LocalOutput {
    /// 退出状态
    pub status: ExitStatus,
    /// stderr 最后若干行，用于失败提示
    pub stderr_tail: Vec<String>,
}

/// 保留的 stderr 尾部行数
const STDERR_TAIL_LINES: usize = 20;

/// 本地命令执行器
pub struct LocalRunner;

impl LocalRunner {
    /// 通过 `sh -c` 执行命令，逐行写入日志
    ///
    /// # Arguments
    /// * `command` - shell 命令字符串
    /// * `work_dir` - 工作目录
    /// * `cancel` - 取消令牌
    /// * `timeout` - 超时时间
    pub async fn run_shell(
        command: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<LocalOutput, LocalCommandError> {
        info!(command = %command, dir = %work_dir.display(), "[local] executing");

        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(work_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(LocalCommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout 读取任务
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        info!(target: "local", "{}", line);
                    }
                }
            }
        });

        // 启动 stderr 读取任务，保留尾部
        let stderr_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    warn!(target: "local", "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        });

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Command cancelled, killing process");
                let _ = child.kill().await;
                Err(LocalCommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!("Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(LocalCommandError::Timeout)
            }
            status = child.wait() => {
                status.map_err(LocalCommandError::WaitFailed)
            }
        };

        // 等待日志读取完成
        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        result.map(|status| LocalOutput {
            status,
            stderr_tail,
        })
    }

    /// 执行简单命令（不记录逐行日志）
    ///
    /// 用于只关心结果的场景（如 git commit）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, LocalCommandError> {
        debug!(program = %program, ?args, "[local] executing");
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(LocalCommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(LocalCommandError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedHost;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_remote_exit_code_is_reported_not_raised() {
        let mut host = ScriptedHost::new().respond("exit 7", CommandResult::new("", "", "nope", 7));
        let runner = CommandRunner::new(Duration::from_secs(5));

        let result = runner
            .run(&mut host, &ShellCommand::raw("exit 7"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.success());
        assert_eq!(result.command, "exit 7");

        let err = runner
            .run_checked(&mut host, &ShellCommand::raw("exit 7"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandExecution { exit_code: 7, .. }));
    }

    #[tokio::test]
    async fn test_remote_timeout() {
        let mut host = ScriptedHost::new().hang_on("sleep");
        let runner = CommandRunner::new(Duration::from_millis(50));

        let err = runner
            .run(&mut host, &ShellCommand::raw("sleep 1000"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = LocalRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = LocalRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(LocalCommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_run_shell_captures_stderr_tail() {
        let output = LocalRunner::run_shell(
            "echo building; echo broken >&2; exit 3",
            &PathBuf::from("/tmp"),
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr_tail, vec!["broken".to_string()]);
    }

    #[tokio::test]
    async fn test_run_shell_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = LocalRunner::run_shell(
            "sleep 10",
            &PathBuf::from("/tmp"),
            &cancel,
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(LocalCommandError::Cancelled)));
    }
}
