//! 文件传输与远端准备
//!
//! - 上传：经 SFTP 写入，失败即致命
//! - 备份：覆盖持久化状态文件前先复制一份 `.bak_<ts>`，失败只记录
//! - 远端准备：解压归档、安装依赖，均为非致命

use std::path::Path;

use tracing::{info, warn};

use crate::domain::package::Package;
use crate::domain::remote::{BackupOutcome, BackupRecord, CommandResult};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandRunner;
use crate::infra::shell::ShellCommand;
use crate::infra::ssh::RemoteHost;
use crate::services::resolver::Toolchain;

/// 上传校验结果
#[derive(Clone, Debug, PartialEq)]
pub enum Verification {
    Matched,
    /// 远端没有 sha256sum 或输出无法解析
    Unavailable(String),
}

/// 远端准备阶段两条命令各自的结果
///
/// 传输错误（超时、断线）与非零退出分别保留，互不影响
#[derive(Debug)]
pub struct RemoteSetup {
    pub extract: DeployResult<CommandResult>,
    pub install: DeployResult<CommandResult>,
}

impl RemoteSetup {
    pub fn success(&self) -> bool {
        [&self.extract, &self.install]
            .into_iter()
            .all(|r| matches!(r, Ok(result) if result.success()))
    }

    /// 所有失败，非零退出转换为 `CommandExecution`
    pub fn into_failures(self) -> Vec<DeployError> {
        [self.extract, self.install]
            .into_iter()
            .filter_map(|r| match r {
                Ok(result) if result.success() => None,
                Ok(result) => Some(DeployError::CommandExecution {
                    stderr: result.stderr.trim().to_string(),
                    exit_code: result.exit_code,
                    command: result.command,
                }),
                Err(e) => Some(e),
            })
            .collect()
    }
}

pub struct Transferer<'a> {
    runner: &'a CommandRunner,
}

impl<'a> Transferer<'a> {
    pub fn new(runner: &'a CommandRunner) -> Self {
        Self { runner }
    }

    /// 上传文件，失败向上传播
    pub async fn upload(
        &self,
        session: &mut dyn RemoteHost,
        local: &Path,
        remote: &str,
    ) -> DeployResult<u64> {
        info!(local = %local.display(), remote = %remote, "Uploading");
        let written = session.upload(local, remote).await?;
        info!(remote = %remote, bytes = written, "Upload complete");
        Ok(written)
    }

    /// 以当前时间戳备份远端文件
    pub async fn backup(&self, session: &mut dyn RemoteHost, remote: &str) -> BackupRecord {
        self.backup_at(session, remote, chrono::Utc::now().timestamp())
            .await
    }

    /// 以指定时间戳备份远端文件
    ///
    /// 源文件不存在视为无需保护；任何失败都记入记录而不返回错误。
    /// 同一秒内的两次备份会写到同一路径，后者覆盖前者
    pub async fn backup_at(
        &self,
        session: &mut dyn RemoteHost,
        remote: &str,
        timestamp: i64,
    ) -> BackupRecord {
        let backup_path = BackupRecord::backup_path_for(remote, timestamp);
        let record = |outcome| BackupRecord {
            original_path: remote.to_string(),
            backup_path: backup_path.clone(),
            timestamp,
            outcome,
        };

        let exists = ShellCommand::new("test").args(["-e", remote]);
        match self.runner.run(session, &exists).await {
            Ok(result) if !result.success() => {
                info!(path = %remote, "Nothing to back up");
                return record(BackupOutcome::NothingToProtect);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %remote, error = %e, "Backup existence check failed");
                return record(BackupOutcome::Failed(e.to_string()));
            }
        }

        let copy = ShellCommand::new("cp").args(["-p", remote, backup_path.as_str()]);
        let outcome = match self.runner.run(session, &copy).await {
            Ok(result) if result.success() => {
                info!(path = %remote, backup = %backup_path, "Backup created");
                BackupOutcome::Created
            }
            Ok(result) => {
                let err = DeployError::Backup {
                    path: remote.to_string(),
                    message: result.failure_summary(),
                };
                warn!("{}", err);
                BackupOutcome::Failed(result.failure_summary())
            }
            Err(e) => {
                warn!(path = %remote, error = %e, "Backup failed");
                BackupOutcome::Failed(e.to_string())
            }
        };
        record(outcome)
    }

    /// 先备份再上传，顺序固定
    ///
    /// 备份记录总是返回；上传结果原样交给调用方
    pub async fn backup_then_upload(
        &self,
        session: &mut dyn RemoteHost,
        local: &Path,
        remote: &str,
    ) -> (BackupRecord, DeployResult<u64>) {
        let record = self.backup(session, remote).await;
        let written = self.upload(session, local, remote).await;
        (record, written)
    }

    /// 比对远端归档的 SHA-256
    ///
    /// 不一致为致命的传输错误；远端无法计算时返回 `Unavailable`
    pub async fn verify_upload(
        &self,
        session: &mut dyn RemoteHost,
        package: &Package,
        remote: &str,
    ) -> DeployResult<Verification> {
        let cmd = ShellCommand::new("sha256sum").arg(remote);
        let result = self.runner.run(session, &cmd).await?;
        if !result.success() {
            return Ok(Verification::Unavailable(result.failure_summary()));
        }

        let digest = result
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if digest.len() != 64 {
            return Ok(Verification::Unavailable(format!(
                "unexpected sha256sum output: {}",
                result.stdout_trimmed()
            )));
        }
        if digest != package.sha256 {
            return Err(DeployError::transfer(
                remote,
                format!("checksum mismatch: local {} remote {}", package.sha256, digest),
            ));
        }

        info!(remote = %remote, "Checksum verified");
        Ok(Verification::Matched)
    }

    /// 解压归档并安装生产依赖
    ///
    /// 两条命令无条件依次执行，任一失败都不阻止另一条，失败留给调用方记录
    pub async fn remote_setup(
        &self,
        session: &mut dyn RemoteHost,
        remote_dir: &str,
        archive_name: &str,
        toolchain: &Toolchain,
    ) -> RemoteSetup {
        let extract = ShellCommand::new("tar")
            .args(["-xzf", archive_name])
            .current_dir(remote_dir);
        let extract = self.runner.run(session, &extract).await;

        let install = Self::install_command(remote_dir, toolchain);
        let install = self.runner.run(session, &install).await;

        RemoteSetup { extract, install }
    }

    /// `npm install --production`，已解析时把 bin 目录加到 PATH 前面
    pub fn install_command(remote_dir: &str, toolchain: &Toolchain) -> ShellCommand {
        ShellCommand::new(toolchain.package_manager.program())
            .args(["install", "--production"])
            .current_dir(remote_dir)
            .prepend_path(toolchain.bin_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::services::testing::{HostEvent, ScriptedHost};
    use std::path::PathBuf;
    use std::time::Duration;

    const DB: &str = "/root/ZJU_Platform/server/database.sqlite";

    fn runner() -> CommandRunner {
        CommandRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_backup_precedes_upload() {
        let mut host = ScriptedHost::new();
        let journal = host.journal();
        let runner = runner();
        let transferer = Transferer::new(&runner);

        let (record, written) = transferer
            .backup_then_upload(&mut host, &PathBuf::from("server/database.sqlite"), DB)
            .await;
        assert!(written.is_ok());
        assert_eq!(record.outcome, BackupOutcome::Created);
        assert!(record.backup_path.starts_with(&format!("{}.bak_", DB)));

        let journal = journal.lock().unwrap();
        let copy = journal
            .position(|e| matches!(e, HostEvent::Exec(c) if c.starts_with("cp -p")))
            .unwrap();
        let upload = journal
            .position(|e| matches!(e, HostEvent::Upload { .. }))
            .unwrap();
        assert!(copy < upload);
    }

    #[tokio::test]
    async fn test_missing_state_file_is_nothing_to_protect() {
        let mut host = ScriptedHost::new().exit("test -e", 1);
        let journal = host.journal();
        let runner = runner();

        let record = Transferer::new(&runner).backup_at(&mut host, DB, 1700000000).await;
        assert_eq!(record.outcome, BackupOutcome::NothingToProtect);
        assert!(journal.lock().unwrap().commands_containing("cp ").is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_is_swallowed_and_upload_still_runs() {
        let mut host = ScriptedHost::new().respond(
            "cp -p",
            CommandResult::new("", "", "cp: No space left on device", 1),
        );
        let journal = host.journal();
        let runner = runner();

        let (record, written) = Transferer::new(&runner)
            .backup_then_upload(&mut host, &PathBuf::from("db"), DB)
            .await;
        assert!(written.is_ok());
        assert!(matches!(record.outcome, BackupOutcome::Failed(ref m) if m.contains("No space")));
        assert_eq!(journal.lock().unwrap().uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_timestamps_produce_distinct_backups() {
        let mut host = ScriptedHost::new();
        let runner = runner();
        let transferer = Transferer::new(&runner);

        let mut records = Vec::new();
        for ts in [1700000000, 1700000001, 1700000002] {
            records.push(transferer.backup_at(&mut host, DB, ts).await);
        }
        let paths: Vec<&str> = records.iter().map(|r| r.backup_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/root/ZJU_Platform/server/database.sqlite.bak_1700000000",
                "/root/ZJU_Platform/server/database.sqlite.bak_1700000001",
                "/root/ZJU_Platform/server/database.sqlite.bak_1700000002",
            ]
        );
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_identical_timestamps_overwrite_one_backup() {
        let mut host = ScriptedHost::new();
        let runner = runner();
        let transferer = Transferer::new(&runner);

        let first = transferer.backup_at(&mut host, DB, 1700000000).await;
        let second = transferer.backup_at(&mut host, DB, 1700000000).await;
        assert_eq!(first.backup_path, second.backup_path);
    }

    #[tokio::test]
    async fn test_upload_failure_propagates() {
        let mut host = ScriptedHost::new().fail_uploads("permission denied");
        let runner = runner();

        let err = Transferer::new(&runner)
            .upload(&mut host, &PathBuf::from("a.tar.gz"), "/root/app/a.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_remote_setup_runs_both_commands_even_if_extract_fails() {
        let mut host = ScriptedHost::new().exit("tar -xzf", 2);
        let journal = host.journal();
        let runner = runner();
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());

        let setup = Transferer::new(&runner)
            .remote_setup(&mut host, "/root/ZJU_Platform", "deploy_package.tar.gz", &toolchain)
            .await;
        assert!(!setup.success());
        assert_eq!(setup.extract.as_ref().unwrap().exit_code, 2);
        assert!(setup.install.as_ref().unwrap().success());

        let commands = journal.lock().unwrap().commands();
        assert_eq!(
            commands,
            vec![
                "cd /root/ZJU_Platform && tar -xzf deploy_package.tar.gz".to_string(),
                "cd /root/ZJU_Platform && npm install --production".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_hung_extract_still_installs() {
        let mut host = ScriptedHost::new().hang_on("tar -xzf");
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_millis(50));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());

        let setup = Transferer::new(&runner)
            .remote_setup(&mut host, "/root/ZJU_Platform", "deploy_package.tar.gz", &toolchain)
            .await;
        assert!(matches!(setup.extract, Err(DeployError::TimedOut { .. })));
        assert!(setup.install.as_ref().unwrap().success());
        assert_eq!(journal.lock().unwrap().commands_containing("npm install").len(), 1);

        let failures = setup.into_failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], DeployError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_verify_upload_detects_mismatch() {
        let package = Package {
            sources: vec![],
            excludes: vec![],
            extra_files: vec![],
            archive_path: PathBuf::from("deploy_package.tar.gz"),
            size_bytes: 3,
            members: vec![],
            sha256: "a".repeat(64),
        };
        let runner = runner();
        let transferer = Transferer::new(&runner);

        let mut host = ScriptedHost::new().stdout("sha256sum", &format!("{}  /r/p", "a".repeat(64)));
        assert_eq!(
            transferer.verify_upload(&mut host, &package, "/r/p").await.unwrap(),
            Verification::Matched
        );

        let mut host = ScriptedHost::new().stdout("sha256sum", &format!("{}  /r/p", "b".repeat(64)));
        let err = transferer
            .verify_upload(&mut host, &package, "/r/p")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Transfer { .. }));

        let mut host = ScriptedHost::new().exit("sha256sum", 127);
        assert!(matches!(
            transferer.verify_upload(&mut host, &package, "/r/p").await.unwrap(),
            Verification::Unavailable(_)
        ));
    }
}
