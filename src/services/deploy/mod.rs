//! 部署编排
//!
//! 按变体依次执行阶段，并按阶段决定失败是否终止：
//! - 致命：Build / Package / Connect / Transfer / ServiceRestart（回退 start 也失败时）
//! - 非致命：其余阶段，记入诊断后继续
//!
//! 会话一旦建立，无论哪个阶段失败都只关闭一次；本地归档在所有路径上都会删除，
//! 已上传的远端归档在致命失败后也会尽力删除（取消时直接关闭会话）

pub mod context;
pub mod local;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DeployConfig;
use crate::domain::deploy::{DeployVariant, Phase, RunReport};
use crate::domain::package::Package;
use crate::domain::remote::{BackupOutcome, ServiceState, ServiceStatus};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandRunner;
use crate::infra::shell::{quote, ShellCommand};
use crate::infra::ssh::{Connector, RemoteHost};
use crate::services::packager::{PackageSpec, Packager};
use crate::services::proxy::ReverseProxy;
use crate::services::resolver::{BinaryResolver, LinkAction, Toolchain};
use crate::services::supervisor::ServiceController;
use crate::services::transfer::{Transferer, Verification};

pub use context::RunContext;
pub use local::{LocalActions, ShellWorkspace};

/// 部署编排器
///
/// 配置在构造时注入；一次 `run` 独占一个会话
pub struct DeploymentOrchestrator<C: Connector, L: LocalActions> {
    config: DeployConfig,
    connector: C,
    local: L,
    runner: CommandRunner,
    cancel: CancellationToken,
}

impl<C: Connector, L: LocalActions> DeploymentOrchestrator<C, L> {
    pub fn new(config: DeployConfig, connector: C, local: L) -> Self {
        let runner = CommandRunner::new(config.command_timeout);
        Self {
            config,
            connector,
            local,
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// 使用外部取消令牌（Ctrl-C）
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 执行一次部署，总是返回报告
    pub async fn run(&self, variant: DeployVariant) -> RunReport {
        let mut ctx = RunContext::new(variant, &self.config.target.host, self.cancel.clone());
        info!(
            run_id = %ctx.run_id(),
            variant = variant.name(),
            target = %self.config.target.address(),
            "=== Starting deployment ==="
        );

        let mut package = None;
        let result = self.execute(&mut ctx, &mut package).await;

        if let Some(ref package) = package {
            if let Err(e) = Packager::remove(package) {
                warn!(archive = %package.archive_path.display(), error = %e, "Failed to remove local archive");
            }
        }

        ctx.finish(result)
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        package: &mut Option<Package>,
    ) -> DeployResult<()> {
        if ctx.has(Phase::Build) {
            self.build(ctx).await?;
        }
        if ctx.has(Phase::VcsSync) {
            self.push_local(ctx).await?;
        }
        if ctx.has(Phase::Package) {
            *package = Some(self.package(ctx).await?);
        }

        ctx.checkpoint()?;
        ctx.begin(Phase::Connect);
        let mut session = match self.connector.open(&self.config.target).await {
            Ok(session) => session,
            Err(e) => return Err(ctx.fail(Phase::Connect, e)),
        };
        ctx.settle(Phase::Connect, Some(self.config.target.address()));

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            result = self.remote(ctx, &mut session, package.as_ref()) => result,
            _ = cancel.cancelled() => Err(DeployError::Cancelled),
        };

        if let Err(ref e) = result {
            if !matches!(e, DeployError::Cancelled) {
                if let Some(remote_archive) = ctx.take_remote_archive() {
                    info!(archive = %remote_archive, "Removing remote archive after failure");
                    let rm = ShellCommand::new("rm").args(["-f", remote_archive.as_str()]);
                    self.best_effort(ctx, Phase::Cleanup, &mut session, &rm).await;
                }
            }
        }

        session.close().await;
        result
    }

    // ========================================================================
    // 本地阶段
    // ========================================================================

    async fn build(&self, ctx: &mut RunContext) -> DeployResult<()> {
        ctx.checkpoint()?;
        ctx.begin(Phase::Build);
        match self.local.build(&self.cancel).await {
            Ok(()) => {
                ctx.settle(Phase::Build, None);
                Ok(())
            }
            Err(e) => Err(ctx.fail(Phase::Build, e)),
        }
    }

    /// 本地提交并推送；失败只记录（常见情况是没有可推送的内容）
    async fn push_local(&self, ctx: &mut RunContext) -> DeployResult<()> {
        ctx.checkpoint()?;
        ctx.begin(Phase::VcsSync);
        if let Err(e) = self.local.sync_vcs().await {
            ctx.note(Phase::VcsSync, &e);
        }
        ctx.settle(Phase::VcsSync, None);
        Ok(())
    }

    async fn package(&self, ctx: &mut RunContext) -> DeployResult<Package> {
        ctx.checkpoint()?;
        ctx.begin(Phase::Package);

        let base_dir = self.local.project_dir().to_path_buf();
        let spec = PackageSpec {
            output: base_dir.join(&self.config.package.archive_name),
            sources: self.config.package.sources.iter().map(Into::into).collect(),
            excludes: self.config.package.excludes.clone(),
            extra_files: self.config.package.extra_files.iter().map(Into::into).collect(),
            base_dir,
        };

        match Packager::build(spec).await {
            Ok(package) => {
                ctx.settle(
                    Phase::Package,
                    Some(format!(
                        "{} ({} files, {:.2} MB)",
                        package.file_name(),
                        package.members.len(),
                        package.size_mb()
                    )),
                );
                Ok(package)
            }
            Err(e) => Err(ctx.fail(Phase::Package, e)),
        }
    }

    // ========================================================================
    // 远端阶段
    // ========================================================================

    async fn remote(
        &self,
        ctx: &mut RunContext,
        session: &mut C::Session,
        package: Option<&Package>,
    ) -> DeployResult<()> {
        let session: &mut dyn RemoteHost = session;

        let toolchain = if ctx.has(Phase::RepairBinaries) {
            ctx.checkpoint()?;
            self.repair_binaries(ctx, session).await
        } else {
            Toolchain::unresolved(&self.config.resolver)
        };

        if ctx.has(Phase::Transfer) {
            ctx.checkpoint()?;
            self.transfer(ctx, session, package).await?;
        }

        if ctx.has(Phase::RemoteSetup) {
            ctx.checkpoint()?;
            self.remote_setup(ctx, session, package, &toolchain).await;
        }

        let proxy = ReverseProxy::new(&self.runner, &self.config.proxy);
        let controller = ServiceController::new(&self.runner, &toolchain, &self.config.app);
        let mut state = self.service_state();

        if ctx.has(Phase::ReverseProxy) {
            ctx.checkpoint()?;
            self.reverse_proxy(ctx, session, &proxy).await;
        }

        if ctx.has(Phase::StopServices) {
            ctx.checkpoint()?;
            ctx.begin(Phase::StopServices);
            let stopped = [proxy.stop(session).await, controller.kill_strays(session).await];
            for e in stopped.iter().flatten() {
                ctx.note(Phase::StopServices, e);
            }
            ctx.settle(Phase::StopServices, None);
        }

        if ctx.has(Phase::ServiceRestart) {
            ctx.checkpoint()?;
            ctx.begin(Phase::ServiceRestart);
            match controller
                .restart(session, &mut state, ctx.variant().clean_slate())
                .await
            {
                Ok(outcome) => {
                    if outcome.fallback_started() {
                        ctx.record_fallback_start();
                    }
                    for warning in &outcome.warnings {
                        ctx.note(Phase::ServiceRestart, warning);
                    }
                    let message = if outcome.fallback_started() {
                        format!("{} started from {}", state.name, self.config.app.entry_point)
                    } else {
                        format!("{} restarted", state.name)
                    };
                    ctx.settle(Phase::ServiceRestart, Some(message));
                }
                Err(e) => return Err(ctx.fail(Phase::ServiceRestart, e)),
            }
        }

        if ctx.has(Phase::ProxyReload) {
            ctx.checkpoint()?;
            ctx.begin(Phase::ProxyReload);
            let mut errors = proxy.reload(session).await;
            errors.extend(proxy.open_firewall(session).await);
            for e in &errors {
                ctx.note(Phase::ProxyReload, e);
            }
            ctx.settle(Phase::ProxyReload, None);
        }

        if ctx.has(Phase::Verify) {
            ctx.checkpoint()?;
            self.verify(ctx, session, &controller, &mut state).await;
        }

        if ctx.has(Phase::Cleanup) {
            ctx.checkpoint()?;
            self.cleanup(ctx, session).await;
        }

        Ok(())
    }

    /// 定位 node 并修复软链接；找不到时退化为裸命令名
    async fn repair_binaries(&self, ctx: &mut RunContext, session: &mut dyn RemoteHost) -> Toolchain {
        ctx.begin(Phase::RepairBinaries);
        let resolver = BinaryResolver::new(&self.config.resolver, &self.runner);

        let toolchain = match resolver.resolve(session).await {
            Ok(toolchain) => {
                for link in toolchain.failed_links() {
                    if let LinkAction::Failed(ref message) = link.action {
                        ctx.note(
                            Phase::RepairBinaries,
                            &DeployError::CommandExecution {
                                command: format!("ln -sf {} {}", link.target, link.link),
                                exit_code: 1,
                                stderr: message.clone(),
                            },
                        );
                    }
                }
                toolchain
            }
            Err(e) => {
                ctx.note(Phase::RepairBinaries, &e);
                Toolchain::unresolved(&self.config.resolver)
            }
        };

        let message = match toolchain.runtime.path {
            Some(ref path) => format!("{} ({:?}, {} links)", path, toolchain.runtime.method, toolchain.links.len()),
            None => format!("{} unresolved", toolchain.runtime.file_name),
        };
        ctx.settle(Phase::RepairBinaries, Some(message));
        toolchain
    }

    async fn transfer(
        &self,
        ctx: &mut RunContext,
        session: &mut dyn RemoteHost,
        package: Option<&Package>,
    ) -> DeployResult<()> {
        ctx.begin(Phase::Transfer);
        let transferer = Transferer::new(&self.runner);
        let app = &self.config.app;

        match package {
            Some(package) => {
                let mkdir = ShellCommand::new("mkdir").args(["-p", app.remote_dir.as_str()]);
                self.best_effort(ctx, Phase::Transfer, session, &mkdir).await;

                // 解压会覆盖数据库，先备份
                let record = transferer.backup(session, &app.remote_db_path).await;
                self.note_backup(ctx, &record.outcome, &record.original_path);
                ctx.record_backup(record);

                let remote_archive = app.remote_path(&package.file_name());
                // 上传中途失败也可能留下残缺文件
                ctx.track_remote_archive(remote_archive.as_str());
                if let Err(e) = transferer
                    .upload(session, &package.archive_path, &remote_archive)
                    .await
                {
                    return Err(ctx.fail(Phase::Transfer, e));
                }

                match transferer.verify_upload(session, package, &remote_archive).await {
                    Ok(Verification::Matched) => {}
                    Ok(Verification::Unavailable(reason)) => ctx.note(
                        Phase::Transfer,
                        &DeployError::transfer(&remote_archive, format!("checksum unavailable: {}", reason)),
                    ),
                    Err(e) => return Err(ctx.fail(Phase::Transfer, e)),
                }

                ctx.settle(
                    Phase::Transfer,
                    Some(format!("{} -> {}", package.file_name(), remote_archive)),
                );
            }
            None => {
                self.sync_remote_repo(ctx, session).await;

                let local_db = local::project_path(&self.local, &app.local_db_path);
                if local_db.exists() {
                    let (record, written) = transferer
                        .backup_then_upload(session, &local_db, &app.remote_db_path)
                        .await;
                    self.note_backup(ctx, &record.outcome, &record.original_path);
                    ctx.record_backup(record);
                    if let Err(e) = written {
                        return Err(ctx.fail(Phase::Transfer, e));
                    }
                } else {
                    info!(path = %local_db.display(), "No local database, skipping upload");
                }

                ctx.settle(Phase::Transfer, None);
            }
        }

        Ok(())
    }

    /// 远端仓库同步到本地推送的分支：fetch + reset，失败时退回 pull
    async fn sync_remote_repo(&self, ctx: &mut RunContext, session: &mut dyn RemoteHost) {
        let dir = self.config.app.remote_dir.as_str();
        let remote = self.config.local.git_remote.as_str();
        let branch = self.config.local.git_branch.as_str();

        let safe = ShellCommand::new("git")
            .args(["config", "--global", "--add", "safe.directory", dir])
            .ignore_failure();
        self.best_effort(ctx, Phase::Transfer, session, &safe).await;

        let reset = ShellCommand::raw(format!(
            "git fetch {remote} && git reset --hard {target}",
            remote = quote(remote),
            target = quote(&format!("{}/{}", remote, branch)),
        ))
        .current_dir(dir);

        let synced = match self.runner.run(session, &reset).await {
            Ok(result) if result.success() => true,
            Ok(result) => {
                warn!("fetch/reset failed ({}), trying pull", result.failure_summary());
                false
            }
            Err(e) => {
                warn!(error = %e, "fetch/reset failed, trying pull");
                false
            }
        };
        if synced {
            return;
        }

        let pull = ShellCommand::new("git")
            .args(["pull", remote, branch])
            .current_dir(dir);
        match self.runner.run(session, &pull).await {
            Ok(result) if result.success() => {}
            Ok(result) => ctx.note(
                Phase::Transfer,
                &DeployError::VcsSync(format!("remote git pull: {}", result.failure_summary())),
            ),
            Err(e) => ctx.note(Phase::Transfer, &DeployError::VcsSync(e.to_string())),
        }
    }

    async fn remote_setup(
        &self,
        ctx: &mut RunContext,
        session: &mut dyn RemoteHost,
        package: Option<&Package>,
        toolchain: &Toolchain,
    ) {
        ctx.begin(Phase::RemoteSetup);
        let transferer = Transferer::new(&self.runner);
        let dir = self.config.app.remote_dir.as_str();

        match package {
            Some(package) => {
                let setup = transferer
                    .remote_setup(session, dir, &package.file_name(), toolchain)
                    .await;
                for e in setup.into_failures() {
                    ctx.note(Phase::RemoteSetup, &e);
                }
            }
            None => {
                let install = Transferer::install_command(dir, toolchain);
                self.best_effort(ctx, Phase::RemoteSetup, session, &install).await;
            }
        }

        ctx.settle(Phase::RemoteSetup, None);
    }

    /// 写入并启用站点；nginx 的重启放在应用启动之后
    async fn reverse_proxy(
        &self,
        ctx: &mut RunContext,
        session: &mut dyn RemoteHost,
        proxy: &ReverseProxy<'_>,
    ) {
        ctx.begin(Phase::ReverseProxy);

        let errors = proxy.install(session, self.config.app.port).await;
        for e in &errors {
            ctx.note(Phase::ReverseProxy, e);
        }

        ctx.settle(
            Phase::ReverseProxy,
            Some(format!(
                ":{} -> 127.0.0.1:{}",
                self.config.proxy.listen_port, self.config.app.port
            )),
        );
    }

    /// 检查 pm2 状态并探测应用端口；结果仅供参考
    async fn verify(
        &self,
        ctx: &mut RunContext,
        session: &mut dyn RemoteHost,
        controller: &ServiceController<'_>,
        state: &mut ServiceState,
    ) {
        ctx.begin(Phase::Verify);

        match controller.observe(session, state).await {
            Ok(ServiceStatus::Running) => {}
            Ok(status) => ctx.note(
                Phase::Verify,
                &DeployError::ServiceTransition {
                    service: state.name.clone(),
                    message: format!("observed status {:?}", status),
                },
            ),
            Err(e) => ctx.note(Phase::Verify, &e),
        }

        let url = format!("http://127.0.0.1:{}/", state.port);
        let check = ShellCommand::new("curl").args([
            "-s",
            "-o",
            "/dev/null",
            "-w",
            "%{http_code}",
            url.as_str(),
        ]);
        let http_status = match self.runner.run(session, &check).await {
            Ok(result) if result.success() && result.stdout_trimmed() != "000" => {
                Some(result.stdout_trimmed().to_string())
            }
            Ok(result) => {
                ctx.note(
                    Phase::Verify,
                    &DeployError::CommandExecution {
                        command: result.command.clone(),
                        exit_code: result.exit_code,
                        stderr: format!("{} not reachable", url),
                    },
                );
                None
            }
            Err(e) => {
                ctx.note(Phase::Verify, &e);
                None
            }
        };

        let message = format!(
            "{}: {:?}, HTTP {}",
            state.name,
            state.last_status,
            http_status.as_deref().unwrap_or("-")
        );
        ctx.settle(Phase::Verify, Some(message));
    }

    async fn cleanup(&self, ctx: &mut RunContext, session: &mut dyn RemoteHost) {
        let Some(remote_archive) = ctx.take_remote_archive() else {
            ctx.skip(Phase::Cleanup, "no archive to remove");
            return;
        };

        ctx.begin(Phase::Cleanup);
        let rm = ShellCommand::new("rm").args(["-f", remote_archive.as_str()]);
        self.best_effort(ctx, Phase::Cleanup, session, &rm).await;
        ctx.settle(Phase::Cleanup, Some(format!("removed {}", remote_archive)));
    }

    // ========================================================================
    // 辅助
    // ========================================================================

    /// 执行命令，失败只记入诊断
    async fn best_effort(
        &self,
        ctx: &mut RunContext,
        phase: Phase,
        session: &mut dyn RemoteHost,
        cmd: &ShellCommand,
    ) {
        match self.runner.run(session, cmd).await {
            Ok(result) if result.success() => {}
            Ok(result) => ctx.note(
                phase,
                &DeployError::CommandExecution {
                    stderr: result.stderr.trim().to_string(),
                    exit_code: result.exit_code,
                    command: result.command,
                },
            ),
            Err(e) => ctx.note(phase, &e),
        }
    }

    fn note_backup(&self, ctx: &mut RunContext, outcome: &BackupOutcome, path: &str) {
        if let BackupOutcome::Failed(ref message) = outcome {
            ctx.note(
                Phase::Transfer,
                &DeployError::Backup {
                    path: path.to_string(),
                    message: message.clone(),
                },
            );
        }
    }

    fn service_state(&self) -> ServiceState {
        let app = &self.config.app;
        app.extra_env
            .iter()
            .fold(ServiceState::new(app.name.as_str(), app.port), |state, (k, v)| {
                state.with_env(k.as_str(), v.as_str())
            })
    }
}
