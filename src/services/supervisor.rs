//! pm2 进程管理
//!
//! 状态转换：
//! - Unknown → (可选 delete all) → Stopped → restart → Running
//! - restart 失败时仅回退一次：start 入口脚本 + 相同环境变量 → Running
//! - 成功后 `pm2 save` 持久化进程列表

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::remote::{CommandResult, ServiceState, ServiceStatus};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandRunner;
use crate::infra::shell::ShellCommand;
use crate::infra::ssh::RemoteHost;
use crate::services::resolver::Toolchain;

/// 服务进入 Running 的方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Restarted,
    /// restart 失败后由 start 拉起
    FallbackStarted,
}

/// 一次转换的结果
#[derive(Debug)]
pub struct TransitionOutcome {
    pub via: Transition,
    /// 非致命问题（delete all / save 失败），由调用方记入诊断
    pub warnings: Vec<DeployError>,
}

impl TransitionOutcome {
    pub fn fallback_started(&self) -> bool {
        self.via == Transition::FallbackStarted
    }
}

/// `pm2 jlist` 中我们关心的字段
#[derive(Debug, Deserialize)]
struct Pm2Process {
    name: String,
    #[serde(default)]
    pm2_env: Option<Pm2Env>,
}

#[derive(Debug, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: Option<String>,
}

pub struct ServiceController<'a> {
    runner: &'a CommandRunner,
    toolchain: &'a Toolchain,
    /// 远端项目目录，restart/start 都在此目录下执行
    work_dir: String,
    entry_point: String,
}

impl<'a> ServiceController<'a> {
    pub fn new(runner: &'a CommandRunner, toolchain: &'a Toolchain, app: &AppConfig) -> Self {
        Self {
            runner,
            toolchain,
            work_dir: app.remote_dir.clone(),
            entry_point: app.entry_point.clone(),
        }
    }

    fn pm2(&self) -> ShellCommand {
        ShellCommand::new(self.toolchain.supervisor.program())
            .current_dir(self.work_dir.as_str())
            .prepend_path(self.toolchain.bin_dir())
    }

    fn restart_command(&self, state: &ServiceState) -> ShellCommand {
        self.pm2()
            .envs(&state.env)
            .args(["restart", state.name.as_str(), "--update-env"])
    }

    fn start_command(&self, state: &ServiceState) -> ShellCommand {
        self.pm2().envs(&state.env).args([
            "start",
            self.entry_point.as_str(),
            "--name",
            state.name.as_str(),
            "--update-env",
        ])
    }

    /// 删除所有 pm2 条目；失败只记录
    pub async fn delete_all(&self, session: &mut dyn RemoteHost) -> Option<DeployError> {
        let cmd = self.pm2().args(["delete", "all"]);
        match self.runner.run(session, &cmd).await {
            Ok(result) if result.success() => None,
            Ok(result) => Some(command_error(result)),
            Err(e) => Some(e),
        }
    }

    /// 结束残留的运行时进程（例如直接占用端口的 node）
    ///
    /// 匹配模式写成 `[n]ode`，避免命中执行本命令的 shell 自身；没有匹配进程不算失败
    pub async fn kill_strays(&self, session: &mut dyn RemoteHost) -> Option<DeployError> {
        let runtime = self.toolchain.runtime.file_name.as_str();
        let mut chars = runtime.chars();
        let first = chars.next()?;
        let pattern = format!("[{}]{}", first, chars.as_str());

        info!(pattern = %pattern, "Killing stray runtime processes");
        let cmd = ShellCommand::new("pkill")
            .args(["-f", pattern.as_str()])
            .ignore_failure();
        match self.runner.run(session, &cmd).await {
            Ok(result) if result.success() => None,
            Ok(result) => Some(command_error(result)),
            Err(e) => Some(e),
        }
    }

    /// 重启服务，失败时回退到 start
    ///
    /// 非零退出与传输层错误（超时、断线）都算 restart 失败，只回退一次；
    /// 两者都失败时返回 `ServiceTransition`，消息中带上两次的原因
    pub async fn restart(
        &self,
        session: &mut dyn RemoteHost,
        state: &mut ServiceState,
        clean_slate: bool,
    ) -> DeployResult<TransitionOutcome> {
        let mut warnings = Vec::new();

        if clean_slate {
            info!("Removing all pm2 entries");
            if let Some(e) = self.delete_all(session).await {
                warn!(error = %e, "pm2 delete all failed, continuing");
                warnings.push(e);
            }
        }
        state.last_status = ServiceStatus::Stopped;

        info!(service = %state.name, port = state.port, "Restarting service");
        let restart_failure = attempt(self.runner, session, &self.restart_command(state)).await;

        let via = match restart_failure {
            None => Transition::Restarted,
            Some(restart_failure) => {
                warn!(
                    service = %state.name,
                    "Restart failed ({}), starting from {}",
                    restart_failure,
                    self.entry_point
                );
                if let Some(start_failure) =
                    attempt(self.runner, session, &self.start_command(state)).await
                {
                    state.last_status = ServiceStatus::Errored;
                    return Err(DeployError::ServiceTransition {
                        service: state.name.clone(),
                        message: format!("restart: {}; start: {}", restart_failure, start_failure),
                    });
                }
                Transition::FallbackStarted
            }
        };
        state.last_status = ServiceStatus::Running;
        info!(service = %state.name, ?via, "Service running");

        if let Err(e) = self.save(session).await {
            warn!(error = %e, "pm2 save failed");
            warnings.push(e);
        }

        Ok(TransitionOutcome { via, warnings })
    }

    /// 持久化 pm2 进程列表（重启主机后恢复）
    pub async fn save(&self, session: &mut dyn RemoteHost) -> DeployResult<()> {
        let result = self.runner.run(session, &self.pm2().arg("save")).await?;
        if result.success() {
            Ok(())
        } else {
            Err(command_error(result))
        }
    }

    /// 读取 `pm2 jlist` 更新服务的最近状态
    pub async fn observe(
        &self,
        session: &mut dyn RemoteHost,
        state: &mut ServiceState,
    ) -> DeployResult<ServiceStatus> {
        let result = self
            .runner
            .run_checked(session, &self.pm2().arg("jlist"))
            .await?;
        let status = parse_jlist(&result.stdout, &state.name);
        state.last_status = status;
        Ok(status)
    }
}

/// 执行一次转换命令，成功返回 None，否则返回失败原因
async fn attempt(
    runner: &CommandRunner,
    session: &mut dyn RemoteHost,
    cmd: &ShellCommand,
) -> Option<String> {
    match runner.run(session, cmd).await {
        Ok(result) if result.success() => None,
        Ok(result) => Some(result.failure_summary()),
        Err(e) => Some(e.to_string()),
    }
}

fn command_error(result: CommandResult) -> DeployError {
    DeployError::CommandExecution {
        command: result.command,
        exit_code: result.exit_code,
        stderr: result.stderr.trim().to_string(),
    }
}

/// 从 jlist 输出中找到服务状态
///
/// pm2 有时会在 JSON 前打印升级提示，因此从第一个 `[` 开始解析
fn parse_jlist(stdout: &str, name: &str) -> ServiceStatus {
    let Some(start) = stdout.find('[') else {
        return ServiceStatus::Unknown;
    };
    let processes: Vec<Pm2Process> = match serde_json::from_str(&stdout[start..]) {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "Could not parse pm2 jlist output");
            return ServiceStatus::Unknown;
        }
    };
    match processes.into_iter().find(|p| p.name == name) {
        Some(process) => process
            .pm2_env
            .and_then(|env| env.status)
            .map(|s| ServiceStatus::from_pm2(&s))
            .unwrap_or(ServiceStatus::Unknown),
        None => ServiceStatus::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::services::testing::ScriptedHost;
    use std::path::PathBuf;
    use std::time::Duration;

    fn app() -> AppConfig {
        AppConfig {
            remote_dir: "/root/ZJU_Platform".to_string(),
            name: "zju-platform".to_string(),
            port: 3001,
            entry_point: "./server/index.js".to_string(),
            ecosystem_file: "ecosystem.config.cjs".to_string(),
            local_db_path: PathBuf::from("server/database.sqlite"),
            remote_db_path: "/root/ZJU_Platform/server/database.sqlite".to_string(),
            extra_env: vec![],
        }
    }

    fn state() -> ServiceState {
        ServiceState::new("zju-platform", 3001).with_env("NODE_ENV", "production")
    }

    #[tokio::test]
    async fn test_restart_failure_falls_back_to_start_with_same_env() {
        let mut host = ScriptedHost::new().exit("pm2 restart", 1);
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());
        let mut state = state();

        let outcome = controller.restart(&mut host, &mut state, false).await.unwrap();
        assert!(outcome.fallback_started());
        assert_eq!(state.last_status, ServiceStatus::Running);

        let journal = journal.lock().unwrap();
        let starts = journal.commands_containing("pm2 start");
        assert_eq!(starts.len(), 1);
        assert_eq!(
            starts[0],
            "cd /root/ZJU_Platform && NODE_ENV=production PORT=3001 pm2 start ./server/index.js --name zju-platform --update-env"
        );
        let restart = &journal.commands_containing("pm2 restart")[0];
        assert!(restart.contains("PORT=3001"));
        assert!(restart.contains("NODE_ENV=production"));
        assert_eq!(journal.commands_containing("pm2 save").len(), 1);
    }

    #[tokio::test]
    async fn test_restart_success_issues_no_start() {
        let mut host = ScriptedHost::new();
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());

        let outcome = controller.restart(&mut host, &mut state(), false).await.unwrap();
        assert_eq!(outcome.via, Transition::Restarted);
        assert!(journal.lock().unwrap().commands_containing("pm2 start").is_empty());
        assert!(journal.lock().unwrap().commands_containing("delete").is_empty());
    }

    #[tokio::test]
    async fn test_both_failures_are_fatal() {
        let mut host = ScriptedHost::new()
            .exit("pm2 restart", 1)
            .respond("pm2 start", CommandResult::new("", "", "Script not found", 1));
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());
        let mut state = state();

        let err = controller.restart(&mut host, &mut state, false).await.unwrap_err();
        assert!(matches!(err, DeployError::ServiceTransition { ref message, .. } if message.contains("Script not found")));
        assert_eq!(state.last_status, ServiceStatus::Errored);
        // 失败时不保存
        assert!(journal.lock().unwrap().commands_containing("pm2 save").is_empty());
    }

    #[tokio::test]
    async fn test_hung_restart_falls_back_to_start() {
        let mut host = ScriptedHost::new().hang_on("pm2 restart");
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_millis(50));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());
        let mut state = state();

        let outcome = controller.restart(&mut host, &mut state, false).await.unwrap();
        assert!(outcome.fallback_started());
        assert_eq!(state.last_status, ServiceStatus::Running);
        assert_eq!(journal.lock().unwrap().commands_containing("pm2 start").len(), 1);
    }

    #[tokio::test]
    async fn test_hung_restart_and_failed_start_report_both_causes() {
        let mut host = ScriptedHost::new()
            .hang_on("pm2 restart")
            .respond("pm2 start", CommandResult::new("", "", "Script not found", 1));
        let runner = CommandRunner::new(Duration::from_millis(50));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());
        let mut state = state();

        let err = controller.restart(&mut host, &mut state, false).await.unwrap_err();
        match err {
            DeployError::ServiceTransition { ref message, .. } => {
                assert!(message.contains("timed out"));
                assert!(message.contains("Script not found"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(state.last_status, ServiceStatus::Errored);
    }

    #[tokio::test]
    async fn test_clean_slate_deletes_first_and_tolerates_failure() {
        let mut host = ScriptedHost::new().exit("pm2 delete all", 1).exit("pm2 save", 1);
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());

        let outcome = controller.restart(&mut host, &mut state(), true).await.unwrap();
        assert_eq!(outcome.warnings.len(), 2);

        let journal = journal.lock().unwrap();
        let commands = journal.commands();
        assert!(commands[0].ends_with("pm2 delete all"));
        assert!(commands[1].contains("pm2 restart"));
    }

    #[tokio::test]
    async fn test_kill_strays_does_not_match_own_shell() {
        let mut host = ScriptedHost::new();
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let toolchain = Toolchain::unresolved(&ResolverConfig::default());
        let controller = ServiceController::new(&runner, &toolchain, &app());

        assert!(controller.kill_strays(&mut host).await.is_none());
        assert_eq!(
            journal.lock().unwrap().commands(),
            vec!["pkill -f '[n]ode' || true".to_string()]
        );
    }

    #[tokio::test]
    async fn test_resolved_supervisor_uses_absolute_path() {
        let mut host = ScriptedHost::new();
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let mut toolchain = Toolchain::unresolved(&ResolverConfig::default());
        toolchain.runtime = crate::domain::remote::BinaryLocation::resolved(
            "runtime",
            "node",
            "/opt/node/bin/node",
            crate::domain::remote::DiscoveryMethod::FilesystemSearch,
        );
        toolchain.supervisor = toolchain.runtime.sibling("supervisor", "pm2");
        let controller = ServiceController::new(&runner, &toolchain, &app());

        controller.save(&mut host).await.unwrap();
        assert_eq!(
            journal.lock().unwrap().commands(),
            vec!["cd /root/ZJU_Platform && export PATH=/opt/node/bin:\"$PATH\" && /opt/node/bin/pm2 save".to_string()]
        );
    }

    #[test]
    fn test_parse_jlist() {
        let out = r#">>>> In-memory PM2 is out-of-date
[{"name":"zju-platform","pm_id":0,"pm2_env":{"status":"online"}},{"name":"other","pm2_env":{"status":"stopped"}}]"#;
        assert_eq!(parse_jlist(out, "zju-platform"), ServiceStatus::Running);
        assert_eq!(parse_jlist(out, "other"), ServiceStatus::Stopped);
        assert_eq!(parse_jlist(out, "missing"), ServiceStatus::Stopped);
        assert_eq!(parse_jlist("[]", "x"), ServiceStatus::Stopped);
        assert_eq!(parse_jlist("garbage", "x"), ServiceStatus::Unknown);
    }
}
