//! XJP Remote Deploy - 单主机远程部署工具
//!
//! Usage:
//! - Full sync (build, git push, remote reset, db upload): `xjp-remote-deploy full`
//! - Direct archive push: `xjp-remote-deploy direct`
//! - Repair node/pm2 environment: `xjp-remote-deploy repair`
//! - Repair + nginx rewrite + restart: `xjp-remote-deploy restore`
//!
//! Settings come from `DEPLOY_*` environment variables, optionally seeded from `.env`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use xjp_remote_deploy::domain::{DeployStatus, StageStatus};
use xjp_remote_deploy::{
    init_tracing, DeployConfig, DeployVariant, DeploymentOrchestrator, RunReport, ShellWorkspace,
    SshConnector,
};

/// Push a web application to a single remote host over SSH
#[derive(Debug, Parser)]
#[command(name = "xjp-remote-deploy")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Remote host (overrides DEPLOY_HOST)
    #[arg(long, global = true, env = "DEPLOY_HOST")]
    host: Option<String>,

    /// SSH port
    #[arg(long, global = true, env = "DEPLOY_PORT")]
    port: Option<u16>,

    /// Remote project directory
    #[arg(long, global = true, env = "DEPLOY_REMOTE_DIR")]
    remote_dir: Option<String>,

    /// Port the application listens on
    #[arg(long, global = true, env = "DEPLOY_APP_PORT")]
    app_port: Option<u16>,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build, push to git, reset the remote checkout and upload the database
    Full,
    /// Build, package and upload an archive, then extract and restart
    Direct,
    /// Repair the remote node toolchain and recreate the pm2 entry
    Repair,
    /// Repair, rewrite the nginx site and restart everything
    Restore,
}

impl Command {
    fn variant(&self) -> DeployVariant {
        match self {
            Command::Full => DeployVariant::FullSync,
            Command::Direct => DeployVariant::Direct,
            Command::Repair => DeployVariant::Repair,
            Command::Restore => DeployVariant::Restore,
        }
    }
}

fn apply_overrides(config: &mut DeployConfig, cli: &Cli) {
    if let Some(ref host) = cli.host {
        config.target.host = host.clone();
        if config.proxy.server_name == "_" {
            config.proxy.server_name = host.clone();
        }
    }
    if let Some(port) = cli.port {
        config.target.port = port;
    }
    if let Some(ref dir) = cli.remote_dir {
        let dir = dir.trim_end_matches('/').to_string();
        // 数据库路径默认位于项目目录下，跟随移动
        if let Some(rest) = config.app.remote_db_path.strip_prefix(&config.app.remote_dir) {
            config.app.remote_db_path = format!("{}{}", dir, rest);
        }
        config.app.remote_dir = dir;
    }
    if let Some(port) = cli.app_port {
        config.app.port = port;
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run {} ({}) on {}", report.run_id, report.variant.name(), report.host);
    for stage in &report.stages {
        let mark = match stage.status {
            StageStatus::Success => "ok",
            StageStatus::Degraded => "!!",
            StageStatus::Failed => "xx",
            StageStatus::Skipped => "--",
            StageStatus::Pending | StageStatus::Running => "..",
        };
        let duration = stage
            .duration_ms
            .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        match stage.message {
            Some(ref message) => println!("  [{}] {}{}: {}", mark, stage.display_name, duration, message),
            None => println!("  [{}] {}{}", mark, stage.display_name, duration),
        }
    }

    if !report.diagnostics.is_empty() {
        println!("Diagnostics:");
        for d in &report.diagnostics {
            println!("  - [{}/{}] {}", d.phase, d.kind.as_str(), d.message);
        }
    }
    for backup in &report.backups {
        println!("Backup: {} -> {} ({:?})", backup.original_path, backup.backup_path, backup.outcome);
    }
    if report.fallback_starts > 0 {
        println!("Service started via fallback {} time(s)", report.fallback_starts);
    }

    match report.status {
        DeployStatus::Success => println!("Deployment succeeded"),
        DeployStatus::Cancelled => println!("Deployment cancelled"),
        _ => println!(
            "Deployment failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 需在解析参数前加载，clap 的 env 回退才能读到
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing();

    let mut config = DeployConfig::from_env();
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling deployment");
            ctrl_c.cancel();
        }
    });

    let local = ShellWorkspace::new(config.local.clone());
    let orchestrator =
        DeploymentOrchestrator::new(config, SshConnector, local).with_cancel_token(cancel);
    let report = orchestrator.run(cli.command.variant()).await;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("serialize run report")?;
        println!("{}", json);
    } else {
        print_summary(&report);
    }

    std::process::exit(report.exit_code());
}
