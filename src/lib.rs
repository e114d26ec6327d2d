//! XJP Remote Deploy - 单主机远程部署工具
//!
//! 本地构建打包，经 SSH/SFTP 推送到远端，修复远端 node 环境并通过 pm2 重启服务

pub mod error;
pub mod infra;
pub mod domain;
pub mod config;
pub mod services;

pub use config::DeployConfig;
pub use domain::{DeployVariant, RunReport};
pub use error::{DeployError, DeployResult, ErrorKind};
pub use infra::ssh::SshConnector;
pub use services::deploy::{DeploymentOrchestrator, ShellWorkspace};

/// 初始化日志
///
/// 过滤规则取自 `RUST_LOG`，默认 `info`
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
