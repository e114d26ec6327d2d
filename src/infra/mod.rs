//! 基础设施模块
//!
//! 封装外部依赖（SSH 会话、命令执行、shell 转义）

pub mod command;
pub mod shell;
pub mod ssh;

pub use command::{CommandRunner, LocalRunner};
pub use shell::ShellCommand;
pub use ssh::{Connector, RemoteHost, RemoteSession, SshConnector};
