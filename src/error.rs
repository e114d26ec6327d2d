//! 统一错误处理
//!
//! `DeployError` 覆盖部署流水线中所有失败类型；是否致命由编排器按阶段决定，
//! 非致命错误以 `Diagnostic` 形式收集到运行报告中

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 错误类别（用于诊断信息与报告）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    CommandExecution,
    Packaging,
    Backup,
    Resolution,
    ServiceTransition,
    Transfer,
    Build,
    VcsSync,
    TimedOut,
    Cancelled,
    Config,
}

impl ErrorKind {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::CommandExecution => "command_execution",
            ErrorKind::Packaging => "packaging",
            ErrorKind::Backup => "backup",
            ErrorKind::Resolution => "resolution",
            ErrorKind::ServiceTransition => "service_transition",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Build => "build",
            ErrorKind::VcsSync => "vcs_sync",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        }
    }
}

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 会话建立失败（不重试）
    #[error("Failed to connect to {host}:{port}: {message}")]
    Connectivity {
        host: String,
        port: u16,
        message: String,
    },

    /// 远程命令非零退出（仅当调用方认定为致命时才会构造）
    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    CommandExecution {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Packaging failed: {0}")]
    Packaging(String),

    #[error("Backup of {path} failed: {message}")]
    Backup { path: String, message: String },

    #[error("Could not locate `{0}` on the remote host")]
    Resolution(String),

    #[error("Service `{service}` could not be restarted or started: {message}")]
    ServiceTransition { service: String, message: String },

    #[error("Transfer to {remote_path} failed: {message}")]
    Transfer {
        remote_path: String,
        message: String,
    },

    #[error("Local build failed: {0}")]
    Build(String),

    #[error("Version control sync failed: {0}")]
    VcsSync(String),

    #[error("`{command}` timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DeployError {
    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Connectivity { .. } => ErrorKind::Connectivity,
            DeployError::CommandExecution { .. } => ErrorKind::CommandExecution,
            DeployError::Packaging(_) => ErrorKind::Packaging,
            DeployError::Backup { .. } => ErrorKind::Backup,
            DeployError::Resolution(_) => ErrorKind::Resolution,
            DeployError::ServiceTransition { .. } => ErrorKind::ServiceTransition,
            DeployError::Transfer { .. } => ErrorKind::Transfer,
            DeployError::Build(_) => ErrorKind::Build,
            DeployError::VcsSync(_) => ErrorKind::VcsSync,
            DeployError::TimedOut { .. } => ErrorKind::TimedOut,
            DeployError::Cancelled => ErrorKind::Cancelled,
            DeployError::Config(_) => ErrorKind::Config,
        }
    }

    /// 创建连接错误
    pub fn connectivity(host: &str, port: u16, message: impl ToString) -> Self {
        Self::Connectivity {
            host: host.to_string(),
            port,
            message: message.to_string(),
        }
    }

    /// 创建传输错误
    pub fn transfer(remote_path: &str, message: impl ToString) -> Self {
        Self::Transfer {
            remote_path: remote_path.to_string(),
            message: message.to_string(),
        }
    }

    /// 创建打包错误
    pub fn packaging(message: impl Into<String>) -> Self {
        Self::Packaging(message.into())
    }
}

/// 便捷类型别名
pub type DeployResult<T> = Result<T, DeployError>;
