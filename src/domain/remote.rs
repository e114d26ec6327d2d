//! 远程主机相关领域模型

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 远程命令执行结果
///
/// 构造后不可变；非零退出码不视为错误，由调用方解释
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// 远端进程未上报退出码时为 -1
    pub exit_code: i32,
}

impl CommandResult {
    pub fn new(
        command: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        Self {
            command: command.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// 退出码为 0 即成功
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// 去除首尾空白的 stdout
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// 用于日志的简短错误描述
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, stderr)
        }
    }
}

/// 二进制发现方式
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    ProfileSourced,
    FilesystemSearch,
    Unresolved,
}

/// 远端二进制位置
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BinaryLocation {
    /// 逻辑名称 (e.g. "runtime", "package-manager", "supervisor")
    pub name: String,
    /// 文件名 (e.g. "node", "npm", "pm2")
    pub file_name: String,
    /// 解析到的绝对路径，未解析时为 None
    pub path: Option<String>,
    pub method: DiscoveryMethod,
}

impl BinaryLocation {
    pub fn resolved(
        name: impl Into<String>,
        file_name: impl Into<String>,
        path: impl Into<String>,
        method: DiscoveryMethod,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            path: Some(path.into()),
            method,
        }
    }

    pub fn unresolved(name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            path: None,
            method: DiscoveryMethod::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.path.is_some()
    }

    /// 命令中使用的程序名：已解析时为绝对路径，否则为裸文件名
    pub fn program(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.file_name)
    }

    /// 所在目录
    pub fn parent_dir(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        match path.rsplit_once('/') {
            Some(("", _)) => Some("/"),
            Some((dir, _)) => Some(dir),
            None => None,
        }
    }

    /// 以同目录下另一个文件名派生兄弟二进制
    pub fn sibling(&self, name: impl Into<String>, file_name: &str) -> BinaryLocation {
        match self.parent_dir() {
            Some(dir) => {
                let path = if dir == "/" {
                    format!("/{}", file_name)
                } else {
                    format!("{}/{}", dir, file_name)
                };
                BinaryLocation::resolved(name, file_name, path, self.method)
            }
            None => BinaryLocation::unresolved(name, file_name),
        }
    }
}

/// 备份结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum BackupOutcome {
    Created,
    /// 源文件不存在，无需保护
    NothingToProtect,
    /// 备份失败（已忽略）
    Failed(String),
}

/// 远端备份记录
///
/// 核心流程不会回读，仅作为运维恢复用的带外产物
#[derive(Clone, Debug, Serialize)]
pub struct BackupRecord {
    pub original_path: String,
    pub backup_path: String,
    pub timestamp: i64,
    pub outcome: BackupOutcome,
}

impl BackupRecord {
    /// 备份文件后缀
    pub const SUFFIX: &'static str = ".bak_";

    /// 计算备份路径：原路径 + ".bak_" + unix 秒
    pub fn backup_path_for(original: &str, timestamp: i64) -> String {
        format!("{}{}{}", original, Self::SUFFIX, timestamp)
    }
}

/// pm2 中服务的运行状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Unknown,
    Stopped,
    Running,
    Errored,
}

impl ServiceStatus {
    /// 解析 pm2 jlist 中的 `pm2_env.status`
    pub fn from_pm2(status: &str) -> Self {
        match status {
            "online" | "launching" => ServiceStatus::Running,
            "stopped" | "stopping" => ServiceStatus::Stopped,
            "errored" | "one-launch-status" => ServiceStatus::Errored,
            _ => ServiceStatus::Unknown,
        }
    }
}

/// 受 pm2 管理的服务状态
#[derive(Clone, Debug, Serialize)]
pub struct ServiceState {
    pub name: String,
    pub port: u16,
    /// 传给 restart/start 的环境变量覆盖
    pub env: BTreeMap<String, String>,
    pub last_status: ServiceStatus,
}

impl ServiceState {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), port.to_string());
        Self {
            name: name.into(),
            port,
            env,
            last_status: ServiceStatus::Unknown,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
