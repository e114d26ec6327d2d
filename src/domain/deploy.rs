//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::remote::BackupRecord;
use crate::error::{DeployError, ErrorKind};

/// 部署运行状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
            DeployStatus::Cancelled => "cancelled",
        }
    }
}

/// 阶段状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    /// 阶段失败但流水线继续
    Degraded,
    Failed,
    Skipped,
}

/// 部署流水线阶段
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    VcsSync,
    Package,
    Connect,
    RepairBinaries,
    Transfer,
    RemoteSetup,
    ReverseProxy,
    /// 停掉占用端口的 nginx 与残留 node 进程
    StopServices,
    ServiceRestart,
    /// 应用起来之后再校验并重启 nginx、放行端口
    ProxyReload,
    Verify,
    Cleanup,
}

impl Phase {
    /// 阶段标识
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::VcsSync => "vcs_sync",
            Phase::Package => "package",
            Phase::Connect => "connect",
            Phase::RepairBinaries => "repair_binaries",
            Phase::Transfer => "transfer",
            Phase::RemoteSetup => "remote_setup",
            Phase::ReverseProxy => "reverse_proxy",
            Phase::StopServices => "stop_services",
            Phase::ServiceRestart => "service_restart",
            Phase::ProxyReload => "proxy_reload",
            Phase::Verify => "verify",
            Phase::Cleanup => "cleanup",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Build => "Local Build",
            Phase::VcsSync => "Version Control Sync",
            Phase::Package => "Package Artifacts",
            Phase::Connect => "Connect",
            Phase::RepairBinaries => "Repair Binaries",
            Phase::Transfer => "Transfer",
            Phase::RemoteSetup => "Remote Setup",
            Phase::ReverseProxy => "Reverse Proxy",
            Phase::StopServices => "Stop Services",
            Phase::ServiceRestart => "Service Restart",
            Phase::ProxyReload => "Reload Reverse Proxy",
            Phase::Verify => "Verify",
            Phase::Cleanup => "Cleanup",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署变体
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployVariant {
    /// 构建 + git 推送 + 远端 fetch/reset + 数据库上传
    FullSync,
    /// 构建 + 打包 + SFTP 直传
    Direct,
    /// 仅修复远端运行环境并重建 pm2 条目
    Repair,
    /// 修复环境 + 重写反向代理 + 停止旧服务后全部重新拉起
    Restore,
}

impl DeployVariant {
    /// 获取变体名称
    pub fn name(&self) -> &'static str {
        match self {
            DeployVariant::FullSync => "full_sync",
            DeployVariant::Direct => "direct",
            DeployVariant::Repair => "repair",
            DeployVariant::Restore => "restore",
        }
    }

    /// 该变体依次执行的阶段
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            DeployVariant::FullSync => &[
                Phase::Build,
                Phase::VcsSync,
                Phase::Connect,
                Phase::Transfer,
                Phase::RemoteSetup,
                Phase::ServiceRestart,
                Phase::Verify,
                Phase::Cleanup,
            ],
            DeployVariant::Direct => &[
                Phase::Build,
                Phase::Package,
                Phase::Connect,
                Phase::Transfer,
                Phase::RemoteSetup,
                Phase::ServiceRestart,
                Phase::Verify,
                Phase::Cleanup,
            ],
            DeployVariant::Repair => &[
                Phase::Connect,
                Phase::RepairBinaries,
                Phase::ServiceRestart,
                Phase::Verify,
            ],
            DeployVariant::Restore => &[
                Phase::Connect,
                Phase::RepairBinaries,
                Phase::ReverseProxy,
                Phase::StopServices,
                Phase::ServiceRestart,
                Phase::ProxyReload,
                Phase::Verify,
            ],
        }
    }

    /// 是否在重启前清空所有 pm2 条目
    pub fn clean_slate(&self) -> bool {
        matches!(self, DeployVariant::Repair | DeployVariant::Restore)
    }
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    pub phase: Phase,
    /// 显示名称 (e.g., "Local Build", "Transfer")
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            display_name: phase.display_name().to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, status: StageStatus, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = status;
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 非致命错误记录
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostic {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(phase: Phase, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn from_error(phase: Phase, err: &DeployError) -> Self {
        Self::new(phase, err.kind(), err.to_string())
    }
}

/// 一次部署运行的完整报告
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub variant: DeployVariant,
    pub host: String,
    pub status: DeployStatus,
    pub stages: Vec<DeployStage>,
    pub diagnostics: Vec<Diagnostic>,
    pub backups: Vec<BackupRecord>,
    /// restart 失败后回退到 start 的次数
    pub fallback_starts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(variant: DeployVariant, host: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            variant,
            host: host.into(),
            status: DeployStatus::Running,
            stages: variant.phases().iter().copied().map(DeployStage::new).collect(),
            diagnostics: Vec::new(),
            backups: Vec::new(),
            fallback_starts: 0,
            error: None,
            error_kind: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 获取阶段（可变）
    pub fn stage_mut(&mut self, phase: Phase) -> Option<&mut DeployStage> {
        self.stages.iter_mut().find(|s| s.phase == phase)
    }

    pub fn stage(&self, phase: Phase) -> Option<&DeployStage> {
        self.stages.iter().find(|s| s.phase == phase)
    }

    /// 设置运行完成
    pub fn complete(&mut self, status: DeployStatus, error: Option<&DeployError>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if let Some(err) = error {
            self.error = Some(err.to_string());
            self.error_kind = Some(err.kind());
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Success
    }

    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self.status {
            DeployStatus::Success => 0,
            DeployStatus::Cancelled => 130,
            DeployStatus::Running | DeployStatus::Failed => match self.error_kind {
                Some(ErrorKind::Config) => 2,
                _ => 1,
            },
        }
    }
}
