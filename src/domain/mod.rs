//! 领域模型模块
//!
//! 纯数据结构，不依赖 russh/tokio

pub mod deploy;
pub mod package;
pub mod remote;

// Re-exports for convenience
pub use deploy::{
    DeployStage, DeployStatus, DeployVariant, Diagnostic, Phase, RunReport, StageStatus,
};
pub use package::Package;
pub use remote::{
    BackupOutcome, BackupRecord, BinaryLocation, CommandResult, DiscoveryMethod, ServiceState,
    ServiceStatus,
};
