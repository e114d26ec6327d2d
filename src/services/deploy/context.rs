//! 部署上下文
//!
//! 一次运行的执行上下文：阶段状态、诊断收集、取消令牌

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::deploy::{
    DeployStatus, DeployVariant, Diagnostic, Phase, RunReport, StageStatus,
};
use crate::domain::remote::BackupRecord;
use crate::error::{DeployError, DeployResult};

/// 部署执行上下文
///
/// 由编排器独占持有，运行结束时转换为 [`RunReport`]
pub struct RunContext {
    report: RunReport,
    /// 取消令牌
    cancel: CancellationToken,
    /// 当前阶段开始时的诊断数量
    mark: usize,
    /// 已经（或正在）上传、尚未清理的远端归档
    remote_archive: Option<String>,
}

impl RunContext {
    pub fn new(variant: DeployVariant, host: &str, cancel: CancellationToken) -> Self {
        Self {
            report: RunReport::new(variant, host),
            cancel,
            mark: 0,
            remote_archive: None,
        }
    }

    pub fn variant(&self) -> DeployVariant {
        self.report.variant
    }

    pub fn run_id(&self) -> &str {
        &self.report.run_id
    }

    /// 该变体是否包含此阶段
    pub fn has(&self, phase: Phase) -> bool {
        self.report.variant.phases().contains(&phase)
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 阶段之间的取消检查点
    pub fn checkpoint(&self) -> DeployResult<()> {
        if self.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 开始阶段
    pub fn begin(&mut self, phase: Phase) {
        info!(run_id = %self.report.run_id, phase = %phase, ">>> {}", phase.display_name());
        self.mark = self.report.diagnostics.len();
        if let Some(stage) = self.report.stage_mut(phase) {
            stage.start();
        }
    }

    /// 记录非致命错误
    pub fn note(&mut self, phase: Phase, err: &DeployError) {
        warn!(phase = %phase, kind = err.kind().as_str(), "{}", err);
        self.report
            .diagnostics
            .push(Diagnostic::from_error(phase, err));
    }

    /// 结束阶段：本阶段有诊断则为 Degraded，否则 Success
    pub fn settle(&mut self, phase: Phase, message: Option<String>) {
        let degraded = self.report.diagnostics[self.mark..]
            .iter()
            .any(|d| d.phase == phase);
        let status = if degraded {
            StageStatus::Degraded
        } else {
            StageStatus::Success
        };
        info!(phase = %phase, status = ?status, "<<< {}", phase.display_name());
        if let Some(stage) = self.report.stage_mut(phase) {
            stage.finish(status, message);
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, phase: Phase, reason: &str) {
        info!(phase = %phase, "Skipping: {}", reason);
        if let Some(stage) = self.report.stage_mut(phase) {
            stage.skip(Some(reason.to_string()));
        }
    }

    /// 致命失败：标记阶段并原样返回错误
    pub fn fail(&mut self, phase: Phase, err: DeployError) -> DeployError {
        error!(phase = %phase, kind = err.kind().as_str(), "{}", err);
        if let Some(stage) = self.report.stage_mut(phase) {
            stage.finish(StageStatus::Failed, Some(err.to_string()));
        }
        err
    }

    pub fn record_backup(&mut self, record: BackupRecord) {
        self.report.backups.push(record);
    }

    pub fn record_fallback_start(&mut self) {
        self.report.fallback_starts += 1;
    }

    /// 登记需要在远端删除的归档
    pub fn track_remote_archive(&mut self, path: impl Into<String>) {
        self.remote_archive = Some(path.into());
    }

    /// 取出待删除的远端归档，之后不再重复删除
    pub fn take_remote_archive(&mut self) -> Option<String> {
        self.remote_archive.take()
    }

    /// 完成运行，生成报告
    pub fn finish(mut self, result: DeployResult<()>) -> RunReport {
        let (status, err) = match result {
            Ok(()) => (DeployStatus::Success, None),
            Err(DeployError::Cancelled) => (DeployStatus::Cancelled, Some(DeployError::Cancelled)),
            Err(e) => (DeployStatus::Failed, Some(e)),
        };

        for stage in self.report.stages.iter_mut() {
            match stage.status {
                StageStatus::Running => {
                    let message = err.as_ref().map(|e| e.to_string());
                    stage.finish(StageStatus::Failed, message);
                }
                StageStatus::Pending => stage.skip(None),
                _ => {}
            }
        }

        self.report.complete(status, err.as_ref());

        match status {
            DeployStatus::Success => info!(
                run_id = %self.report.run_id,
                variant = self.report.variant.name(),
                diagnostics = self.report.diagnostics.len(),
                "=== Deployment SUCCESS ==="
            ),
            DeployStatus::Cancelled => {
                warn!(run_id = %self.report.run_id, "=== Deployment CANCELLED ===")
            }
            _ => error!(
                run_id = %self.report.run_id,
                error = self.report.error.as_deref().unwrap_or_default(),
                "=== Deployment FAILED ==="
            ),
        }

        self.report
    }
}
