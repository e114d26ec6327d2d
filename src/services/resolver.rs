//! 远端二进制定位与 PATH 修复
//!
//! 非交互式 SSH 会话通常拿不到 nvm 一类安装器追加的 PATH。
//! 先找到 node，再从同一目录派生 npm / npx / pm2，并软链接到系统 bin 目录

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ResolverConfig;
use crate::domain::remote::{BinaryLocation, DiscoveryMethod};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandRunner;
use crate::infra::shell::{quote, ShellCommand};
use crate::infra::ssh::RemoteHost;

/// 查询前依次 source 的 profile 文件
const PROFILE_FILES: &[&str] = &["~/.bashrc", "~/.profile", "~/.bash_profile"];

/// 单个软链接的修复结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "action", content = "message", rename_all = "snake_case")]
pub enum LinkAction {
    Created,
    AlreadyCorrect,
    Failed(String),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SymlinkRepair {
    pub link: String,
    pub target: String,
    pub action: LinkAction,
}

/// 一次运行中远端命令使用的二进制集合
#[derive(Clone, Debug, Serialize)]
pub struct Toolchain {
    pub runtime: BinaryLocation,
    pub package_manager: BinaryLocation,
    pub supervisor: BinaryLocation,
    pub extras: Vec<BinaryLocation>,
    pub links: Vec<SymlinkRepair>,
}

impl Toolchain {
    /// 全部保持裸命令名
    pub fn unresolved(config: &ResolverConfig) -> Self {
        Self::derive(
            BinaryLocation::unresolved("runtime", config.runtime.as_str()),
            config,
        )
    }

    fn derive(runtime: BinaryLocation, config: &ResolverConfig) -> Self {
        let package_manager = runtime.sibling("package-manager", &config.package_manager);
        let supervisor = runtime.sibling("supervisor", &config.supervisor);
        let extras = config
            .extra_siblings
            .iter()
            .map(|name| runtime.sibling(name.as_str(), name))
            .collect();
        Self {
            runtime,
            package_manager,
            supervisor,
            extras,
            links: Vec::new(),
        }
    }

    /// node 所在目录；加到 PATH 前面，pm2 这类 `#!/usr/bin/env node` 脚本才能找到解释器
    pub fn bin_dir(&self) -> Option<&str> {
        self.runtime.parent_dir()
    }

    pub fn is_resolved(&self) -> bool {
        self.runtime.is_resolved()
    }

    fn linkable(&self) -> impl Iterator<Item = &BinaryLocation> {
        std::iter::once(&self.runtime)
            .chain(std::iter::once(&self.package_manager))
            .chain(self.extras.iter())
            .chain(std::iter::once(&self.supervisor))
    }

    pub fn failed_links(&self) -> impl Iterator<Item = &SymlinkRepair> {
        self.links
            .iter()
            .filter(|l| matches!(l.action, LinkAction::Failed(_)))
    }
}

/// 定位运行时并通过软链接修复 PATH
pub struct BinaryResolver<'a> {
    config: &'a ResolverConfig,
    runner: &'a CommandRunner,
}

impl<'a> BinaryResolver<'a> {
    pub fn new(config: &'a ResolverConfig, runner: &'a CommandRunner) -> Self {
        Self { config, runner }
    }

    /// 定位运行时并派生兄弟二进制；只有靠文件系统搜索找到时才修复软链接
    ///
    /// 找不到时返回 `DeployError::Resolution`，调用方退回 [`Toolchain::unresolved`]
    pub async fn resolve(&self, session: &mut dyn RemoteHost) -> DeployResult<Toolchain> {
        let runtime = self.locate(session).await?;
        if !runtime.is_resolved() {
            warn!(binary = %self.config.runtime, "Runtime not found, commands stay unqualified");
            return Err(DeployError::Resolution(self.config.runtime.clone()));
        }

        let mut toolchain = Toolchain::derive(runtime, self.config);
        if toolchain.runtime.method == DiscoveryMethod::FilesystemSearch {
            toolchain.links = self.repair_links(session, &toolchain).await?;
        }
        Ok(toolchain)
    }

    /// 先按 profile 查询，再做文件系统搜索
    pub async fn locate(&self, session: &mut dyn RemoteHost) -> DeployResult<BinaryLocation> {
        let name = self.config.runtime.as_str();

        let sourced = self.runner.run(session, &self.profile_query()).await?;
        if let Some(path) = last_absolute_line(&sourced.stdout) {
            info!(path = %path, "Runtime found via shell profile");
            return Ok(BinaryLocation::resolved(
                "runtime",
                name,
                path,
                DiscoveryMethod::ProfileSourced,
            ));
        }

        // find 在遇到无权限目录时会返回非零，只看输出
        let search = self.runner.run(session, &self.filesystem_query()).await?;
        match pick_candidate(&search.stdout, name) {
            Some(path) => {
                info!(path = %path, "Runtime found via filesystem search");
                Ok(BinaryLocation::resolved(
                    "runtime",
                    name,
                    path,
                    DiscoveryMethod::FilesystemSearch,
                ))
            }
            None => Ok(BinaryLocation::unresolved("runtime", name)),
        }
    }

    /// 把每个已解析的二进制链接到各个链接目录
    ///
    /// 已指向正确目标的链接不动，对未变化的主机重复执行只会发出 `readlink` 查询
    pub async fn repair_links(
        &self,
        session: &mut dyn RemoteHost,
        toolchain: &Toolchain,
    ) -> DeployResult<Vec<SymlinkRepair>> {
        let mut repairs = Vec::new();

        for binary in toolchain.linkable() {
            let Some(target) = binary.path.as_deref() else {
                continue;
            };
            for dir in &self.config.link_dirs {
                let link = format!("{}/{}", dir.trim_end_matches('/'), binary.file_name);
                let action = self.ensure_link(session, &link, target).await?;
                repairs.push(SymlinkRepair {
                    link,
                    target: target.to_string(),
                    action,
                });
            }
        }

        Ok(repairs)
    }

    async fn ensure_link(
        &self,
        session: &mut dyn RemoteHost,
        link: &str,
        target: &str,
    ) -> DeployResult<LinkAction> {
        let current = self
            .runner
            .run(session, &ShellCommand::new("readlink").arg(link))
            .await?;
        if current.success() && current.stdout_trimmed() == target {
            return Ok(LinkAction::AlreadyCorrect);
        }

        let created = self
            .runner
            .run(session, &ShellCommand::new("ln").args(["-sf", target, link]))
            .await?;
        if created.success() {
            info!(link = %link, target = %target, "Symlink repaired");
            Ok(LinkAction::Created)
        } else {
            warn!(link = %link, error = %created.failure_summary(), "Symlink repair failed");
            Ok(LinkAction::Failed(created.failure_summary()))
        }
    }

    fn profile_query(&self) -> ShellCommand {
        ShellCommand::raw(format!(
            "for f in {}; do [ -f \"$f\" ] && . \"$f\" >/dev/null 2>&1; done; command -v {}",
            PROFILE_FILES.join(" "),
            quote(&self.config.runtime)
        ))
    }

    fn filesystem_query(&self) -> ShellCommand {
        let name = quote(&self.config.runtime);
        ShellCommand::raw(format!(
            "find / \\( -path /proc -o -path /sys \\) -prune -o -type f -name {name} -executable -print 2>/dev/null | grep -F {marker}",
            name = name,
            marker = quote(&format!("bin/{}", self.config.runtime)),
        ))
    }
}

/// 最后一行绝对路径输出（profile 可能先打印杂项）
fn last_absolute_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/'))
        .last()
        .map(str::to_string)
}

/// 只保留 `.../bin/<name>`，按路径长度、再按字典序选出唯一候选
fn pick_candidate(stdout: &str, name: &str) -> Option<String> {
    let marker = format!("bin/{}", name);
    let suffix = format!("/{}", name);
    let mut candidates: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/') && l.contains(&marker) && l.ends_with(&suffix))
        .collect();
    candidates.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    candidates.dedup();
    candidates.first().map(|s| s.to_string())
}
