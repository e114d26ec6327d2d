//! 环境变量配置加载
//!
//! 所有主机、凭据与路径都通过 `DeployConfig` 注入编排器，不使用进程级可变状态

use std::convert::Infallible;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::config::env::constants::*;
use crate::error::DeployError;

/// 部署配置
#[derive(Clone, Debug)]
pub struct DeployConfig {
    /// SSH 目标主机
    pub target: SshTarget,
    /// 远端应用配置
    pub app: AppConfig,
    /// 打包配置
    pub package: PackageConfig,
    /// 本地构建与版本控制
    pub local: LocalConfig,
    /// 二进制修复配置
    pub resolver: ResolverConfig,
    /// 反向代理配置
    pub proxy: ProxyConfig,
    /// 单条远程命令超时
    pub command_timeout: Duration,
}

impl DeployConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let command_timeout = Duration::from_secs(env_parse(
            "DEPLOY_COMMAND_TIMEOUT_SECS",
            DEFAULT_COMMAND_TIMEOUT_SECS,
        ));

        let target = SshTarget::from_env();
        let app = AppConfig::from_env();
        let package = PackageConfig::from_env(&app);
        let local = LocalConfig::from_env();
        let resolver = ResolverConfig::from_env();
        let proxy = ProxyConfig::from_env(&target);

        Self {
            target,
            app,
            package,
            local,
            resolver,
            proxy,
            command_timeout,
        }
    }

    /// 校验必需项
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.target.host.trim().is_empty() {
            return Err(DeployError::Config(
                "DEPLOY_HOST is not set".to_string(),
            ));
        }
        if self.target.username.trim().is_empty() {
            return Err(DeployError::Config("DEPLOY_USER is empty".to_string()));
        }
        if !self.app.remote_dir.starts_with('/') {
            return Err(DeployError::Config(format!(
                "DEPLOY_REMOTE_DIR must be absolute, got {}",
                self.app.remote_dir
            )));
        }
        if self.app.port == 0 {
            return Err(DeployError::Config("DEPLOY_APP_PORT must be non-zero".to_string()));
        }
        if self.command_timeout.is_zero() {
            return Err(DeployError::Config(
                "DEPLOY_COMMAND_TIMEOUT_SECS must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// SSH 凭据引用
#[derive(Clone)]
pub enum Credentials {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::KeyFile { path, .. } => {
                f.debug_struct("KeyFile").field("path", path).finish()
            }
        }
    }
}

/// 主机公钥校验策略
#[derive(Clone, Debug, PartialEq, Default)]
pub enum HostKeyPolicy {
    /// 接受任意主机公钥（记录指纹）
    #[default]
    AcceptAny,
    /// 按 ~/.ssh/known_hosts 校验
    KnownHosts,
}

/// 未识别的取值一律按 AcceptAny 处理
impl FromStr for HostKeyPolicy {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "known_hosts" | "known-hosts" | "knownhosts" | "strict" => HostKeyPolicy::KnownHosts,
            _ => HostKeyPolicy::AcceptAny,
        })
    }
}

/// SSH 目标主机
#[derive(Clone, Debug)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn from_env() -> Self {
        let host = env::var("DEPLOY_HOST").unwrap_or_default();
        let port = env_parse("DEPLOY_PORT", DEFAULT_SSH_PORT);
        let username = env::var("DEPLOY_USER").unwrap_or_else(|_| DEFAULT_SSH_USER.to_string());

        // 优先使用私钥，其次密码
        let credentials = match env::var("DEPLOY_KEY_FILE").ok().filter(|s| !s.is_empty()) {
            Some(path) => Credentials::KeyFile {
                path: PathBuf::from(path),
                passphrase: env::var("DEPLOY_KEY_PASSPHRASE").ok().filter(|s| !s.is_empty()),
            },
            None => {
                let password = env::var("DEPLOY_PASSWORD").unwrap_or_default();
                if password.is_empty() {
                    warn!("Neither DEPLOY_KEY_FILE nor DEPLOY_PASSWORD is set; authentication will likely fail");
                }
                Credentials::Password(password)
            }
        };

        let host_key_policy: HostKeyPolicy = env::var("DEPLOY_HOST_KEY_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let connect_timeout = Duration::from_secs(env_parse(
            "DEPLOY_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));

        Self {
            host,
            port,
            username,
            credentials,
            host_key_policy,
            connect_timeout,
        }
    }

    /// host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 远端应用配置
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// 远端项目目录
    pub remote_dir: String,
    /// pm2 服务名
    pub name: String,
    /// 应用监听端口（反向代理上游）
    pub port: u16,
    /// 相对 remote_dir 的入口脚本
    pub entry_point: String,
    /// pm2 ecosystem 配置文件（打包时总是包含）
    pub ecosystem_file: String,
    /// 本地数据库文件
    pub local_db_path: PathBuf,
    /// 远端数据库文件（持久化状态）
    pub remote_db_path: String,
    /// 额外的环境变量覆盖 (KEY=VALUE,KEY=VALUE)
    pub extra_env: Vec<(String, String)>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let remote_dir = env::var("DEPLOY_REMOTE_DIR")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_REMOTE_DIR.to_string());
        let name = env::var("DEPLOY_APP_NAME").unwrap_or_else(|_| DEFAULT_APP_NAME.to_string());
        let port = env_parse("DEPLOY_APP_PORT", DEFAULT_APP_PORT);
        let entry_point =
            env::var("DEPLOY_ENTRY_POINT").unwrap_or_else(|_| DEFAULT_ENTRY_POINT.to_string());
        let ecosystem_file = env::var("DEPLOY_ECOSYSTEM_FILE")
            .unwrap_or_else(|_| DEFAULT_ECOSYSTEM_FILE.to_string());
        let local_db_path = env::var("DEPLOY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_RELATIVE_PATH));
        let remote_db_path = env::var("DEPLOY_REMOTE_DB_PATH")
            .unwrap_or_else(|_| format!("{}/{}", remote_dir, DEFAULT_DB_RELATIVE_PATH));
        let extra_env = env::var("DEPLOY_APP_ENV")
            .map(|v| parse_env_pairs(&v))
            .unwrap_or_default();

        Self {
            remote_dir,
            name,
            port,
            entry_point,
            ecosystem_file,
            local_db_path,
            remote_db_path,
            extra_env,
        }
    }

    /// 远端路径拼接
    pub fn remote_path(&self, relative: &str) -> String {
        format!("{}/{}", self.remote_dir, relative.trim_start_matches("./"))
    }
}

/// 打包配置
#[derive(Clone, Debug)]
pub struct PackageConfig {
    /// 源路径（相对本地项目目录）
    pub sources: Vec<String>,
    /// 排除子串
    pub excludes: Vec<String>,
    /// 无条件包含的文件
    pub extra_files: Vec<String>,
    /// 归档文件名
    pub archive_name: String,
}

impl PackageConfig {
    pub fn from_env(app: &AppConfig) -> Self {
        let sources = env_list("DEPLOY_SOURCES", &["dist", "server"]);
        let excludes = env_list("DEPLOY_EXCLUDES", &["node_modules", "uploads"]);
        let mut extra_files = env_list("DEPLOY_EXTRA_FILES", &[]);
        if !extra_files.contains(&app.ecosystem_file) {
            extra_files.push(app.ecosystem_file.clone());
        }
        let archive_name = env::var("DEPLOY_PACKAGE_NAME")
            .unwrap_or_else(|_| DEFAULT_PACKAGE_NAME.to_string());

        Self {
            sources,
            excludes,
            extra_files,
            archive_name,
        }
    }
}

/// 本地构建与版本控制配置
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// 本地项目根目录
    pub project_dir: PathBuf,
    pub build_command: String,
    pub build_timeout: Duration,
    pub git_remote: String,
    pub git_branch: String,
    pub commit_message: String,
}

impl LocalConfig {
    pub fn from_env() -> Self {
        let project_dir = env::var("DEPLOY_PROJECT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let build_command =
            env::var("DEPLOY_BUILD_COMMAND").unwrap_or_else(|_| DEFAULT_BUILD_COMMAND.to_string());
        let build_timeout = Duration::from_secs(env_parse(
            "DEPLOY_BUILD_TIMEOUT_SECS",
            DEFAULT_BUILD_TIMEOUT_SECS,
        ));
        let git_remote = env::var("DEPLOY_GIT_REMOTE").unwrap_or_else(|_| "origin".to_string());
        let git_branch = env::var("DEPLOY_GIT_BRANCH").unwrap_or_else(|_| "master".to_string());
        let commit_message = env::var("DEPLOY_COMMIT_MESSAGE")
            .unwrap_or_else(|_| "Auto-deploy update".to_string());

        Self {
            project_dir,
            build_command,
            build_timeout,
            git_remote,
            git_branch,
            commit_message,
        }
    }
}

/// 二进制修复配置
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// 运行时二进制文件名
    pub runtime: String,
    pub package_manager: String,
    pub supervisor: String,
    /// 其余需要链接的同目录二进制
    pub extra_siblings: Vec<String>,
    /// 建立软链接的系统目录
    pub link_dirs: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            package_manager: "npm".to_string(),
            supervisor: "pm2".to_string(),
            extra_siblings: vec!["npx".to_string()],
            link_dirs: vec!["/usr/bin".to_string(), "/usr/local/bin".to_string()],
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            runtime: env::var("DEPLOY_RUNTIME_BIN").unwrap_or(defaults.runtime),
            package_manager: env::var("DEPLOY_PACKAGE_MANAGER_BIN")
                .unwrap_or(defaults.package_manager),
            supervisor: env::var("DEPLOY_SUPERVISOR_BIN").unwrap_or(defaults.supervisor),
            extra_siblings: env::var("DEPLOY_EXTRA_SIBLINGS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.extra_siblings),
            link_dirs: env::var("DEPLOY_LINK_DIRS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.link_dirs),
        }
    }
}

/// 反向代理 (nginx) 配置
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub site_name: String,
    pub server_name: String,
    pub listen_port: u16,
    pub available_dir: String,
    pub enabled_dir: String,
}

impl ProxyConfig {
    pub fn from_env(target: &SshTarget) -> Self {
        let site_name =
            env::var("DEPLOY_PROXY_SITE").unwrap_or_else(|_| DEFAULT_APP_NAME.to_string());
        let server_name = env::var("DEPLOY_PROXY_SERVER_NAME").unwrap_or_else(|_| {
            if target.host.is_empty() {
                "_".to_string()
            } else {
                target.host.clone()
            }
        });
        let listen_port = env_parse("DEPLOY_PROXY_LISTEN_PORT", 80);

        Self {
            site_name,
            server_name,
            listen_port,
            available_dir: "/etc/nginx/sites-available".to_string(),
            enabled_dir: "/etc/nginx/sites-enabled".to_string(),
        }
    }

    pub fn available_path(&self) -> String {
        format!("{}/{}", self.available_dir, self.site_name)
    }

    pub fn enabled_path(&self) -> String {
        format!("{}/{}", self.enabled_dir, self.site_name)
    }
}

/// 解析环境变量，失败时使用默认值
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = %key, value = %v, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// 逗号分隔的列表
fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .map(|v| split_list(&v))
        .unwrap_or_else(|_| default.iter().map(|s| s.to_string()).collect())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 解析 KEY=VALUE,KEY=VALUE
fn parse_env_pairs(value: &str) -> Vec<(String, String)> {
    split_list(value)
        .into_iter()
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// 常量
pub mod constants {
    pub const DEFAULT_SSH_PORT: u16 = 22;
    pub const DEFAULT_SSH_USER: &str = "root";

    /// 连接超时（秒）
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

    /// 单条远程命令超时（秒），npm install 可能较慢
    pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 900;

    /// 本地构建超时（秒）
    pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    pub const DEFAULT_REMOTE_DIR: &str = "/root/ZJU_Platform";
    pub const DEFAULT_APP_NAME: &str = "zju-platform";
    pub const DEFAULT_APP_PORT: u16 = 3001;
    pub const DEFAULT_ENTRY_POINT: &str = "./server/index.js";
    pub const DEFAULT_ECOSYSTEM_FILE: &str = "ecosystem.config.cjs";
    pub const DEFAULT_DB_RELATIVE_PATH: &str = "server/database.sqlite";
    pub const DEFAULT_PACKAGE_NAME: &str = "deploy_package.tar.gz";
    pub const DEFAULT_BUILD_COMMAND: &str = "npm run build";
}
