//! nginx 反向代理站点
//!
//! 站点配置整段写入 sites-available，链接到 sites-enabled 并移除 default。
//! 恢复流程中先停 nginx，应用起来之后再校验、重启并放行监听端口。
//! 每一步的失败都只作为诊断返回

use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::DeployError;
use crate::infra::command::CommandRunner;
use crate::infra::shell::{quote, ShellCommand};
use crate::infra::ssh::RemoteHost;

/// 渲染站点配置
pub fn render_site(config: &ProxyConfig, upstream_port: u16) -> String {
    format!(
        r#"server {{
    listen {listen};
    server_name {server_name};

    location / {{
        proxy_pass http://127.0.0.1:{upstream};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_cache_bypass $http_upgrade;
    }}
}}"#,
        listen = config.listen_port,
        server_name = config.server_name,
        upstream = upstream_port,
    )
}

pub struct ReverseProxy<'a> {
    runner: &'a CommandRunner,
    config: &'a ProxyConfig,
}

impl<'a> ReverseProxy<'a> {
    pub fn new(runner: &'a CommandRunner, config: &'a ProxyConfig) -> Self {
        Self { runner, config }
    }

    /// 写入站点并启用
    ///
    /// 返回所有失败步骤；为空表示全部成功
    pub async fn install(
        &self,
        session: &mut dyn RemoteHost,
        upstream_port: u16,
    ) -> Vec<DeployError> {
        let site = render_site(self.config, upstream_port);
        let available = self.config.available_path();
        let enabled = self.config.enabled_path();
        let default_site = format!("{}/default", self.config.enabled_dir);

        info!(site = %available, upstream_port, "Writing reverse proxy site");

        let steps = [
            ShellCommand::raw(format!(
                "printf '%s\\n' {} > {}",
                quote(&site),
                quote(&available)
            )),
            ShellCommand::new("ln").args(["-sf", available.as_str(), enabled.as_str()]),
            ShellCommand::new("rm").args(["-f", default_site.as_str()]),
        ];

        let mut errors = Vec::new();
        for step in &steps {
            if let Some(e) = self.step(session, step).await {
                errors.push(e);
            }
        }
        errors
    }

    /// 校验配置后重启 nginx；校验失败时不重启
    pub async fn reload(&self, session: &mut dyn RemoteHost) -> Vec<DeployError> {
        if let Some(e) = self.step(session, &ShellCommand::new("nginx").arg("-t")).await {
            warn!("nginx config test failed, skipping restart");
            return vec![e];
        }
        let restart = ShellCommand::new("systemctl").args(["restart", "nginx"]);
        self.step(session, &restart).await.into_iter().collect()
    }

    /// 停止 nginx，释放监听端口
    pub async fn stop(&self, session: &mut dyn RemoteHost) -> Option<DeployError> {
        info!("Stopping nginx");
        let stop = ShellCommand::new("systemctl").args(["stop", "nginx"]);
        self.step(session, &stop).await
    }

    /// 防火墙放行监听端口
    pub async fn open_firewall(&self, session: &mut dyn RemoteHost) -> Option<DeployError> {
        let rule = format!("{}/tcp", self.config.listen_port);
        info!(rule = %rule, "Allowing proxy port through ufw");
        self.step(session, &ShellCommand::new("ufw").args(["allow", rule.as_str()]))
            .await
    }

    async fn step(&self, session: &mut dyn RemoteHost, cmd: &ShellCommand) -> Option<DeployError> {
        match self.runner.run(session, cmd).await {
            Ok(result) if result.success() => None,
            Ok(result) => {
                warn!(command = %result.command, "{}", result.failure_summary());
                Some(DeployError::CommandExecution {
                    command: result.command,
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                })
            }
            Err(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedHost;
    use std::time::Duration;

    fn config() -> ProxyConfig {
        ProxyConfig {
            site_name: "zju-platform".to_string(),
            server_name: "118.31.0.1".to_string(),
            listen_port: 80,
            available_dir: "/etc/nginx/sites-available".to_string(),
            enabled_dir: "/etc/nginx/sites-enabled".to_string(),
        }
    }

    #[test]
    fn test_render_site_names_upstream() {
        let site = render_site(&config(), 3001);
        assert!(site.contains("listen 80;"));
        assert!(site.contains("server_name 118.31.0.1;"));
        assert!(site.contains("proxy_pass http://127.0.0.1:3001;"));
        assert!(site.contains("proxy_set_header Connection 'upgrade';"));
    }

    #[tokio::test]
    async fn test_install_quotes_site_body() {
        let mut host = ScriptedHost::new();
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let config = config();

        let errors = ReverseProxy::new(&runner, &config).install(&mut host, 3001).await;
        assert!(errors.is_empty());

        let commands = journal.lock().unwrap().commands();
        assert_eq!(commands.len(), 3);
        // 单引号按 '\'' 转义，$http_upgrade 保持字面值
        assert!(commands[0].starts_with("printf '%s\\n' 'server {"));
        assert!(commands[0].contains("Connection '\\''upgrade'\\'';"));
        assert!(commands[0].ends_with("> /etc/nginx/sites-available/zju-platform"));
        assert_eq!(
            commands[1],
            "ln -sf /etc/nginx/sites-available/zju-platform /etc/nginx/sites-enabled/zju-platform"
        );
        assert_eq!(commands[2], "rm -f /etc/nginx/sites-enabled/default");
    }

    #[tokio::test]
    async fn test_stop_and_firewall_commands() {
        let mut host = ScriptedHost::new().exit("ufw", 127);
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let mut config = config();
        config.listen_port = 8080;
        let proxy = ReverseProxy::new(&runner, &config);

        assert!(proxy.stop(&mut host).await.is_none());
        let err = proxy.open_firewall(&mut host).await;
        assert!(matches!(err, Some(DeployError::CommandExecution { exit_code: 127, .. })));

        assert_eq!(
            journal.lock().unwrap().commands(),
            vec!["systemctl stop nginx".to_string(), "ufw allow 8080/tcp".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reload_skips_restart_when_config_invalid() {
        let mut host = ScriptedHost::new().exit("nginx -t", 1);
        let journal = host.journal();
        let runner = CommandRunner::new(Duration::from_secs(5));
        let config = config();

        let errors = ReverseProxy::new(&runner, &config).reload(&mut host).await;
        assert_eq!(errors.len(), 1);
        assert!(journal.lock().unwrap().commands_containing("systemctl").is_empty());
    }
}
