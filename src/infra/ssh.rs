//! SSH 客户端会话
//!
//! 基于 russh 的认证会话：exec 通道执行命令，SFTP 子系统在首次上传时按需打开

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{Credentials, HostKeyPolicy, SshTarget};
use crate::domain::remote::CommandResult;
use crate::error::{DeployError, DeployResult};

/// 远程主机会话抽象
///
/// 编排器与各服务只依赖此 trait，测试中以脚本化的内存主机替代
#[async_trait]
pub trait RemoteHost: Send {
    /// 执行一条命令直到远端进程退出，完整捕获输出
    async fn exec(&mut self, command: &str) -> DeployResult<CommandResult>;

    /// 上传本地文件到远端路径，返回写入字节数
    async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<u64>;

    /// 关闭会话；重复调用安全
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// 建立会话的入口
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: RemoteHost + 'static;

    async fn open(&self, target: &SshTarget) -> DeployResult<Self::Session>;
}

/// 真实 SSH 连接器
#[derive(Clone, Copy, Debug, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    type Session = RemoteSession;

    async fn open(&self, target: &SshTarget) -> DeployResult<RemoteSession> {
        RemoteSession::open(target).await
    }
}

/// russh 客户端回调，负责主机公钥校验
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                info!(host = %self.host, fingerprint = %fingerprint, "Accepting host key");
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => {
                match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, fingerprint = %fingerprint, "Host key not found in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "Host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

enum SessionState {
    Open {
        handle: Handle<ClientHandler>,
        /// 首次上传时才打开
        sftp: Option<SftpSession>,
    },
    Closed,
}

/// 到单个主机的认证 SSH 会话
pub struct RemoteSession {
    host: String,
    port: u16,
    state: SessionState,
}

impl RemoteSession {
    /// 建立连接并认证；失败不重试
    pub async fn open(target: &SshTarget) -> DeployResult<Self> {
        let fail = |message: String| DeployError::connectivity(&target.host, target.port, message);

        info!(address = %target.address(), user = %target.username, "Connecting");

        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            policy: target.host_key_policy.clone(),
        };

        let connect = client::connect(config, (target.host.as_str(), target.port), handler);
        let mut handle = match tokio::time::timeout(target.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(fail(e.to_string())),
            Err(_) => {
                return Err(fail(format!(
                    "timed out after {}s",
                    target.connect_timeout.as_secs()
                )))
            }
        };

        let authenticated = match target.credentials {
            Credentials::Password(ref password) => handle
                .authenticate_password(target.username.clone(), password.clone())
                .await
                .map_err(|e| fail(e.to_string()))?,
            Credentials::KeyFile {
                ref path,
                ref passphrase,
            } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| fail(format!("load key {}: {}", path.display(), e)))?;
                handle
                    .authenticate_publickey(target.username.clone(), Arc::new(key))
                    .await
                    .map_err(|e| fail(e.to_string()))?
            }
        };

        if !authenticated {
            return Err(fail(format!(
                "authentication rejected for user {}",
                target.username
            )));
        }

        info!(address = %target.address(), "Connected");

        Ok(Self {
            host: target.host.clone(),
            port: target.port,
            state: SessionState::Open { handle, sftp: None },
        })
    }

    /// 已关闭状态的会话（不建立连接）
    #[cfg(test)]
    pub(crate) fn detached(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            state: SessionState::Closed,
        }
    }

    fn broken(&self, message: impl ToString) -> DeployError {
        DeployError::connectivity(&self.host, self.port, message)
    }

    async fn open_sftp(handle: &Handle<ClientHandler>) -> Result<SftpSession, String> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| e.to_string())?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RemoteHost for RemoteSession {
    async fn exec(&mut self, command: &str) -> DeployResult<CommandResult> {
        let handle = match self.state {
            SessionState::Open { ref handle, .. } => handle,
            SessionState::Closed => return Err(self.broken("session is closed")),
        };

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| DeployError::connectivity(&self.host, self.port, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| DeployError::connectivity(&self.host, self.port, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // 读到通道关闭为止；ExitStatus 之后仍可能有数据
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        Ok(CommandResult::new(
            command,
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
            exit_code.unwrap_or(-1),
        ))
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<u64> {
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| DeployError::transfer(remote, format!("open {}: {}", local.display(), e)))?;

        let sftp = match self.state {
            SessionState::Open {
                ref handle,
                ref mut sftp,
            } => {
                if sftp.is_none() {
                    debug!("Opening SFTP channel");
                    let session = Self::open_sftp(handle)
                        .await
                        .map_err(|e| DeployError::transfer(remote, e))?;
                    *sftp = Some(session);
                }
                sftp.as_ref()
            }
            SessionState::Closed => None,
        };
        let Some(sftp) = sftp else {
            return Err(DeployError::transfer(remote, "session is closed"));
        };

        let mut file = sftp
            .create(remote)
            .await
            .map_err(|e| DeployError::transfer(remote, e))?;
        let written = tokio::io::copy(&mut source, &mut file)
            .await
            .map_err(|e| DeployError::transfer(remote, e))?;
        file.shutdown()
            .await
            .map_err(|e| DeployError::transfer(remote, e))?;

        Ok(written)
    }

    async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Open { handle, sftp } = state {
            if let Some(sftp) = sftp {
                if let Err(e) = sftp.close().await {
                    debug!(error = %e, "SFTP close failed");
                }
            }
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(error = %e, "Disconnect failed");
            }
            info!(host = %self.host, "Session closed");
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut session = RemoteSession::detached("203.0.113.7", 22);
        assert!(!session.is_open());
        session.close().await;
        session.close().await;
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_exec_on_closed_session_is_connectivity_error() {
        let mut session = RemoteSession::detached("203.0.113.7", 22);
        let err = session.exec("true").await.unwrap_err();
        assert!(matches!(err, DeployError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_open_unreachable_host_fails_fast() {
        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            // 保留端口，无人监听
            port: 1,
            username: "root".to_string(),
            credentials: Credentials::Password(String::new()),
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout: std::time::Duration::from_secs(5),
        };
        let err = SshConnector.open(&target).await.err().unwrap();
        assert!(matches!(err, DeployError::Connectivity { port: 1, .. }));
    }
}
