//! 测试用的脚本化远程主机
//!
//! 记录所有 exec/upload/close 事件，按子串匹配返回预设结果

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::SshTarget;
use crate::domain::remote::CommandResult;
use crate::error::{DeployError, DeployResult};
use crate::infra::ssh::{Connector, RemoteHost};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum HostEvent {
    Exec(String),
    Upload { local: PathBuf, remote: String },
    Close,
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    pub events: Vec<HostEvent>,
    /// 上传时本地文件的内容快照
    pub payloads: Vec<(String, Vec<u8>)>,
}

impl Journal {
    pub fn commands(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Exec(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Upload { local, remote } => Some((local.clone(), remote.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.events.iter().filter(|e| **e == HostEvent::Close).count()
    }

    /// 第一个满足条件的事件下标
    pub fn position(&self, pred: impl Fn(&HostEvent) -> bool) -> Option<usize> {
        self.events.iter().position(pred)
    }
}

struct Rule {
    pattern: String,
    /// 多个结果依次返回，最后一个保持不变
    responses: VecDeque<CommandResult>,
}

pub(crate) struct ScriptedHost {
    journal: Arc<Mutex<Journal>>,
    rules: Vec<Rule>,
    hang: Vec<String>,
    upload_error: Option<String>,
    open: bool,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal::default())),
            rules: Vec::new(),
            hang: Vec::new(),
            upload_error: None,
            open: true,
        }
    }

    pub fn journal(&self) -> Arc<Mutex<Journal>> {
        self.journal.clone()
    }

    pub fn respond(self, pattern: &str, result: CommandResult) -> Self {
        self.respond_seq(pattern, vec![result])
    }

    pub fn respond_seq(mut self, pattern: &str, results: Vec<CommandResult>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            responses: results.into(),
        });
        self
    }

    pub fn exit(self, pattern: &str, code: i32) -> Self {
        self.respond(pattern, CommandResult::new("", "", "", code))
    }

    pub fn stdout(self, pattern: &str, out: &str) -> Self {
        self.respond(pattern, CommandResult::new("", out, "", 0))
    }

    pub fn hang_on(mut self, pattern: &str) -> Self {
        self.hang.push(pattern.to_string());
        self
    }

    pub fn fail_uploads(mut self, message: &str) -> Self {
        self.upload_error = Some(message.to_string());
        self
    }

    fn record(&self, event: HostEvent) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.events.push(event);
        }
    }
}

#[async_trait]
impl RemoteHost for ScriptedHost {
    async fn exec(&mut self, command: &str) -> DeployResult<CommandResult> {
        self.record(HostEvent::Exec(command.to_string()));

        if self.hang.iter().any(|p| command.contains(p.as_str())) {
            std::future::pending::<()>().await;
        }

        let response = self
            .rules
            .iter_mut()
            .find(|r| command.contains(r.pattern.as_str()))
            .and_then(|rule| {
                if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                }
            })
            .unwrap_or_else(|| CommandResult::new("", "", "", 0));

        Ok(CommandResult::new(
            command,
            response.stdout,
            response.stderr,
            response.exit_code,
        ))
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<u64> {
        self.record(HostEvent::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        if let Some(ref message) = self.upload_error {
            return Err(DeployError::transfer(remote, message));
        }
        let bytes = std::fs::read(local).unwrap_or_default();
        let len = bytes.len() as u64;
        if let Ok(mut journal) = self.journal.lock() {
            journal.payloads.push((remote.to_string(), bytes));
        }
        Ok(len)
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.record(HostEvent::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// 返回预设主机或连接失败的连接器
pub(crate) struct ScriptedConnector {
    host: Mutex<Option<ScriptedHost>>,
    fail_with: Option<String>,
    pub attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(host: ScriptedHost) -> Self {
        Self {
            host: Mutex::new(Some(host)),
            fail_with: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn refusing(message: &str) -> Self {
        Self {
            host: Mutex::new(None),
            fail_with: Some(message.to_string()),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Session = ScriptedHost;

    async fn open(&self, target: &SshTarget) -> DeployResult<ScriptedHost> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.fail_with {
            return Err(DeployError::connectivity(&target.host, target.port, message));
        }
        self.host
            .lock()
            .ok()
            .and_then(|mut h| h.take())
            .ok_or_else(|| DeployError::connectivity(&target.host, target.port, "already used"))
    }
}
