//! 远程 shell 命令构建器
//!
//! 所有插值的值都经过单引号转义，环境变量以 `KEY='value'` 前缀形式给出

use std::borrow::Cow;
use std::fmt;

/// 对单个 shell 词进行转义
///
/// 只含安全字符时原样返回，否则用单引号包裹，内部的 `'` 写成 `'\''`
pub fn quote(value: &str) -> Cow<'_, str> {
    if !value.is_empty() && value.chars().all(is_safe_char) {
        return Cow::Borrowed(value);
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    Cow::Owned(quoted)
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | ',' | '+' | '@' | '%')
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 结构化远程命令
#[derive(Clone, Debug, PartialEq)]
pub struct ShellCommand {
    cwd: Option<String>,
    search_path: Option<String>,
    env: Vec<(String, String)>,
    body: Body,
    ignore_failure: bool,
    discard_stderr: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum Body {
    /// 程序 + 参数，渲染时逐个转义
    Words(Vec<String>),
    /// 预先组装好的脚本片段，原样输出
    Raw(String),
}

impl ShellCommand {
    /// 创建命令
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_body(Body::Words(vec![program.into()]))
    }

    /// 原样脚本片段（调用方负责用 [`quote`] 转义插入的值）
    pub fn raw(script: impl Into<String>) -> Self {
        Self::with_body(Body::Raw(script.into()))
    }

    fn with_body(body: Body) -> Self {
        Self {
            cwd: None,
            search_path: None,
            env: Vec::new(),
            body,
            ignore_failure: false,
            discard_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        if let Body::Words(ref mut words) = self.body {
            words.push(arg.into());
        }
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// 内联环境变量前缀；非法变量名会被丢弃
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if !is_valid_env_key(&key) {
            tracing::warn!(key = %key, "Dropping invalid environment variable name");
            return self;
        }
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in vars {
            self = self.env(k.clone(), v.clone());
        }
        self
    }

    /// 先 cd 到目录
    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// 把目录追加到 PATH 前面
    pub fn prepend_path(mut self, dir: Option<&str>) -> Self {
        self.search_path = dir.map(str::to_string);
        self
    }

    /// 失败时追加 `|| true`
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    /// 丢弃 stderr
    pub fn quiet(mut self) -> Self {
        self.discard_stderr = true;
        self
    }

    /// 渲染为最终命令文本
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(ref dir) = self.cwd {
            out.push_str("cd ");
            out.push_str(&quote(dir));
            out.push_str(" && ");
        }

        if let Some(ref dir) = self.search_path {
            out.push_str("export PATH=");
            out.push_str(&quote(dir));
            out.push_str(":\"$PATH\" && ");
        }

        for (k, v) in &self.env {
            out.push_str(k);
            out.push('=');
            out.push_str(&quote(v));
            out.push(' ');
        }

        match self.body {
            Body::Words(ref words) => {
                let rendered: Vec<Cow<'_, str>> = words.iter().map(|w| quote(w)).collect();
                out.push_str(&rendered.join(" "));
            }
            Body::Raw(ref script) => out.push_str(script),
        }

        if self.discard_stderr {
            out.push_str(" 2>/dev/null");
        }
        if self.ignore_failure {
            out.push_str(" || true");
        }

        out
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_safe_words_unchanged() {
        assert_eq!(quote("/usr/bin/node"), "/usr/bin/node");
        assert_eq!(quote("--update-env"), "--update-env");
        assert_eq!(quote("PORT=3001"), "PORT=3001");
    }

    #[test]
    fn test_quote_metacharacters() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("~/ZJU_Platform"), "'~/ZJU_Platform'");
    }

    #[test]
    fn test_render_with_env_and_dir() {
        let cmd = ShellCommand::new("pm2")
            .args(["restart", "zju-platform", "--update-env"])
            .env("PORT", "3001")
            .current_dir("/root/ZJU_Platform");
        assert_eq!(
            cmd.render(),
            "cd /root/ZJU_Platform && PORT=3001 pm2 restart zju-platform --update-env"
        );
    }

    #[test]
    fn test_render_env_value_with_spaces_is_quoted() {
        let cmd = ShellCommand::new("node").env("GREETING", "hello world; rm -rf /");
        assert_eq!(cmd.render(), "GREETING='hello world; rm -rf /' node");
    }

    #[test]
    fn test_invalid_env_key_dropped() {
        let cmd = ShellCommand::new("true").env("BAD KEY", "x").env("1X", "y");
        assert_eq!(cmd.render(), "true");
    }

    #[test]
    fn test_env_override_replaces_previous() {
        let cmd = ShellCommand::new("true").env("PORT", "80").env("PORT", "3001");
        assert_eq!(cmd.render(), "PORT=3001 true");
    }

    #[test]
    fn test_prepend_path_and_ignore_failure() {
        let cmd = ShellCommand::new("pm2")
            .args(["delete", "all"])
            .prepend_path(Some("/opt/node v20/bin"))
            .ignore_failure();
        assert_eq!(
            cmd.render(),
            "export PATH='/opt/node v20/bin':\"$PATH\" && pm2 delete all || true"
        );
    }

    #[test]
    fn test_raw_is_verbatim() {
        let cmd = ShellCommand::raw("find / -name node | head -n 1").quiet();
        assert_eq!(cmd.render(), "find / -name node | head -n 1 2>/dev/null");
    }
}
