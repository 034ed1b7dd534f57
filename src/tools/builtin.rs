//! Built-in tools rooted in the agent workspace.
//!
//! Reads may target any path; writes and deletes go through the
//! [`WorkspaceGuard`]. Argument problems are returned as `Err` so the loop
//! records a failed observation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::workspace::WorkspaceGuard;
use super::{Tool, ToolRegistry, ToolSpec, Touch, TouchSpec};
use crate::approval::RiskTier;
use crate::locks::{LockMode, ResourceKind};

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_SEARCH_HITS: usize = 100;
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

fn str_arg<'a>(tool: &str, args: &'a Value, name: &str) -> Result<&'a str, String> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{tool}: missing or invalid '{name}' argument"))
}

/// Every built-in tool, sharing one workspace guard.
pub fn builtin_registry(guard: WorkspaceGuard, shell_timeout: Duration) -> ToolRegistry {
    let guard = Arc::new(guard);
    ToolRegistry::new()
        .with(Arc::new(FileRead::new(guard.clone())))
        .with(Arc::new(ListDir::new(guard.clone())))
        .with(Arc::new(SearchFiles::new(guard.clone())))
        .with(Arc::new(FileWrite::new(guard.clone())))
        .with(Arc::new(FileDelete::new(guard.clone())))
        .with(Arc::new(ShellExec::new(guard, shell_timeout)))
        .with(Arc::new(WebFetch::new()))
}

pub struct FileRead {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
}

impl FileRead {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        let spec = ToolSpec::new(
            "file_read",
            "Read a file. Relative paths resolve against the workspace.",
            RiskTier::Low,
        )
        .param("path", "file path, relative to the workspace or absolute")
        .touching(TouchSpec::new("path", ResourceKind::File, LockMode::Read));
        Self { spec, guard }
    }
}

impl Tool for FileRead {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn touched(&self, args: &Value) -> Vec<Touch> {
        self.spec.touched_with(args, |path| self.guard.lock_key(path))
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let path = str_arg("file_read", args, "path")?;
            tokio::fs::read_to_string(self.guard.resolve(path))
                .await
                .map_err(|e| format!("file_read: {e}"))
        })
    }
}

pub struct ListDir {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
}

impl ListDir {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        let spec = ToolSpec::new(
            "list_dir",
            "List the entries of a directory. Directories end with '/'.",
            RiskTier::Low,
        )
        .param("path", "directory path; defaults to the workspace root");
        Self { spec, guard }
    }
}

impl Tool for ListDir {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
            let mut dir = tokio::fs::read_dir(self.guard.resolve(path))
                .await
                .map_err(|e| format!("list_dir: {e}"))?;
            let mut entries = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(|e| format!("list_dir: {e}"))? {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                entries.push(name);
            }
            entries.sort();
            Ok(json!({ "path": path, "entries": entries }).to_string())
        })
    }
}

pub struct SearchFiles {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
}

impl SearchFiles {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        let spec = ToolSpec::new(
            "search_files",
            "Search file contents under a directory with a regular expression.",
            RiskTier::Low,
        )
        .param("pattern", "regular expression to look for")
        .param("path", "directory to search; defaults to the workspace root");
        Self { spec, guard }
    }
}

impl Tool for SearchFiles {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let pattern = str_arg("search_files", args, "pattern")?;
            let regex = Regex::new(pattern).map_err(|e| format!("search_files: {e}"))?;
            let root = self
                .guard
                .resolve(args.get("path").and_then(Value::as_str).unwrap_or("."));

            let mut hits = Vec::new();
            let mut stack: Vec<PathBuf> = vec![root.clone()];
            'walk: while let Some(dir) = stack.pop() {
                let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                    continue;
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let Ok(meta) = entry.metadata().await else {
                        continue;
                    };
                    if meta.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    if meta.len() > MAX_SEARCH_FILE_BYTES {
                        continue;
                    }
                    let Ok(content) = tokio::fs::read_to_string(&path).await else {
                        continue;
                    };
                    let shown = path.strip_prefix(&root).unwrap_or(&path).display().to_string();
                    for (n, line) in content.lines().enumerate() {
                        if regex.is_match(line) {
                            hits.push(format!("{shown}:{}: {}", n + 1, line.trim()));
                            if hits.len() >= MAX_SEARCH_HITS {
                                break 'walk;
                            }
                        }
                    }
                }
            }
            Ok(json!({ "pattern": pattern, "matches": hits }).to_string())
        })
    }
}

pub struct FileWrite {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
}

impl FileWrite {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        let spec = ToolSpec::new(
            "file_write",
            "Write content to a file inside the workspace. Parent directories are created.",
            RiskTier::Medium,
        )
        .param("path", "file path relative to the workspace root")
        .param("content", "full file content")
        .touching(TouchSpec::new("path", ResourceKind::File, LockMode::Write));
        Self { spec, guard }
    }
}

impl Tool for FileWrite {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn touched(&self, args: &Value) -> Vec<Touch> {
        self.spec.touched_with(args, |path| self.guard.lock_key(path))
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let path = str_arg("file_write", args, "path")?;
            let content = str_arg("file_write", args, "content")?;
            let target = self
                .guard
                .resolve_for_write(path)
                .map_err(|e| format!("file_write: {e}"))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("file_write: failed to create directories: {e}"))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| format!("file_write: {e}"))?;
            Ok(json!({ "written_bytes": content.len(), "path": path }).to_string())
        })
    }
}

pub struct FileDelete {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
}

impl FileDelete {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        let spec = ToolSpec::new(
            "file_delete",
            "Delete a file inside the workspace.",
            RiskTier::High,
        )
        .param("path", "file path relative to the workspace root")
        .touching(TouchSpec::new("path", ResourceKind::File, LockMode::Exclusive));
        Self { spec, guard }
    }
}

impl Tool for FileDelete {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn touched(&self, args: &Value) -> Vec<Touch> {
        self.spec.touched_with(args, |path| self.guard.lock_key(path))
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let path = str_arg("file_delete", args, "path")?;
            let target = self
                .guard
                .resolve_for_write(path)
                .map_err(|e| format!("file_delete: {e}"))?;
            tokio::fs::remove_file(&target)
                .await
                .map_err(|e| format!("file_delete: {e}"))?;
            Ok(json!({ "deleted": path }).to_string())
        })
    }
}

/// Result of a shell command execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

pub struct ShellExec {
    spec: ToolSpec,
    guard: Arc<WorkspaceGuard>,
    timeout: Duration,
}

impl ShellExec {
    pub fn new(guard: Arc<WorkspaceGuard>, timeout: Duration) -> Self {
        let spec = ToolSpec::new(
            "shell_exec",
            "Run `sh -c <command>` in the workspace. Returns stdout, stderr, exit_code and timed_out.",
            RiskTier::High,
        )
        .param("command", "shell command to execute");
        Self {
            spec,
            guard,
            timeout,
        }
    }
}

impl Tool for ShellExec {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let command = str_arg("shell_exec", args, "command")?;
            let result = run_shell(command, self.guard.canonical_root(), self.timeout).await?;
            serde_json::to_string(&result).map_err(|e| format!("shell_exec: {e}"))
        })
    }
}

/// Run a command in its own process group, killing the whole group when the
/// timeout elapses.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> Result<ExecResult, String> {
    // process_group(0) requires the CommandExt trait on Unix.
    #[allow(unused_imports)]
    use std::os::unix::process::CommandExt;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("shell_exec: failed to spawn: {e}"))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut out) = stdout {
            let _ = out.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_reader = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut buf).await;
        }
        buf
    });

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| format!("shell_exec: wait failed: {e}"))?;
            (status.code(), false)
        }
        _ = tokio::time::sleep(timeout) => {
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            // Reap the child to prevent zombies.
            let _ = child.wait().await;
            tracing::warn!(command = %command, timeout_secs = timeout.as_secs(), "Shell command timed out");
            (None, true)
        }
    };

    Ok(ExecResult {
        stdout: stdout_reader.await.unwrap_or_default(),
        stderr: stderr_reader.await.unwrap_or_default(),
        exit_code,
        timed_out,
    })
}

pub struct WebFetch {
    spec: ToolSpec,
}

impl WebFetch {
    pub fn new() -> Self {
        let spec = ToolSpec::new(
            "web_fetch",
            "Fetch a URL with HTTP GET. HTML is converted to markdown unless format is \"html\".",
            RiskTier::Network,
        )
        .param("url", "absolute http(s) URL; must be on the network allow-list")
        .param("format", "\"markdown\" (default) or \"html\"")
        .param("max_length", "optional character limit for the returned content");
        Self { spec }
    }
}

impl Default for WebFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for WebFetch {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, args: &'a Value) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let url = str_arg("web_fetch", args, "url")?;
            let format = args.get("format").and_then(Value::as_str).unwrap_or("markdown");
            let max_length = args
                .get("max_length")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            fetch_url(url, format, max_length).await
        })
    }
}

async fn fetch_url(url: &str, format: &str, max_length: Option<usize>) -> Result<String, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent("Mozilla/5.0 (compatible; Rankflow/0.1)")
        .build()
        .map_err(|e| format!("web_fetch: failed to build client: {e}"))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("web_fetch: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("web_fetch: HTTP {status}"));
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response
        .text()
        .await
        .map_err(|e| format!("web_fetch: failed to read body: {e}"))?;

    let output = if content_type.contains("text/html") && format == "markdown" {
        htmd::convert(&body).unwrap_or(body)
    } else {
        body
    };
    Ok(truncate_chars(&output, max_length))
}

/// Cut `content` to `max_length` characters, noting the original length.
fn truncate_chars(content: &str, max_length: Option<usize>) -> String {
    match max_length {
        Some(limit) if content.chars().count() > limit => {
            let head: String = content.chars().take(limit).collect();
            format!(
                "{head}...\n[truncated at {limit} chars, total {}]",
                content.chars().count()
            )
        }
        _ => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> ToolRegistry {
        let guard = WorkspaceGuard::new(&tmp.path().join("workspace")).unwrap();
        builtin_registry(guard, Duration::from_secs(5))
    }

    async fn run(reg: &ToolRegistry, name: &str, args: Value) -> Result<String, String> {
        let tool = reg.get(name).unwrap();
        tool.execute(&args).await
    }

    #[test]
    fn registry_declares_risk_tiers() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let risk = |name: &str| reg.get(name).unwrap().spec().risk;
        assert_eq!(risk("file_read"), RiskTier::Low);
        assert_eq!(risk("list_dir"), RiskTier::Low);
        assert_eq!(risk("search_files"), RiskTier::Low);
        assert_eq!(risk("file_write"), RiskTier::Medium);
        assert_eq!(risk("file_delete"), RiskTier::High);
        assert_eq!(risk("shell_exec"), RiskTier::High);
        assert_eq!(risk("web_fetch"), RiskTier::Network);
        assert_eq!(reg.len(), 7);
    }

    #[tokio::test]
    async fn write_then_read_and_search() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let out = run(&reg, "file_write", json!({"path": "src/a.ts", "content": "export const a = 1;\n"}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["written_bytes"], 20);

        let content = run(&reg, "file_read", json!({"path": "src/a.ts"})).await.unwrap();
        assert_eq!(content, "export const a = 1;\n");

        let found = run(&reg, "search_files", json!({"pattern": "const a"})).await.unwrap();
        let parsed: Value = serde_json::from_str(&found).unwrap();
        assert_eq!(parsed["matches"].as_array().unwrap().len(), 1);

        let listing = run(&reg, "list_dir", json!({})).await.unwrap();
        assert!(listing.contains("src/"));
    }

    #[tokio::test]
    async fn write_outside_workspace_is_refused() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let err = run(&reg, "file_write", json!({"path": "../escape.txt", "content": "x"}))
            .await
            .unwrap_err();
        assert!(err.contains("outside the workspace"), "{err}");
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn file_tools_key_locks_by_resolved_path() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let absolute = std::fs::canonicalize(tmp.path().join("workspace"))
            .unwrap()
            .join("src/a.ts");
        let key = |tool: &str, path: &str| {
            let touches = reg.get(tool).unwrap().touched(&json!({ "path": path }));
            touches[0].resource.clone()
        };

        for tool in ["file_read", "file_write", "file_delete"] {
            assert_eq!(key(tool, "src/a.ts"), "src/a.ts");
            assert_eq!(key(tool, absolute.to_str().unwrap()), "src/a.ts");
            assert_eq!(key(tool, "src/./a.ts"), "src/a.ts");
            assert_eq!(key(tool, "lib/../src/a.ts"), "src/a.ts");
        }
    }

    #[tokio::test]
    async fn write_through_parent_step_lands_on_keyed_file() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        run(&reg, "file_write", json!({"path": "lib/../src/a.ts", "content": "x"}))
            .await
            .unwrap();
        let content = run(&reg, "file_read", json!({"path": "src/a.ts"})).await.unwrap();
        assert_eq!(content, "x");
        assert!(!tmp.path().join("workspace/lib").exists());
    }

    #[tokio::test]
    async fn missing_argument_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let err = run(&reg, "file_write", json!({"path": "x.txt"})).await.unwrap_err();
        assert!(err.contains("content"));
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        run(&reg, "file_write", json!({"path": "gone.txt", "content": "x"})).await.unwrap();
        run(&reg, "file_delete", json!({"path": "gone.txt"})).await.unwrap();
        assert!(!tmp.path().join("workspace/gone.txt").exists());
    }

    #[tokio::test]
    async fn shell_runs_in_workspace() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let out = run(&reg, "shell_exec", json!({"command": "echo hello"})).await.unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(parsed["exit_code"], 0);
        assert_eq!(parsed["timed_out"], false);
    }

    #[tokio::test]
    async fn shell_timeout_kills_process() {
        let tmp = TempDir::new().unwrap();
        let result = run_shell("sleep 5", tmp.path(), Duration::from_millis(100)).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("hello world", Some(100)), "hello world");
        let cut = truncate_chars("hello world", Some(5));
        assert!(cut.starts_with("hello..."));
        assert!(cut.contains("[truncated at 5 chars, total 11]"));
        assert_eq!(truncate_chars("héllo", None), "héllo");
    }
}
