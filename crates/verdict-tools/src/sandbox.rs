// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use verdict_model::tool::{ToolCallError, ToolCallErrorKind};

/// Requested sandbox for a sample, as carried on the dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxSpec {
    /// Environment kind, e.g. "local" or "docker".
    pub kind: String,
    /// Kind-specific options (image name, mounts, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl SandboxSpec {
    pub fn local() -> Self {
        Self {
            kind: "local".to_string(),
            options: serde_json::Value::Null,
        }
    }
}

/// Whether sandbox state is removed on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    #[default]
    Always,
    /// Keep the environment for post-mortem inspection
    /// (`--no-sandbox-cleanup`).
    Never,
}

/// Typed sandbox failure, mapped onto tool-call errors so the model sees
/// a structured reason rather than an opaque string.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("{0}")]
    Unknown(String),
}

impl SandboxError {
    pub fn to_call_error(&self) -> ToolCallError {
        let kind = match self {
            Self::Timeout(_) => ToolCallErrorKind::Timeout,
            Self::Permission(_) => ToolCallErrorKind::Permission,
            Self::FileNotFound(_) => ToolCallErrorKind::FileNotFound,
            Self::IsADirectory(_) => ToolCallErrorKind::IsADirectory,
            Self::Unknown(_) => ToolCallErrorKind::Unknown,
        };
        ToolCallError::new(kind, self.to_string())
    }

    fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Permission(path.to_string()),
            _ => Self::Unknown(format!("{path}: {err}")),
        }
    }
}

/// Result of a sandbox exec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    pub success: bool,
}

/// Connection details for attaching an interactive session to a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConnection {
    /// Shell command that opens a session inside the environment.
    pub command: String,
    /// Optional editor deep link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vscode_command: Option<String>,
}

/// Isolated execution environment owned by exactly one sample.
///
/// Teardown is guaranteed on all sample exit paths; teardown failures are
/// reported as warnings and never mark the sample errored.
#[async_trait]
pub trait SandboxEnvironment: Send + Sync {
    async fn exec(
        &self,
        cmd: &[String],
        input: Option<&str>,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        user: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError>;

    async fn connection(&self) -> Option<SandboxConnection> {
        None
    }

    async fn teardown(&self) -> anyhow::Result<()>;
}

/// Factory for sandbox environments of one kind.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn init(
        &self,
        spec: &SandboxSpec,
        cleanup: CleanupPolicy,
    ) -> anyhow::Result<std::sync::Arc<dyn SandboxEnvironment>>;
}

// ─── Local sandbox ────────────────────────────────────────────────────────────

/// Sandbox backed by a temp directory on the host.
///
/// Suitable for trusted tool code and tests; container isolation is a
/// separate provider behind the same trait.
pub struct LocalSandbox {
    root: PathBuf,
    cleanup: CleanupPolicy,
}

impl LocalSandbox {
    pub async fn init(cleanup: CleanupPolicy) -> anyhow::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("verdict-sandbox-")
            .tempdir()?
            // lifetime is managed by teardown(), not Drop
            .keep();
        debug!(root = %root.display(), "sandbox created");
        Ok(Self { root, cleanup })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

#[async_trait]
impl SandboxEnvironment for LocalSandbox {
    async fn exec(
        &self,
        cmd: &[String],
        input: Option<&str>,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        user: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| SandboxError::Unknown("empty command".to_string()))?;
        if user.is_some() {
            return Err(SandboxError::Permission(
                "local sandbox cannot switch user".to_string(),
            ));
        }

        // global ceiling on sandbox exec fan-out
        let _permit =
            crate::concurrency("subprocesses", crate::max_subprocesses()).await;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd.map(|c| self.root.join(c)).unwrap_or_else(|| self.root.clone()))
            .envs(env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::from_io(e, program))?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(text.as_bytes()).await;
            }
        }

        let wait = child.wait_with_output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| SandboxError::Timeout(limit))?,
            None => wait.await,
        }
        .map_err(|e| SandboxError::Unknown(e.to_string()))?;

        let returncode = output.status.code().unwrap_or(-1);
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            returncode,
            success: output.status.success(),
        })
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let resolved = self.resolve(path);
        if resolved.is_dir() {
            return Err(SandboxError::IsADirectory(path.to_string()));
        }
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| SandboxError::from_io(e, path))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::from_io(e, path))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| SandboxError::from_io(e, path))
    }

    async fn connection(&self) -> Option<SandboxConnection> {
        Some(SandboxConnection {
            command: format!("cd {}", self.root.display()),
            vscode_command: None,
        })
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        match self.cleanup {
            CleanupPolicy::Always => {
                if let Err(err) = tokio::fs::remove_dir_all(&self.root).await {
                    warn!(root = %self.root.display(), "sandbox cleanup failed: {err}");
                    return Err(err.into());
                }
                Ok(())
            }
            CleanupPolicy::Never => {
                debug!(root = %self.root.display(), "sandbox kept (cleanup disabled)");
                Ok(())
            }
        }
    }
}

/// Provider for [`LocalSandbox`] environments.
#[derive(Default)]
pub struct LocalSandboxProvider;

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn init(
        &self,
        spec: &SandboxSpec,
        cleanup: CleanupPolicy,
    ) -> anyhow::Result<std::sync::Arc<dyn SandboxEnvironment>> {
        if spec.kind != "local" {
            anyhow::bail!("unsupported sandbox kind: {}", spec.kind);
        }
        Ok(std::sync::Arc::new(LocalSandbox::init(cleanup).await?))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> LocalSandbox {
        LocalSandbox::init(CleanupPolicy::Always).await.unwrap()
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_status() {
        let sb = sandbox().await;
        let result = sb
            .exec(&cmd(&["echo", "hi"]), None, None, &HashMap::new(), None, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout.trim(), "hi");
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn exec_nonzero_exit_is_not_success() {
        let sb = sandbox().await;
        let result = sb
            .exec(&cmd(&["sh", "-c", "exit 3"]), None, None, &HashMap::new(), None, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.returncode, 3);
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn exec_timeout_maps_to_timeout_error() {
        let sb = sandbox().await;
        let err = sb
            .exec(
                &cmd(&["sleep", "5"]),
                None,
                None,
                &HashMap::new(),
                None,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_call_error().kind, ToolCallErrorKind::Timeout);
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn exec_missing_program_maps_to_file_not_found() {
        let sb = sandbox().await;
        let err = sb
            .exec(
                &cmd(&["definitely-not-a-real-binary-xyz"]),
                None,
                None,
                &HashMap::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_call_error().kind, ToolCallErrorKind::FileNotFound);
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn exec_forwards_stdin() {
        let sb = sandbox().await;
        let result = sb
            .exec(&cmd(&["cat"]), Some("piped"), None, &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "piped");
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn file_round_trip_and_directory_error() {
        let sb = sandbox().await;
        sb.write_file("sub/data.txt", b"content").await.unwrap();
        assert_eq!(sb.read_file("sub/data.txt").await.unwrap(), b"content");
        let err = sb.read_file("sub").await.unwrap_err();
        assert_eq!(err.to_call_error().kind, ToolCallErrorKind::IsADirectory);
        let err = sb.read_file("missing.txt").await.unwrap_err();
        assert_eq!(err.to_call_error().kind, ToolCallErrorKind::FileNotFound);
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn teardown_removes_root_when_cleanup_always() {
        let sb = sandbox().await;
        let root = sb.root().to_path_buf();
        assert!(root.exists());
        sb.teardown().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn teardown_keeps_root_when_cleanup_never() {
        let sb = LocalSandbox::init(CleanupPolicy::Never).await.unwrap();
        let root = sb.root().to_path_buf();
        sb.teardown().await.unwrap();
        assert!(root.exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn provider_rejects_unknown_kind() {
        let provider = LocalSandboxProvider;
        let spec = SandboxSpec {
            kind: "docker".into(),
            options: serde_json::Value::Null,
        };
        assert!(provider.init(&spec, CleanupPolicy::Always).await.is_err());
    }
}
