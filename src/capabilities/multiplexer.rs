//! Multiplexer capability: create/kill a terminal session and push keys
//! into it. Grounded on the teacher's `SystemTmuxClient` and
//! `sanitize_session_name` (`src/agents/tmux.rs`), reshaped into the
//! `async_trait` contract the teacher already uses for `SessionWrapper`
//! (`src/agents/terminal_wrapper.rs`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::error::ErrorCode;

#[derive(Debug, Clone, Default)]
pub struct MultiplexerOptions {
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MultiplexerSession {
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error("invalid session name {0:?}")]
    InvalidName(String),
    #[error("working directory {0} is not an existing absolute path")]
    InvalidWorkingDirectory(String),
    #[error("invalid environment variable key {0:?}")]
    InvalidEnvKey(String),
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("tmux is not installed")]
    NotInstalled,
    #[error("multiplexer command failed: {0}")]
    CommandFailed(String),
}

impl ErrorCode for MultiplexerError {
    fn code(&self) -> &'static str {
        match self {
            MultiplexerError::InvalidName(_) => "MULTIPLEXER_INVALID_NAME",
            MultiplexerError::InvalidWorkingDirectory(_) => {
                "MULTIPLEXER_INVALID_WORKING_DIRECTORY"
            }
            MultiplexerError::InvalidEnvKey(_) => "MULTIPLEXER_INVALID_ENV_KEY",
            MultiplexerError::SessionExists(_) => "MULTIPLEXER_SESSION_EXISTS",
            MultiplexerError::SessionNotFound(_) => "MULTIPLEXER_SESSION_NOT_FOUND",
            MultiplexerError::NotInstalled => "MULTIPLEXER_NOT_INSTALLED",
            MultiplexerError::CommandFailed(_) => "MULTIPLEXER_COMMAND_FAILED",
        }
    }
}

static SAFE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static SAFE_ENV_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Rejects session names, working directories, and env keys that could
/// enable shell injection before any argument reaches a process launcher.
pub fn validate_session_name(name: &str) -> Result<(), MultiplexerError> {
    if name.is_empty() || !SAFE_NAME.is_match(name) {
        return Err(MultiplexerError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn validate_working_directory(path: &Path) -> Result<(), MultiplexerError> {
    if !path.is_absolute() || !path.exists() {
        return Err(MultiplexerError::InvalidWorkingDirectory(
            path.display().to_string(),
        ));
    }
    Ok(())
}

pub fn validate_env(env: &HashMap<String, String>) -> Result<(), MultiplexerError> {
    for key in env.keys() {
        if !SAFE_ENV_KEY.is_match(key) {
            return Err(MultiplexerError::InvalidEnvKey(key.clone()));
        }
    }
    Ok(())
}

/// Maps any non-alphanumeric, non `-`/`_` character to `-`, mirroring the
/// teacher's `sanitize_session_name`.
pub fn sanitize_session_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
pub trait MultiplexerCapability: Send + Sync {
    async fn create(
        &self,
        name: &str,
        working_directory: &Path,
        options: &MultiplexerOptions,
    ) -> Result<MultiplexerSession, MultiplexerError>;

    async fn kill(&self, name: &str) -> Result<(), MultiplexerError>;

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), MultiplexerError>;

    async fn session_exists(&self, name: &str) -> Result<bool, MultiplexerError>;
}

/// Shells out to the real `tmux` binary on a dedicated socket, grounded on
/// `SystemTmuxClient::run_tmux`.
pub struct SystemTmuxCapability {
    socket_name: Option<String>,
}

impl SystemTmuxCapability {
    pub fn new() -> Self {
        Self { socket_name: None }
    }

    pub fn with_socket(socket_name: impl Into<String>) -> Self {
        Self {
            socket_name: Some(socket_name.into()),
        }
    }

    fn run_tmux(&self, args: &[&str]) -> Result<Output, MultiplexerError> {
        let mut cmd = std::process::Command::new("tmux");
        if let Some(ref socket) = self.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MultiplexerError::NotInstalled
            } else {
                MultiplexerError::CommandFailed(e.to_string())
            }
        })
    }
}

impl Default for SystemTmuxCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MultiplexerCapability for SystemTmuxCapability {
    #[instrument(skip(self, options), fields(name))]
    async fn create(
        &self,
        name: &str,
        working_directory: &Path,
        options: &MultiplexerOptions,
    ) -> Result<MultiplexerSession, MultiplexerError> {
        validate_session_name(name)?;
        validate_working_directory(working_directory)?;
        validate_env(&options.env)?;

        if self.session_exists(name).await? {
            return Err(MultiplexerError::SessionExists(name.to_string()));
        }

        let working_dir = working_directory.to_string_lossy().to_string();
        let output = self.run_tmux(&["new-session", "-d", "-s", name, "-c", &working_dir])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MultiplexerError::CommandFailed(stderr));
        }

        for (key, value) in &options.env {
            let kv = format!("{key}={value}");
            self.run_tmux(&["set-environment", "-t", name, key, &kv])?;
        }

        debug!(session = %name, "tmux session created");
        Ok(MultiplexerSession {
            name: name.to_string(),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), MultiplexerError> {
        let output = self.run_tmux(&["kill-session", "-t", name])?;
        if !output.status.success() {
            return Err(MultiplexerError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), MultiplexerError> {
        let output = self.run_tmux(&["send-keys", "-t", name, text, "Enter"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MultiplexerError::CommandFailed(stderr));
        }
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MultiplexerError> {
        let output = self.run_tmux(&["has-session", "-t", &format!("={name}")]);
        match output {
            Ok(out) => Ok(out.status.success()),
            Err(MultiplexerError::NotInstalled) => Err(MultiplexerError::NotInstalled),
            Err(_) => Ok(false),
        }
    }
}

/// In-memory fake for tests — tracks created/killed sessions without
/// spawning a real tmux process.
#[derive(Default)]
pub struct FakeMultiplexerCapability {
    pub sessions: parking_lot::Mutex<std::collections::HashSet<String>>,
    pub fail_create: parking_lot::Mutex<Option<MultiplexerError>>,
    pub sent_keys: parking_lot::Mutex<Vec<(String, String)>>,
}

impl FakeMultiplexerCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: MultiplexerError) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(std::collections::HashSet::new()),
            fail_create: parking_lot::Mutex::new(Some(err)),
            sent_keys: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MultiplexerCapability for FakeMultiplexerCapability {
    async fn create(
        &self,
        name: &str,
        working_directory: &Path,
        options: &MultiplexerOptions,
    ) -> Result<MultiplexerSession, MultiplexerError> {
        // Unlike `SystemTmuxCapability`, this fake never touches the real
        // filesystem, so it doesn't require `working_directory` to exist —
        // only the session-name and env-key shapes are validated.
        let _ = working_directory;
        validate_session_name(name)?;
        validate_env(&options.env)?;

        if let Some(err) = self.fail_create.lock().take() {
            return Err(err);
        }
        self.sessions.lock().insert(name.to_string());
        Ok(MultiplexerSession {
            name: name.to_string(),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), MultiplexerError> {
        if self.sessions.lock().remove(name) {
            Ok(())
        } else {
            Err(MultiplexerError::SessionNotFound(name.to_string()))
        }
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), MultiplexerError> {
        if !self.sessions.lock().contains(name) {
            return Err(MultiplexerError::SessionNotFound(name.to_string()));
        }
        self.sent_keys.lock().push((name.to_string(), text.to_string()));
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MultiplexerError> {
        Ok(self.sessions.lock().contains(name))
    }
}
