//! Layered configuration for conductor.
//!
//! Sources are merged in ascending priority: embedded defaults, a
//! project-local config file, a user config directory file, an explicit
//! CLI-provided path, then `CONDUCTOR_`-prefixed environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Path to the git repository agents work against.
    pub path: String,
    /// Branch new worktrees are created from when the caller doesn't name one.
    pub base_branch: String,
    /// Directory new worktrees are created under.
    pub worktrees_root: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            base_branch: "main".to_string(),
            worktrees_root: ".conductor/worktrees".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Review budget used when a caller doesn't supply one on `execute`.
    pub default_max_reviews: i64,
    /// Command used to launch the AI process (e.g. `claude`).
    pub ai_command: String,
    pub ai_args: Vec<String>,
    /// Command used to spawn the per-instance tool server.
    pub tool_server_command: String,
    pub tool_server_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_reviews: 3,
            ai_command: "claude".to_string(),
            ai_args: Vec::new(),
            tool_server_command: "conductor-tool-server".to_string(),
            tool_server_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Optional `tmux -L <socket>` socket name; empty uses the default socket.
    pub socket: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            socket: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file. Relative to cwd unless absolute.
    pub database: String,
    /// Directory log files are written to, relative to cwd unless absolute.
    pub state: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: ".conductor/conductor.db".to_string(),
            state: ".conductor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub repo: RepoConfig,
    pub agent: AgentConfig,
    pub multiplexer: MultiplexerConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Path to the project-local config file, relative to cwd.
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".conductor/config.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("conductor").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::project_config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.resolve(&self.repo.path)
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.resolve(&self.repo.worktrees_root)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.paths.database)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.paths.state)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.agent.default_max_reviews, config.agent.default_max_reviews);
        assert_eq!(parsed.repo.base_branch, config.repo.base_branch);
    }

    #[test]
    fn paths_resolve_relative_to_cwd() {
        let mut config = Config::default();
        config.paths.database = "db.sqlite".to_string();
        let resolved = config.database_path();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("db.sqlite"));
    }

    #[test]
    fn absolute_paths_pass_through_unchanged() {
        let mut config = Config::default();
        config.paths.state = "/tmp/conductor-state".to_string();
        assert_eq!(config.state_path(), PathBuf::from("/tmp/conductor-state"));
        assert_eq!(config.logs_path(), PathBuf::from("/tmp/conductor-state/logs"));
    }
}
