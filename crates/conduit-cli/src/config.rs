//! Configuration file management for conduit.
//!
//! Provides a TOML-based config file at `~/.config/conduit/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use conduit_core::orchestrator::{DEFAULT_EVENT_BUFFER, DEFAULT_KILL_GRACE};
use conduit_core::{OrchestratorConfig, SupervisorConfig};

pub const BINARY_ENV: &str = "CONDUIT_AGENT_BINARY";
pub const TIMEOUT_ENV: &str = "CONDUIT_TIMEOUT_SECS";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub agent: AgentSection,
    pub invocation: InvocationSection,
    pub server: ServerSection,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent CLI binary, looked up on `$PATH` unless absolute.
    pub binary: String,
    /// Arguments appended to every invocation.
    pub extra_args: Vec<String>,
    /// Extra environment for the agent process.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            binary: defaults.binary,
            extra_args: defaults.extra_args,
            env: defaults.env,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationSection {
    /// Text sent as the first `response-delta` of every invocation.
    pub acknowledgment: Option<String>,
    /// Per-invocation timeout; `0` or absent disables it.
    pub timeout_secs: Option<u64>,
    pub kill_grace_secs: u64,
    pub event_buffer: usize,
}

impl Default for InvocationSection {
    fn default() -> Self {
        Self {
            acknowledgment: None,
            timeout_secs: None,
            kill_grace_secs: DEFAULT_KILL_GRACE.as_secs(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7878,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the conduit config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/conduit` or `~/.config/conduit`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("conduit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("conduit")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file. A missing file yields the defaults; an unreadable
/// or invalid one is an error.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Overrides taken from the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub binary: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub supervisor: SupervisorConfig,
    pub orchestrator: OrchestratorConfig,
    pub server: ServerSection,
}

impl ConduitConfig {
    /// Resolve configuration from the config file, the environment and `cli`.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        Self::from_file(load_config()?, cli)
    }

    /// Resolve using the chain: CLI flag > env var > `file` > default.
    ///
    /// - Binary: `cli.binary` > `CONDUIT_AGENT_BINARY` > `agent.binary`
    /// - Timeout: `cli.timeout_secs` > `CONDUIT_TIMEOUT_SECS` > `invocation.timeout_secs`
    pub fn from_file(file: ConfigFile, cli: &CliOverrides) -> Result<Self> {
        let binary = if let Some(binary) = &cli.binary {
            binary.clone()
        } else if let Ok(binary) = std::env::var(BINARY_ENV) {
            binary
        } else {
            file.agent.binary
        };

        let timeout_secs = if let Some(secs) = cli.timeout_secs {
            Some(secs)
        } else if let Ok(raw) = std::env::var(TIMEOUT_ENV) {
            Some(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("{TIMEOUT_ENV} is not a number of seconds: {raw:?}"))?,
            )
        } else {
            file.invocation.timeout_secs
        };

        Ok(Self {
            supervisor: SupervisorConfig {
                binary,
                extra_args: file.agent.extra_args,
                env: file.agent.env,
            },
            orchestrator: OrchestratorConfig {
                acknowledgment: file.invocation.acknowledgment.filter(|a| !a.is_empty()),
                timeout: timeout_secs.filter(|&s| s > 0).map(Duration::from_secs),
                kill_grace: Duration::from_secs(file.invocation.kill_grace_secs),
                event_buffer: file.invocation.event_buffer,
            },
            server: file.server,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
