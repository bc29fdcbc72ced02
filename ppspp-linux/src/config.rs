//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use ppspp_core::SwarmId;
use serde::Deserialize;

/// What the daemon does with its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Serve an existing file; the swarm ID is its root hash.
    Seed,
    /// Download `swarm_id` into the file.
    Leech,
}

/// Daemon configuration. File: ~/.config/ppspp/config.toml or /etc/ppspp/config.toml.
/// Env overrides: PPSPP_LISTEN_PORT, PPSPP_PEERS (comma separated), PPSPP_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port for swarm traffic (default 6778).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peers to contact at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_file")]
    pub file: PathBuf,
    /// Hex swarm ID. Required to leech.
    #[serde(default)]
    pub swarm_id: Option<String>,
    /// Chunks in the content. Required to leech.
    #[serde(default)]
    pub chunk_count: Option<u64>,
    /// Hash tree checkpoint; written on completion and shutdown, read on start.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    /// Timer granularity for retransmits and keepalives.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Announce and find swarm peers with LAN multicast beacons.
    #[serde(default)]
    pub lan_discovery: bool,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default)]
    pub protocol: ppspp_core::Config,
}

fn default_listen_port() -> u16 {
    6778
}
fn default_log_filter() -> String {
    "info".into()
}
fn default_mode() -> Mode {
    Mode::Seed
}
fn default_file() -> PathBuf {
    PathBuf::from("content.bin")
}
fn default_tick_ms() -> u64 {
    100
}
fn default_discovery_port() -> u16 {
    6779
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            peers: Vec::new(),
            log_filter: default_log_filter(),
            mode: default_mode(),
            file: default_file(),
            swarm_id: None,
            chunk_count: None,
            checkpoint: None,
            tick_ms: default_tick_ms(),
            lan_discovery: false,
            discovery_port: default_discovery_port(),
            protocol: ppspp_core::Config::default(),
        }
    }
}

impl Config {
    /// Decoded `swarm_id`, if set.
    pub fn swarm_id(&self) -> anyhow::Result<Option<SwarmId>> {
        self.swarm_id
            .as_deref()
            .map(|s| {
                hex::decode(s.trim())
                    .map(SwarmId)
                    .with_context(|| format!("swarm_id {s:?} is not hex"))
            })
            .transpose()
    }

    /// Apply PPSPP_* overrides. `var` looks up one variable.
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("PPSPP_LISTEN_PORT") {
            self.listen_port = s
                .parse()
                .with_context(|| format!("PPSPP_LISTEN_PORT={s:?}"))?;
        }
        if let Some(s) = var("PPSPP_PEERS") {
            self.peers = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse().with_context(|| format!("PPSPP_PEERS entry {p:?}")))
                .collect::<anyhow::Result<_>>()?;
        }
        if let Some(s) = var("PPSPP_LOG") {
            self.log_filter = s;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.mode == Mode::Leech && (self.swarm_id.is_none() || self.chunk_count.is_none()) {
            bail!("leech mode needs swarm_id and chunk_count");
        }
        if self.tick_ms == 0 {
            bail!("tick_ms must be positive");
        }
        self.protocol.validate().context("protocol section")?;
        self.swarm_id()?;
        Ok(())
    }
}

/// Load config: defaults, then the config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ppspp/config.toml"));
    }
    out.push(PathBuf::from("/etc/ppspp/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
