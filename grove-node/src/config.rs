//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use grove_core::wire::MAX_FRAME_LEN;

/// Daemon configuration. File: ~/.config/grove/config.toml or
/// /etc/grove/config.toml. Env overrides: GROVE_HOST, GROVE_LEAF_PORT,
/// GROVE_GOSSIP_PORT, GROVE_MAX_FRAME_LEN, GROVE_SIBLINGS (comma-separated
/// host:port list).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen host (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,
    /// Leaf-facing listen port (default 9999).
    #[serde(default = "default_leaf_port")]
    pub leaf_port: u16,
    /// Sibling-gossip listen port (default 4444). `None` disables the
    /// gossip listener entirely; a standalone ultrapeer serves leaves only.
    #[serde(default = "default_gossip_port")]
    pub gossip_port: Option<u16>,
    /// Sibling ultrapeer addresses to dial at startup (host:port).
    #[serde(default)]
    pub siblings: Vec<String>,
    /// Maximum frame payload size in bytes (default 1 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_leaf_port() -> u16 {
    9999
}
fn default_gossip_port() -> Option<u16> {
    Some(4444)
}
fn default_max_frame_len() -> u32 {
    MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            leaf_port: default_leaf_port(),
            gossip_port: default_gossip_port(),
            siblings: Vec::new(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("GROVE_HOST") {
        if !s.is_empty() {
            c.host = s;
        }
    }
    if let Ok(s) = std::env::var("GROVE_LEAF_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.leaf_port = p;
        }
    }
    if let Ok(s) = std::env::var("GROVE_GOSSIP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.gossip_port = Some(p);
        }
    }
    if let Ok(s) = std::env::var("GROVE_MAX_FRAME_LEN") {
        if let Ok(n) = s.parse::<u32>() {
            c.max_frame_len = n;
        }
    }
    if let Ok(s) = std::env::var("GROVE_SIBLINGS") {
        c.siblings = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/grove/config.toml"));
    }
    out.push(PathBuf::from("/etc/grove/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
