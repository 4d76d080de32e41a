//! Proxy configuration: on-disk schema, discovery order, and CLI-merge.
//!
//! Configuration is a YAML or JSON document discovered in a fixed order
//! (explicit path, then `config.{yaml,yml,json}` in the working directory,
//! then a per-user fallback under `$XDG_CONFIG_HOME`), deserialized with
//! `#[serde(default)]` throughout so every field is optional on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> u8 {
    1
}

fn default_stats_interval_minutes() -> u64 {
    5
}

fn default_ca_cert_dir() -> PathBuf {
    dirs_home().join(".waylay_certs")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_internal_hosts() -> Vec<String> {
    vec![
        "googleapis.com".to_string(),
        "google.com".to_string(),
        "chrome-extension".to_string(),
        "moz-extension".to_string(),
        "optimizationguide-pa.googleapis.com".to_string(),
    ]
}

fn default_grace_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub port: u16,
    pub host: IpAddr,
    #[serde(rename = "logLevel")]
    pub log_level: u8,
    #[serde(rename = "statsInterval")]
    pub stats_interval_minutes: u64,
    #[serde(rename = "caCertDir")]
    pub ca_cert_dir: PathBuf,
    #[serde(rename = "shutdownGraceSeconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            log_level: default_log_level(),
            stats_interval_minutes: default_stats_interval_minutes(),
            ca_cert_dir: default_ca_cert_dir(),
            shutdown_grace_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "rulesDir")]
    pub rules_dir: PathBuf,
    pub proxy: ProxySettings,
    pub debug: bool,
    pub ui: bool,
    #[serde(rename = "internalHosts")]
    pub internal_hosts: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            proxy: ProxySettings::default(),
            debug: false,
            ui: false,
            internal_hosts: default_internal_hosts(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, inferring format from extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse JSON config '{}'", path.display()))?,
            _ => serde_yaml::from_str(&text)
                .with_context(|| format!("failed to parse YAML config '{}'", path.display()))?,
        };
        Ok(config)
    }

    /// Discover a config file following the documented search order.
    ///
    /// Order: `explicit` if given, then `config.yaml`/`config.yml`/`config.json`
    /// in the current directory, then `$XDG_CONFIG_HOME/waylay/config.yaml`
    /// (or `~/.config/waylay/config.yaml`). Returns `None` if nothing is found
    /// and no explicit path was given, in which case defaults apply.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in ["config.yaml", "config.yml", "config.json"] {
            let path = Path::new(candidate);
            if path.is_file() {
                return Self::from_file(path);
            }
        }

        let user_config = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs_home().join(".config"))
            .join("waylay")
            .join("config.yaml");
        if user_config.is_file() {
            return Self::from_file(&user_config);
        }

        Ok(Self::default())
    }

    /// Apply CLI overrides on top of a loaded (or default) configuration.
    /// CLI flags always win.
    pub fn apply_overrides(&mut self, overrides: &crate::cli::Overrides) {
        if let Some(rules) = &overrides.rules_dir {
            self.rules_dir = rules.clone();
        }
        if let Some(level) = overrides.log_level {
            self.proxy.log_level = level;
        }
        if let Some(ui) = overrides.ui {
            self.ui = ui;
        }
        if let Some(debug) = overrides.debug {
            self.debug = debug;
        }
        if let Ok(env_level) = std::env::var("PROXY_LOG_LEVEL") {
            if let Ok(level) = env_level.parse() {
                self.proxy.log_level = level;
            }
        }
    }

    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.proxy.host, self.proxy.port)
    }
}
