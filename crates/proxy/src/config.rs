//! TOML configuration for the standalone proxy daemon.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::cipher::block::BlockKey;
use crate::services::{
    License, PortDirectory, Services, StaticKeyPalette, StaticLicenseAuthority,
};
use crate::version::GameVersion;

/// Minimal config loader.
///
/// Search order:
/// 1) `SHIPGATE_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(&text)
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
        toml::from_str(text).context("Failed to parse TOML")
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os("SHIPGATE_CONFIG_DIR") {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        // Repo convenience: <repo_root>/config/<relative_path>. This crate
        // lives at <repo_root>/crates/proxy.
        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}

#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    /// Well-known name other subsystems look the port up by (`gc-us3`,
    /// `bb-login`, ...). Unnamed listeners still accept connections.
    pub name: Option<String>,
    pub port: u16,
    pub version: GameVersion,
    /// Preset upstream for clients arriving on this port. Required for
    /// patch listeners, optional elsewhere.
    pub destination: Option<SocketAddrV4>,
}

#[derive(Debug, Deserialize)]
pub struct LicenseConfig {
    /// Serial number in hex, as clients type it.
    pub serial_number: String,
    pub access_key: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyConfig {
    pub name: String,
    /// Opaque key material, expanded into the cipher tables.
    pub material: String,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_control_listen")]
    pub control_listen: String,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub licenses: Vec<LicenseConfig>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

fn default_name() -> String {
    "Shipgate".to_string()
}

fn default_control_listen() -> String {
    "127.0.0.1:9099".to_string()
}

impl ProxyConfig {
    pub fn build_services(&self) -> anyhow::Result<Services> {
        let mut licenses = Vec::new();
        for entry in &self.licenses {
            let serial_number = u32::from_str_radix(entry.serial_number.trim(), 16)
                .with_context(|| format!("license serial {:?} is not hex", entry.serial_number))?;
            licenses.push(License {
                serial_number,
                access_key: entry.access_key.clone(),
                password: entry.password.clone(),
                username: entry.username.clone(),
            });
        }

        let keys = self
            .keys
            .iter()
            .map(|k| Arc::new(BlockKey::derive(k.name.clone(), k.material.as_bytes())))
            .collect();

        let mut ports = HashMap::new();
        for listener in &self.listeners {
            if let Some(name) = &listener.name {
                ports.insert(name.clone(), listener.port);
            }
        }

        Ok(Services {
            name: self.name.clone(),
            licenses: Arc::new(StaticLicenseAuthority::new(licenses)),
            keys: Arc::new(StaticKeyPalette::new(keys)),
            ports: PortDirectory::new(ports),
            save_dir: self.save_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            disassembler: None,
        })
    }
}
