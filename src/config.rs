//! Minimal TOML configuration for the core server, hot-swappable via
//! [`arc_swap::ArcSwap`] per `spec.md` §5 and §9.
//!
//! The full JSON-schema admin config and its dashboard editor are explicit
//! Non-goals (`spec.md` §1); this is just enough to boot the process: which
//! roots exist, which token maps to which root/policy, and the server-wide
//! defaults and limits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::policy::Policy;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub quota_bytes: u64,
    #[serde(default)]
    pub per_file_cap: u64,
    #[serde(default = "default_true")]
    pub disk_images_enabled: bool,
    #[serde(default)]
    pub disk_images_write_enabled: bool,
    #[serde(default)]
    pub disk_images_auto_resize_enabled: bool,
    #[serde(default)]
    pub disk_images_allow_rename_convert: bool,
    #[serde(default)]
    pub trash_enabled: bool,
    #[serde(default = "default_trash_dir")]
    pub trash_dir: String,
    #[serde(default = "default_true")]
    pub overwrite_enabled: bool,
    #[serde(default = "default_true")]
    pub errmsg_enabled: bool,
    #[serde(default = "default_true")]
    pub mkdir_parents_enabled: bool,
    #[serde(default = "default_true")]
    pub rmdir_recursive_enabled: bool,
    #[serde(default = "default_true")]
    pub cp_recursive_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_trash_dir() -> String {
    ".TRASH".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_chunk")]
    pub max_chunk: u16,
    #[serde(default = "default_max_payload")]
    pub max_payload: u16,
    #[serde(default = "default_max_path")]
    pub max_path: u16,
    #[serde(default = "default_max_name")]
    pub max_name: u16,
    #[serde(default = "default_max_entries")]
    pub max_entries: u16,
}

fn default_max_chunk() -> u16 {
    4096
}
fn default_max_payload() -> u16 {
    8192
}
fn default_max_path() -> u16 {
    1024
}
fn default_max_name() -> u16 {
    255
}
fn default_max_entries() -> u16 {
    512
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_chunk: default_max_chunk(),
            max_payload: default_max_payload(),
            max_path: default_max_path(),
            max_name: default_max_name(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub endpoint_path: String,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub global_policy: GlobalPolicy,
    pub tokens: HashMap<String, TokenConfig>,
    /// Compatibility rule: strip trailing `.PRG` from user-visible names.
    #[serde(default)]
    pub prg_fallback_enabled: bool,
    /// Firmware compat rule: when only `GAME.PRG` exists and `GAME` is
    /// requested, read through the fallback (`spec.md` §8 scenario 5).
    #[serde(default)]
    pub prg_fallback_read_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalPolicy {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub quota_bytes: u64,
    #[serde(default)]
    pub per_file_cap: u64,
    #[serde(default = "default_true")]
    pub disk_images_enabled: bool,
    #[serde(default)]
    pub disk_images_write_enabled: bool,
    #[serde(default)]
    pub disk_images_auto_resize_enabled: bool,
    #[serde(default)]
    pub disk_images_allow_rename_convert: bool,
    #[serde(default)]
    pub trash_enabled: bool,
    #[serde(default = "default_true")]
    pub overwrite_enabled: bool,
    #[serde(default = "default_true")]
    pub errmsg_enabled: bool,
    #[serde(default = "default_true")]
    pub mkdir_parents_enabled: bool,
    #[serde(default = "default_true")]
    pub rmdir_recursive_enabled: bool,
    #[serde(default = "default_true")]
    pub cp_recursive_enabled: bool,
}

impl GlobalPolicy {
    fn as_policy(&self, root: PathBuf) -> Policy {
        Policy {
            root,
            display_name: None,
            read_only: self.read_only,
            quota_bytes: self.quota_bytes,
            per_file_cap: self.per_file_cap,
            disk_images_enabled: self.disk_images_enabled,
            disk_images_write_enabled: self.disk_images_write_enabled,
            disk_images_auto_resize_enabled: self.disk_images_auto_resize_enabled,
            disk_images_allow_rename_convert: self.disk_images_allow_rename_convert,
            trash_enabled: self.trash_enabled,
            trash_dir: default_trash_dir(),
            overwrite_enabled: self.overwrite_enabled,
            errmsg_enabled: self.errmsg_enabled,
            mkdir_parents_enabled: self.mkdir_parents_enabled,
            rmdir_recursive_enabled: self.rmdir_recursive_enabled,
            cp_recursive_enabled: self.cp_recursive_enabled,
        }
    }
}

impl TokenConfig {
    fn as_policy(&self) -> Policy {
        Policy {
            root: self.root.clone(),
            display_name: self.display_name.clone(),
            read_only: self.read_only,
            quota_bytes: self.quota_bytes,
            per_file_cap: self.per_file_cap,
            disk_images_enabled: self.disk_images_enabled,
            disk_images_write_enabled: self.disk_images_write_enabled,
            disk_images_auto_resize_enabled: self.disk_images_auto_resize_enabled,
            disk_images_allow_rename_convert: self.disk_images_allow_rename_convert,
            trash_enabled: self.trash_enabled,
            trash_dir: self.trash_dir.clone(),
            overwrite_enabled: self.overwrite_enabled,
            errmsg_enabled: self.errmsg_enabled,
            mkdir_parents_enabled: self.mkdir_parents_enabled,
            rmdir_recursive_enabled: self.rmdir_recursive_enabled,
            cp_recursive_enabled: self.cp_recursive_enabled,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    UnknownToken,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::UnknownToken => write!(f, "unknown token"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }

    /// Resolves a query-string token into the effective, combined policy.
    pub fn resolve_token(&self, token: &str) -> Result<Policy, ConfigError> {
        let token_cfg = self.tokens.get(token).ok_or(ConfigError::UnknownToken)?;
        let global = self.global_policy.as_policy(token_cfg.root.clone());
        Ok(Policy::combine(&global, &token_cfg.as_policy()))
    }
}

/// Hot-swappable config snapshot. Handlers capture a clone of the `Arc` at
/// request entry (`spec.md` §5); the binary swaps it on `SIGHUP` or an
/// admin-triggered reload (the admin surface itself is out of core scope).
pub struct ConfigHandle(ArcSwap<Config>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self(ArcSwap::from_pointee(config))
    }

    pub fn load(&self) -> Arc<Config> {
        self.0.load_full()
    }

    pub fn store(&self, config: Config) {
        self.0.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml_str = r#"
            server_name = "w64fsd"
            listen_addr = "0.0.0.0:6464"
            endpoint_path = "/rpc"

            [tokens.abc123]
            root = "/srv/disks/abc"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.tokens.len(), 1);
        let policy = cfg.resolve_token("abc123").unwrap();
        assert_eq!(policy.root, PathBuf::from("/srv/disks/abc"));
        assert!(policy.disk_images_enabled);
        assert!(!policy.read_only);
    }

    #[test]
    fn unknown_token_is_an_error() {
        let cfg: Config = toml::from_str(
            r#"
            [tokens.abc]
            root = "/srv/abc"
        "#,
        )
        .unwrap();
        assert!(matches!(cfg.resolve_token("nope"), Err(ConfigError::UnknownToken)));
    }

    #[test]
    fn global_read_only_combines_with_token() {
        let cfg: Config = toml::from_str(
            r#"
            [global_policy]
            read_only = true

            [tokens.abc]
            root = "/srv/abc"
        "#,
        )
        .unwrap();
        assert!(cfg.resolve_token("abc").unwrap().read_only);
    }
}
