//! Flint configuration
//!
//! Stored as JSON at `~/.flint/config.json`. Every field has a default, so a
//! partial (or missing) file is valid; `FLINT_*` environment variables
//! override whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlintConfig {
    /// Bearer token for API access (64 hex chars once generated)
    pub api_key: String,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Security configuration
    pub security: SecurityConfig,

    /// libvirt configuration
    pub libvirt: LibvirtConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web UI configuration
    pub web: WebConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds
    pub read_timeout: u64,
    /// Seconds
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5550,
            read_timeout: 30,
            write_timeout: 30,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Requests per minute per client
    pub rate_limit_requests: u32,

    /// Burst size
    pub rate_limit_burst: u32,

    /// bcrypt (or legacy SHA-256 hex) hash of the web UI passphrase
    pub passphrase_hash: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_requests: 100,
            rate_limit_burst: 20,
            passphrase_hash: String::new(),
        }
    }
}

/// libvirt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
    pub iso_pool: String,
    pub template_pool: String,
    pub image_pool_path: String,
    pub ssh: LibvirtSshConfig,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            iso_pool: "isos".to_string(),
            template_pool: "templates".to_string(),
            image_pool_path: "/var/lib/flint/images".to_string(),
            ssh: LibvirtSshConfig::default(),
        }
    }
}

/// SSH tunnel settings for remote libvirt hosts. Key auth only; no password
/// is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtSshConfig {
    pub enabled: bool,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub key_path: String,
    pub known_hosts_path: String,
}

impl Default for LibvirtSshConfig {
    fn default() -> Self {
        let ssh_dir = crate::home_dir().join(".ssh");
        Self {
            enabled: false,
            username: String::new(),
            host: String::new(),
            port: 22,
            key_path: ssh_dir.join("id_rsa").to_string_lossy().into_owned(),
            known_hosts_path: ssh_dir.join("known_hosts").to_string_lossy().into_owned(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// DEBUG, INFO, WARN, ERROR, FATAL
    pub level: String,
    /// json or text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: "json".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Map the configured level onto a tracing filter directive.
    pub fn filter_directive(&self) -> &'static str {
        match self.level.as_str() {
            "DEBUG" => "debug",
            "WARN" => "warn",
            "ERROR" | "FATAL" => "error",
            _ => "info",
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

/// Web UI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebConfig {
    /// Directory holding the built UI (index.html + assets)
    pub ui_dir: Option<PathBuf>,
}

const LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARN", "ERROR", "FATAL"];
const LOG_FORMATS: &[&str] = &["json", "text"];

impl FlintConfig {
    /// Load configuration from file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from file only. A missing file yields defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    /// Save configuration to file with owner-only permissions, creating the
    /// parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        write_private(path, content.as_bytes())?;
        debug!(
            path = %path.display(),
            passphrase_hash_length = self.security.passphrase_hash.len(),
            "Config saved"
        );
        Ok(())
    }

    /// Apply `FLINT_*` overrides. Values that fail to parse are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| var(key).filter(|v| !v.is_empty());

        if let Some(v) = get("FLINT_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("FLINT_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = get("FLINT_SERVER_READ_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.read_timeout = v;
        }
        if let Some(v) = get("FLINT_SERVER_WRITE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.write_timeout = v;
        }

        if let Some(v) = get("FLINT_SECURITY_RATE_LIMIT").and_then(|v| v.parse().ok()) {
            self.security.rate_limit_requests = v;
        }
        if let Some(v) = get("FLINT_SECURITY_RATE_BURST").and_then(|v| v.parse().ok()) {
            self.security.rate_limit_burst = v;
        }

        if let Some(v) = get("FLINT_LIBVIRT_URI") {
            self.libvirt.uri = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_ISO_POOL") {
            self.libvirt.iso_pool = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_TEMPLATE_POOL") {
            self.libvirt.template_pool = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_IMAGE_POOL_PATH") {
            self.libvirt.image_pool_path = v;
        }

        if let Some(v) = get("FLINT_LIBVIRT_SSH_ENABLED") {
            self.libvirt.ssh.enabled = v == "true" || v == "1";
        }
        if let Some(v) = get("FLINT_LIBVIRT_SSH_USERNAME") {
            self.libvirt.ssh.username = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_SSH_HOST") {
            self.libvirt.ssh.host = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_SSH_PORT").and_then(|v| v.parse().ok()) {
            self.libvirt.ssh.port = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_SSH_KEY_PATH") {
            self.libvirt.ssh.key_path = v;
        }
        if let Some(v) = get("FLINT_LIBVIRT_SSH_KNOWN_HOSTS_PATH") {
            self.libvirt.ssh.known_hosts_path = v;
        }

        if let Some(v) = get("FLINT_LOG_LEVEL") {
            self.logging.level = v.to_uppercase();
        }
        if let Some(v) = get("FLINT_LOG_FORMAT") {
            self.logging.format = v.to_lowercase();
        }

        if let Some(v) = get("FLINT_UI_DIR") {
            self.web.ui_dir = Some(PathBuf::from(v));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::InvalidConfig(format!(
                "invalid server port: {}",
                self.server.port
            )));
        }
        if self.server.read_timeout == 0 {
            return Err(Error::InvalidConfig("read timeout must be positive".into()));
        }
        if self.server.write_timeout == 0 {
            return Err(Error::InvalidConfig("write timeout must be positive".into()));
        }

        if self.security.rate_limit_requests == 0 {
            return Err(Error::InvalidConfig(
                "rate limit requests must be positive".into(),
            ));
        }
        if self.security.rate_limit_burst == 0 {
            return Err(Error::InvalidConfig("rate limit burst must be positive".into()));
        }

        if self.libvirt.uri.is_empty() {
            return Err(Error::InvalidConfig("libvirt URI cannot be empty".into()));
        }
        if self.libvirt.image_pool_path.is_empty() {
            return Err(Error::InvalidConfig("image pool path cannot be empty".into()));
        }

        let ssh = &self.libvirt.ssh;
        if ssh.enabled {
            if ssh.username.is_empty() {
                return Err(Error::InvalidConfig(
                    "SSH username is required when SSH is enabled".into(),
                ));
            }
            if ssh.host.is_empty() {
                return Err(Error::InvalidConfig(
                    "SSH host is required when SSH is enabled".into(),
                ));
            }
            if ssh.port == 0 {
                return Err(Error::InvalidConfig(format!("invalid SSH port: {}", ssh.port)));
            }
            if ssh.key_path.is_empty() {
                return Err(Error::InvalidConfig(
                    "SSH key path is required when SSH is enabled".into(),
                ));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "invalid log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Full listen address, e.g. `0.0.0.0:5550`
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// libvirt URI to dial. With SSH enabled this becomes
    /// `qemu+ssh://user@host[:port]/system` (or `/session`).
    pub fn effective_libvirt_uri(&self) -> String {
        let ssh = &self.libvirt.ssh;
        if !ssh.enabled {
            return self.libvirt.uri.clone();
        }

        let driver_path = if self.libvirt.uri.contains("/session") {
            "session"
        } else {
            "system"
        };
        crate::ssh::ssh_uri(&ssh.username, &ssh.host, ssh.port, driver_path)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = FlintConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_address(), "0.0.0.0:5550");
        assert_eq!(config.security.rate_limit_requests, 100);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlintConfig::load_file(&dir.path().join("nope.json")).unwrap();
        assert!(config.api_key.is_empty());
        assert_eq!(config.libvirt.uri, "qemu:///system");
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_key": "abc", "security": {"passphrase_hash": "xyz"}}"#,
        )
        .unwrap();

        let config = FlintConfig::load_file(&path).unwrap();
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.security.passphrase_hash, "xyz");
        assert_eq!(config.security.rate_limit_requests, 100);
        assert_eq!(config.server.port, 5550);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FlintConfig::load_file(&path),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_save_round_trip_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = FlintConfig::default();
        config.api_key = "k".repeat(64);
        config.save(&path).unwrap();

        let loaded = FlintConfig::load_file(&path).unwrap();
        assert_eq!(loaded.api_key, config.api_key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FlintConfig::default();
        config.apply_env(env(&[
            ("FLINT_SERVER_PORT", "8080"),
            ("FLINT_SERVER_READ_TIMEOUT", "not-a-number"),
            ("FLINT_LOG_LEVEL", "debug"),
            ("FLINT_LOG_FORMAT", "TEXT"),
            ("FLINT_LIBVIRT_SSH_ENABLED", "1"),
            ("FLINT_UI_DIR", "/srv/flint/ui"),
        ]));

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.read_timeout, 30);
        assert_eq!(config.logging.level, "DEBUG");
        assert_eq!(config.logging.format, "text");
        assert!(config.libvirt.ssh.enabled);
        assert_eq!(config.web.ui_dir, Some(PathBuf::from("/srv/flint/ui")));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = FlintConfig::default();
        config.logging.level = "TRACE".into();
        assert!(config.validate().is_err());

        let mut config = FlintConfig::default();
        config.libvirt.ssh.enabled = true;
        assert!(config.validate().is_err());

        let mut config = FlintConfig::default();
        config.security.rate_limit_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_uri() {
        let mut config = FlintConfig::default();
        assert_eq!(config.effective_libvirt_uri(), "qemu:///system");

        config.libvirt.ssh.enabled = true;
        config.libvirt.ssh.username = "ops".into();
        config.libvirt.ssh.host = "kvm01".into();
        assert_eq!(config.effective_libvirt_uri(), "qemu+ssh://ops@kvm01/system");

        config.libvirt.ssh.port = 2222;
        config.libvirt.uri = "qemu:///session".into();
        assert_eq!(
            config.effective_libvirt_uri(),
            "qemu+ssh://ops@kvm01:2222/session"
        );
    }
}
