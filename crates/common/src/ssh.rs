//! SSH transport helpers for remote libvirt hosts

use serde::Deserialize;
use std::path::Path;

use crate::{Error, FlintConfig, Result};

/// Default SSH port
pub const SSH_PORT: u16 = 22;

const USER_AND_HOST_REQUIRED: &str = "SSH username and host are required when SSH is enabled";

/// Connection parameters sent by the UI, used both to test a connection
/// and to update the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub uri: String,
    pub ssh_enabled: bool,
    pub ssh_username: String,
    pub ssh_host: String,
    /// 0 means the default port
    pub ssh_port: u16,
    pub ssh_key_path: String,
}

impl ConnectionSettings {
    fn port(&self) -> u16 {
        if self.ssh_port == 0 {
            SSH_PORT
        } else {
            self.ssh_port
        }
    }

    fn has_user_and_host(&self) -> bool {
        !self.ssh_username.is_empty() && !self.ssh_host.is_empty()
    }

    /// URI to try for a connection test. SSH parameters are checked first,
    /// including the key file.
    pub fn test_uri(&self) -> Result<String> {
        if !self.ssh_enabled {
            return Ok(self.uri.clone());
        }
        if !self.has_user_and_host() {
            return Err(Error::Connection(USER_AND_HOST_REQUIRED.into()));
        }
        validate_ssh_connection(
            &self.ssh_username,
            &self.ssh_host,
            self.port(),
            &self.ssh_key_path,
        )
        .map_err(|e| Error::Connection(format!("SSH validation failed: {}", e)))?;
        Ok(ssh_uri(&self.ssh_username, &self.ssh_host, self.port(), "system"))
    }

    /// Merge into `config`: an empty URI keeps the current one, an empty key
    /// path keeps the current key. The result is validated.
    pub fn apply_to(&self, config: &mut FlintConfig) -> Result<()> {
        if !self.uri.is_empty() {
            config.libvirt.uri = self.uri.clone();
        }

        let ssh = &mut config.libvirt.ssh;
        ssh.enabled = self.ssh_enabled;
        if self.ssh_enabled {
            if !self.has_user_and_host() {
                return Err(Error::InvalidConfig(USER_AND_HOST_REQUIRED.into()));
            }
            ssh.username = self.ssh_username.clone();
            ssh.host = self.ssh_host.clone();
            ssh.port = self.port();
            if !self.ssh_key_path.is_empty() {
                ssh.key_path = self.ssh_key_path.clone();
            }
        }

        config.validate()
    }
}

/// `qemu+ssh://user@host[:port]/<driver_path>`
pub fn ssh_uri(username: &str, host: &str, port: u16, driver_path: &str) -> String {
    let mut uri = format!("qemu+ssh://{}@{}", username, host);
    if port != SSH_PORT {
        uri.push_str(&format!(":{}", port));
    }
    uri.push('/');
    uri.push_str(driver_path);
    uri
}

/// Check SSH parameters before dialing: all fields present and a private
/// key only its owner can read.
pub fn validate_ssh_connection(
    username: &str,
    host: &str,
    port: u16,
    key_path: &str,
) -> Result<()> {
    if username.is_empty() {
        return Err(Error::InvalidConfig("SSH username cannot be empty".into()));
    }
    if host.is_empty() {
        return Err(Error::InvalidConfig("SSH host cannot be empty".into()));
    }
    if port == 0 {
        return Err(Error::InvalidConfig(format!("invalid SSH port: {}", port)));
    }
    if key_path.is_empty() {
        return Err(Error::InvalidConfig("SSH key path cannot be empty".into()));
    }
    check_key_file(Path::new(key_path))
}

fn check_key_file(path: &Path) -> Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::InvalidConfig(format!(
                "SSH key file not found: {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(Error::InvalidConfig(format!(
                "SSH key file has insecure permissions ({:o}). Expected 600 or 400",
                mode
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    Ok(())
}

/// Contents of `~/.ssh/id_rsa.pub` under `home`, or None if there is none.
pub fn detect_public_key(home: &Path) -> Result<Option<String>> {
    let path = home.join(".ssh").join("id_rsa.pub");
    match std::fs::read_to_string(&path) {
        Ok(key) => Ok(Some(key)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
