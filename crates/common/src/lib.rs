//! Flint Common Library
//!
//! Configuration, credentials, domain XML helpers and hypervisor access
//! shared by the Flint web server and CLI.

pub mod config;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod ssh;

// Re-export commonly used types
pub use config::FlintConfig;
pub use credentials::CredentialStore;
pub use error::{Error, Result};
pub use hypervisor::{HostResources, HostStatus, Hypervisor, HypervisorClient, VncEndpoint};

/// Flint version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration directory (`~/.flint`)
pub fn default_config_dir() -> std::path::PathBuf {
    home_dir().join(".flint")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_config_dir().join("config.json")
}

/// Home directory helper
pub fn home_dir() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}
