//! Error types for Flint

use thiserror::Error;

/// Result type alias using Flint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Flint error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No web UI passphrase configured")]
    MissingPassphrase,

    #[error("Passphrase must be at least {min} characters")]
    WeakPassphrase { min: usize },

    #[error("Password hashing error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("Secure random source unavailable: {0}")]
    Randomness(String),

    #[error("libvirt connection not available")]
    HypervisorUnavailable,

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Failed to parse domain XML: {0}")]
    DomainXml(#[from] quick_xml::Error),

    #[error("{0}")]
    Connection(String),

    #[error("Invalid VM identifier")]
    InvalidVmId(String),

    #[error("{0}")]
    ConsoleError(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Error::DomainXml(e.into())
    }
}

impl Error {
    /// True for errors caused by missing or disconnected infrastructure
    /// rather than by the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::HypervisorUnavailable)
    }
}
