//! Hypervisor access
//!
//! Flint talks to libvirt through `virsh`. When the connection cannot be
//! established at startup the server still runs, backed by a disconnected
//! client that fails every call with `Error::HypervisorUnavailable`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{self, MIN_LIBVIRT_VERSION};
use crate::{Error, Result};

pub use crate::domain::VncEndpoint;

/// Summary of the libvirt host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub hostname: String,
    pub hypervisor_version: String,
    pub total_vms: usize,
    pub running_vms: usize,
}

/// Memory, CPU and storage capacity of the libvirt host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub total_memory_kb: u64,
    pub free_memory_kb: u64,
    pub cpu_cores: u64,
    /// Summed over active storage pools
    pub storage_total_b: u64,
    pub storage_used_b: u64,
}

/// Operations Flint needs from the hypervisor
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Live XML description of a domain, by UUID
    async fn domain_xml(&self, id: &str) -> Result<String>;

    /// Resolve a domain name to its UUID
    async fn lookup_domain_by_name(&self, name: &str) -> Result<String>;

    async fn host_status(&self) -> Result<HostStatus>;

    async fn host_resources(&self) -> Result<HostResources>;

    fn is_connected(&self) -> bool {
        true
    }

    /// PTY device backing the domain's serial console
    async fn serial_console_path(&self, id: &str) -> Result<String> {
        let xml = self.domain_xml(id).await?;
        domain::extract_pty_path(&xml)?
            .ok_or_else(|| Error::ConsoleError("no PTY path found in domain XML".into()))
    }

    /// VNC server of a running domain
    async fn vnc_endpoint(&self, id: &str) -> Result<VncEndpoint> {
        let xml = self.domain_xml(id).await?;
        domain::extract_vnc_endpoint(&xml)?.ok_or_else(|| {
            Error::ConsoleError("no active VNC graphics device in domain XML".into())
        })
    }
}

/// `virsh` command runner bound to one connection URI
#[derive(Debug, Clone)]
pub struct Virsh {
    binary: PathBuf,
    uri: String,
}

impl Virsh {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("virsh"),
            uri: uri.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Verify the connection works and the libvirt library is new enough.
    pub async fn check(&self) -> Result<u64> {
        let output = self.run(&["version"]).await?;
        let version = domain::parse_libvirt_version(&output).ok_or_else(|| {
            Error::Hypervisor("could not determine libvirt library version".into())
        })?;

        if version < MIN_LIBVIRT_VERSION {
            return Err(Error::Hypervisor(format!(
                "libvirt version {} is too old, need at least 6.10.0",
                format_version(version)
            )));
        }
        Ok(version)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(uri = %self.uri, ?args, "Running virsh");

        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Hypervisor(format!("Failed to run virsh: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Hypervisor(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn count_domains(&self, all: bool) -> Result<usize> {
        let args: &[&str] = if all {
            &["list", "--all", "--name"]
        } else {
            &["list", "--name"]
        };
        let output = self.run(args).await?;
        Ok(output.lines().filter(|l| !l.trim().is_empty()).count())
    }

    async fn storage_usage(&self) -> Result<(u64, u64)> {
        let pools = self.run(&["pool-list", "--name"]).await?;
        let mut total = 0;
        let mut used = 0;
        for pool in pools.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let info = self.run(&["pool-info", "--bytes", pool]).await?;
            total += field_u64(&info, "Capacity").unwrap_or(0);
            used += field_u64(&info, "Allocation").unwrap_or(0);
        }
        Ok((total, used))
    }
}

/// First number after `key:` in virsh's `Key:   value unit` listings
fn field_u64(output: &str, key: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        value.split_whitespace().next()?.parse().ok()
    })
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn domain_xml(&self, id: &str) -> Result<String> {
        self.run(&["dumpxml", id]).await
    }

    async fn lookup_domain_by_name(&self, name: &str) -> Result<String> {
        let output = self.run(&["domuuid", name]).await?;
        let uuid = output.trim();
        if uuid.is_empty() {
            return Err(Error::NotFound {
                kind: "domain".into(),
                id: name.into(),
            });
        }
        Ok(uuid.to_string())
    }

    async fn host_status(&self) -> Result<HostStatus> {
        let hostname = self.run(&["hostname"]).await?.trim().to_string();
        let version = self.run(&["version"]).await?;
        let hypervisor_version = version
            .lines()
            .find_map(|l| l.trim().strip_prefix("Running hypervisor:"))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        Ok(HostStatus {
            hostname,
            hypervisor_version,
            total_vms: self.count_domains(true).await?,
            running_vms: self.count_domains(false).await?,
        })
    }

    async fn host_resources(&self) -> Result<HostResources> {
        let nodeinfo = self.run(&["nodeinfo"]).await?;
        let memstats = self.run(&["nodememstats"]).await?;
        let (storage_total_b, storage_used_b) = self.storage_usage().await?;

        Ok(HostResources {
            total_memory_kb: field_u64(&nodeinfo, "Memory size").unwrap_or(0),
            free_memory_kb: field_u64(&memstats, "free").unwrap_or(0),
            cpu_cores: field_u64(&nodeinfo, "CPU(s)").unwrap_or(0),
            storage_total_b,
            storage_used_b,
        })
    }
}

/// Hypervisor handle used by the server
#[derive(Debug, Clone)]
pub enum HypervisorClient {
    Connected(Virsh),
    Disconnected { reason: String },
}

impl HypervisorClient {
    /// Connect to libvirt at `uri`, falling back to a disconnected client.
    pub async fn connect(uri: &str) -> Self {
        let virsh = Virsh::new(uri);
        match virsh.check().await {
            Ok(version) => {
                info!(uri, version = %format_version(version), "Connected to libvirt");
                HypervisorClient::Connected(virsh)
            }
            Err(e) => {
                warn!(uri, error = %e, "libvirt unavailable, running without hypervisor access");
                HypervisorClient::Disconnected {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn connected(&self) -> Result<&Virsh> {
        match self {
            HypervisorClient::Connected(virsh) => Ok(virsh),
            HypervisorClient::Disconnected { .. } => Err(Error::HypervisorUnavailable),
        }
    }
}

#[async_trait]
impl Hypervisor for HypervisorClient {
    async fn domain_xml(&self, id: &str) -> Result<String> {
        self.connected()?.domain_xml(id).await
    }

    async fn lookup_domain_by_name(&self, name: &str) -> Result<String> {
        self.connected()?.lookup_domain_by_name(name).await
    }

    async fn host_status(&self) -> Result<HostStatus> {
        self.connected()?.host_status().await
    }

    async fn host_resources(&self) -> Result<HostResources> {
        self.connected()?.host_resources().await
    }

    fn is_connected(&self) -> bool {
        matches!(self, HypervisorClient::Connected(_))
    }
}

fn format_version(v: u64) -> String {
    format!("{}.{}.{}", v / 1_000_000, (v / 1_000) % 1_000, v % 1_000)
}
