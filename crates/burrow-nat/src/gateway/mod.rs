//! Gateway port-mapping clients.
//!
//! Two protocol families are supported behind the [`GatewayClient`] trait:
//!
//! - [`natpmp`]: NAT-PMP (RFC 6886) with a PCP (RFC 6887) MAP fallback
//! - [`upnp`]: UPnP Internet Gateway Device via `igd-next`
//!
//! A [`MappingGuard`] owns a mapping until the caller keeps it; dropping an
//! armed guard deletes the mapping in the background.

pub mod natpmp;
pub mod upnp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use natpmp::NatPmpClient;
pub use upnp::UpnpClient;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
    /// UDP
    Udp,
    /// TCP
    Tcp,
}

impl fmt::Display for MappingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// A port mapping installed on a gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Protocol
    pub protocol: MappingProtocol,
    /// Port on this host
    pub internal_port: u16,
    /// Port on the gateway's public address
    pub external_port: u16,
    /// Gateway's public address, when known
    pub external_ip: Option<IpAddr>,
    /// Lifetime granted by the gateway
    pub lifetime: Duration,
}

impl PortMapping {
    /// Public socket address of the mapping, when the gateway reported one
    #[must_use]
    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.external_ip
            .map(|ip| SocketAddr::new(ip, self.external_port))
    }
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No gateway answered
    #[error("No gateway found")]
    NotFound,

    /// Socket failure
    #[error("Gateway I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Gateway did not answer in time
    #[error("Gateway did not respond")]
    Timeout,

    /// Gateway refused the request
    #[error("Gateway refused request: {reason} (result {code})")]
    Rejected {
        /// Protocol result code
        code: u16,
        /// Result description
        reason: &'static str,
    },

    /// Response could not be parsed
    #[error("Malformed gateway response: {0}")]
    Malformed(String),

    /// UPnP control failure
    #[error("UPnP error: {0}")]
    Upnp(String),
}

/// A gateway that can open and close port mappings
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Protocol name for logs
    fn name(&self) -> &'static str;

    /// Gateway's public address
    async fn external_address(&self) -> Result<IpAddr, GatewayError>;

    /// Map `internal_port`, asking for `external_port` (0 lets the gateway pick)
    async fn add_mapping(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime: Duration,
    ) -> Result<PortMapping, GatewayError>;

    /// Delete a mapping
    async fn remove_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError>;
}

/// Owns a mapping and deletes it unless kept
pub struct MappingGuard {
    gateway: Arc<dyn GatewayClient>,
    mapping: Option<PortMapping>,
}

impl MappingGuard {
    /// Take ownership of `mapping`
    pub fn new(gateway: Arc<dyn GatewayClient>, mapping: PortMapping) -> Self {
        Self {
            gateway,
            mapping: Some(mapping),
        }
    }

    /// The guarded mapping
    #[must_use]
    pub fn mapping(&self) -> Option<&PortMapping> {
        self.mapping.as_ref()
    }

    /// Keep the mapping open and hand it to the caller
    #[must_use]
    pub fn keep(mut self) -> Option<PortMapping> {
        self.mapping.take()
    }

    /// Delete the mapping now
    pub async fn release(mut self) {
        if let Some(mapping) = self.mapping.take() {
            remove_logged(self.gateway.as_ref(), &mapping).await;
        }
    }
}

async fn remove_logged(gateway: &dyn GatewayClient, mapping: &PortMapping) {
    match gateway.remove_mapping(mapping).await {
        Ok(()) => debug!(
            gateway = gateway.name(),
            protocol = %mapping.protocol,
            external_port = mapping.external_port,
            "Deleted port mapping"
        ),
        Err(e) => warn!(
            gateway = gateway.name(),
            external_port = mapping.external_port,
            error = %e,
            "Failed to delete port mapping"
        ),
    }
}

impl Drop for MappingGuard {
    fn drop(&mut self) {
        let Some(mapping) = self.mapping.take() else {
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_logged(gateway.as_ref(), &mapping).await;
                });
            }
            Err(_) => warn!(
                gateway = gateway.name(),
                external_port = mapping.external_port,
                "No runtime to delete port mapping; it will expire on its own"
            ),
        }
    }
}

impl fmt::Debug for MappingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingGuard")
            .field("gateway", &self.gateway.name())
            .field("mapping", &self.mapping)
            .finish()
    }
}
