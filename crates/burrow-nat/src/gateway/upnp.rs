//! UPnP Internet Gateway Device port mapping via `igd-next`.
//!
//! The gateway is re-discovered for every operation so no handle with the
//! library's provider generic has to be stored.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use igd_next::{PortMappingProtocol, SearchOptions};
use tokio::time::timeout;
use tracing::debug;

use super::{GatewayClient, GatewayError, MappingProtocol, PortMapping};
use crate::sockets::local_ip_toward;

/// Default SSDP search timeout
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for a single control request
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

impl From<MappingProtocol> for PortMappingProtocol {
    fn from(protocol: MappingProtocol) -> Self {
        match protocol {
            MappingProtocol::Udp => Self::UDP,
            MappingProtocol::Tcp => Self::TCP,
        }
    }
}

fn upnp_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Upnp(e.to_string())
}

/// UPnP IGD client
#[derive(Debug, Clone)]
pub struct UpnpClient {
    description: String,
    search_timeout: Duration,
}

impl UpnpClient {
    /// Client labelling its mappings with `description`
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
        }
    }

    /// Override the SSDP search timeout
    #[must_use]
    pub fn with_search_timeout(mut self, search_timeout: Duration) -> Self {
        self.search_timeout = search_timeout;
        self
    }

    async fn search(
        &self,
    ) -> Result<igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>, GatewayError> {
        let options = SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        match timeout(
            self.search_timeout + Duration::from_secs(1),
            igd_next::aio::tokio::search_gateway(options),
        )
        .await
        {
            Ok(Ok(gateway)) => {
                debug!(gateway = %gateway.addr, "Found UPnP gateway");
                Ok(gateway)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "UPnP gateway search failed");
                Err(GatewayError::NotFound)
            }
            Err(_) => Err(GatewayError::NotFound),
        }
    }
}

impl Default for UpnpClient {
    fn default() -> Self {
        Self::new("burrow")
    }
}

#[async_trait]
impl GatewayClient for UpnpClient {
    fn name(&self) -> &'static str {
        "upnp"
    }

    async fn external_address(&self) -> Result<IpAddr, GatewayError> {
        let gateway = self.search().await?;
        timeout(CONTROL_TIMEOUT, gateway.get_external_ip())
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(upnp_error)
    }

    async fn add_mapping(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime: Duration,
    ) -> Result<PortMapping, GatewayError> {
        let gateway = self.search().await?;
        let local = SocketAddr::new(local_ip_toward(gateway.addr.ip()), internal_port);
        let lease = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);

        let external_port = if external_port == 0 {
            timeout(
                CONTROL_TIMEOUT,
                gateway.add_any_port(protocol.into(), local, lease, &self.description),
            )
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(upnp_error)?
        } else {
            timeout(
                CONTROL_TIMEOUT,
                gateway.add_port(
                    protocol.into(),
                    external_port,
                    local,
                    lease,
                    &self.description,
                ),
            )
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(upnp_error)?;
            external_port
        };

        let external_ip = match timeout(CONTROL_TIMEOUT, gateway.get_external_ip()).await {
            Ok(Ok(ip)) => Some(ip),
            _ => None,
        };

        debug!(
            protocol = %protocol,
            local = %local,
            external_port,
            "UPnP port mapping created"
        );

        Ok(PortMapping {
            protocol,
            internal_port,
            external_port,
            external_ip,
            lifetime,
        })
    }

    async fn remove_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError> {
        let gateway = self.search().await?;
        timeout(
            CONTROL_TIMEOUT,
            gateway.remove_port(mapping.protocol.into(), mapping.external_port),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(upnp_error)
    }
}
