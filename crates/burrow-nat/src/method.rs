//! Traversal technique enumeration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A NAT traversal technique
///
/// Variants are declared in default priority order: cheapest and most
/// direct first, relay last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMethod {
    /// Native IPv6 connection
    DirectIpv6,
    /// Direct TCP connect
    DirectTcp,
    /// Direct UDP probe
    DirectUdp,
    /// UPnP IGD port mapping
    Upnp,
    /// NAT-PMP / PCP port mapping
    NatPmp,
    /// STUN reflexive address exchange over signaling
    StunAssisted,
    /// UDP hole punching
    UdpHolePunch,
    /// TCP hole punching
    TcpHolePunch,
    /// TCP simultaneous open
    TcpSimultaneousOpen,
    /// ICE connectivity checks
    Ice,
    /// TURN relay
    Turn,
}

impl ConnectionMethod {
    /// Every method in default priority order
    pub const DEFAULT_ORDER: [Self; 11] = [
        Self::DirectIpv6,
        Self::DirectTcp,
        Self::DirectUdp,
        Self::Upnp,
        Self::NatPmp,
        Self::StunAssisted,
        Self::UdpHolePunch,
        Self::TcpHolePunch,
        Self::TcpSimultaneousOpen,
        Self::Ice,
        Self::Turn,
    ];

    /// Stable kebab-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirectIpv6 => "direct-ipv6",
            Self::DirectTcp => "direct-tcp",
            Self::DirectUdp => "direct-udp",
            Self::Upnp => "upnp",
            Self::NatPmp => "nat-pmp",
            Self::StunAssisted => "stun-assisted",
            Self::UdpHolePunch => "udp-hole-punch",
            Self::TcpHolePunch => "tcp-hole-punch",
            Self::TcpSimultaneousOpen => "tcp-simultaneous-open",
            Self::Ice => "ice",
            Self::Turn => "turn",
        }
    }

    /// Whether the method needs a target address up front
    #[must_use]
    pub const fn requires_target(self) -> bool {
        matches!(self, Self::DirectIpv6 | Self::DirectTcp | Self::DirectUdp)
    }

    /// Whether the method exchanges candidates over signaling
    #[must_use]
    pub const fn uses_signaling(self) -> bool {
        matches!(
            self,
            Self::StunAssisted
                | Self::UdpHolePunch
                | Self::TcpHolePunch
                | Self::TcpSimultaneousOpen
                | Self::Ice
        )
    }
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DEFAULT_ORDER
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown connection method: {s}"))
    }
}

/// Order `methods`, promoting `preferred` to the front
///
/// The relative order of the remaining methods is preserved. A preferred
/// method that is not in `methods` is ignored.
#[must_use]
pub fn promote(methods: &[ConnectionMethod], preferred: Option<ConnectionMethod>) -> Vec<ConnectionMethod> {
    let mut ordered = methods.to_vec();
    if let Some(preferred) = preferred {
        if let Some(index) = ordered.iter().position(|m| *m == preferred) {
            let method = ordered.remove(index);
            ordered.insert(0, method);
        }
    }
    ordered
}
