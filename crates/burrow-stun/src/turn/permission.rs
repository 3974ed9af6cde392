//! Permission bookkeeping.
//!
//! Permissions are installed per peer IP (RFC 5766 Section 8); the port of a
//! peer address is not part of the key.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Permission for a peer to send through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPermission {
    /// Peer IP the permission covers
    pub peer: IpAddr,
    /// Permission lifetime
    pub lifetime: Duration,
    /// Channel bound to this peer, if any
    pub channel: Option<u16>,
    /// When the server last confirmed the permission
    pub last_verified: Instant,
}

impl TurnPermission {
    /// New permission verified at `now`
    #[must_use]
    pub fn new(peer: IpAddr, lifetime: Duration, now: Instant) -> Self {
        Self {
            peer,
            lifetime,
            channel: None,
            last_verified: now,
        }
    }

    /// Valid while `now - last_verified <= lifetime`
    #[must_use]
    pub fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_verified) <= self.lifetime
    }
}

/// Installed permissions keyed by peer IP
#[derive(Debug, Default)]
pub struct PermissionTable {
    entries: HashMap<IpAddr, TurnPermission>,
}

impl PermissionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid permission for `peer` at `now`
    #[must_use]
    pub fn get_valid(&self, peer: IpAddr, now: Instant) -> Option<&TurnPermission> {
        self.entries.get(&peer).filter(|p| p.is_valid(now))
    }

    /// Whether traffic from `peer` may be delivered at `now`
    #[must_use]
    pub fn is_permitted(&self, peer: IpAddr, now: Instant) -> bool {
        self.get_valid(peer, now).is_some()
    }

    /// Record a successful CreatePermission or ChannelBind at `now`
    ///
    /// Keeps an existing channel association unless `channel` names a new one.
    pub fn confirm(
        &mut self,
        peer: IpAddr,
        lifetime: Duration,
        channel: Option<u16>,
        now: Instant,
    ) -> TurnPermission {
        let entry = self
            .entries
            .entry(peer)
            .or_insert_with(|| TurnPermission::new(peer, lifetime, now));
        entry.lifetime = lifetime;
        entry.last_verified = now;
        if channel.is_some() {
            entry.channel = channel;
        }
        entry.clone()
    }

    /// Remove and return every permission expired at `now`
    pub fn sweep(&mut self, now: Instant) -> Vec<TurnPermission> {
        let expired: Vec<IpAddr> = self
            .entries
            .iter()
            .filter(|(_, p)| !p.is_valid(now))
            .map(|(ip, _)| *ip)
            .collect();

        expired
            .into_iter()
            .filter_map(|ip| self.entries.remove(&ip))
            .collect()
    }

    /// Remove and return all permissions
    pub fn drain(&mut self) -> Vec<TurnPermission> {
        self.entries.drain().map(|(_, p)| p).collect()
    }

    /// Number of installed permissions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no permissions are installed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFETIME: Duration = Duration::from_secs(300);

    fn peer() -> IpAddr {
        "203.0.113.5".parse().unwrap()
    }

    #[test]
    fn test_validity_boundary() {
        let now = Instant::now();
        let perm = TurnPermission::new(peer(), LIFETIME, now);
        assert!(perm.is_valid(now + LIFETIME - Duration::from_millis(1)));
        assert!(perm.is_valid(now + LIFETIME));
        assert!(!perm.is_valid(now + LIFETIME + Duration::from_millis(1)));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let now = Instant::now();
        let other: IpAddr = "203.0.113.6".parse().unwrap();
        let mut table = PermissionTable::new();
        table.confirm(peer(), LIFETIME, None, now);
        table.confirm(other, LIFETIME, None, now + Duration::from_secs(100));

        let expired = table.sweep(now + LIFETIME + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer, peer());
        assert!(table.is_permitted(other, now + LIFETIME + Duration::from_secs(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_confirm_refreshes_and_keeps_channel() {
        let now = Instant::now();
        let mut table = PermissionTable::new();
        table.confirm(peer(), LIFETIME, Some(0x4000), now);

        let later = now + Duration::from_secs(200);
        let perm = table.confirm(peer(), LIFETIME, None, later);
        assert_eq!(perm.channel, Some(0x4000));
        assert_eq!(perm.last_verified, later);
        assert!(table.is_permitted(peer(), later + LIFETIME));
    }

    #[test]
    fn test_drain() {
        let mut table = PermissionTable::new();
        table.confirm(peer(), LIFETIME, None, Instant::now());
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }
}
