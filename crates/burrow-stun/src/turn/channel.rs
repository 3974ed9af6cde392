//! Channel number allocation and peer bindings.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use crate::channel_data::{CHANNEL_MAX, CHANNEL_MIN};

/// Channel number allocator and peer map
///
/// Numbers are handed out in increasing order; released numbers are reused
/// (lowest first) before the counter advances further.
#[derive(Debug)]
pub struct ChannelTable {
    by_peer: HashMap<SocketAddr, u16>,
    by_number: HashMap<u16, SocketAddr>,
    next: u32,
    free: BTreeSet<u16>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            by_peer: HashMap::new(),
            by_number: HashMap::new(),
            next: u32::from(CHANNEL_MIN),
            free: BTreeSet::new(),
        }
    }
}

impl ChannelTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel bound to `peer`
    #[must_use]
    pub fn number_for(&self, peer: SocketAddr) -> Option<u16> {
        self.by_peer.get(&peer).copied()
    }

    /// Peer bound to `number`
    #[must_use]
    pub fn peer_for(&self, number: u16) -> Option<SocketAddr> {
        self.by_number.get(&number).copied()
    }

    /// Reserve a number for a pending ChannelBind
    pub fn reserve(&mut self) -> Option<u16> {
        if let Some(number) = self.free.pop_first() {
            return Some(number);
        }
        if self.next > u32::from(CHANNEL_MAX) {
            return None;
        }
        let number = self.next as u16;
        self.next += 1;
        Some(number)
    }

    /// Record a confirmed binding
    pub fn bind(&mut self, number: u16, peer: SocketAddr) {
        self.by_peer.insert(peer, number);
        self.by_number.insert(number, peer);
    }

    /// Return a number to the pool, dropping its binding
    pub fn release(&mut self, number: u16) {
        if let Some(peer) = self.by_number.remove(&number) {
            self.by_peer.remove(&peer);
        }
        self.free.insert(number);
    }

    /// Release every channel bound to a peer at `ip`
    pub fn release_ip(&mut self, ip: IpAddr) -> Vec<u16> {
        let numbers: Vec<u16> = self
            .by_number
            .iter()
            .filter(|(_, peer)| peer.ip() == ip)
            .map(|(number, _)| *number)
            .collect();
        for number in &numbers {
            self.release(*number);
        }
        numbers
    }

    /// Drop every binding and reset the allocator
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of bound channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    /// Whether no channels are bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}
