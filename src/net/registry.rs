//! Client slot table
//!
//! Slots live in a fixed arena whose index is the client number. The registry
//! owns admission (per-address caps, reconnect and zombie rules), dropping and
//! timeouts; protocol handling lives in the server module.

use std::fmt;
use std::net::SocketAddr;

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::net::connection::{ClientState, Connection};
use crate::net::userinfo::InfoString;

/// Why a client was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Client sent `disconnect`
    Disconnected,
    TimedOut,
    /// Same address connected again
    Reconnected,
    TooManyReliableCommands,
    LostReliableCommands,
    FragmentQueueOverflow,
    ProtocolViolation(String),
    Kicked(String),
    /// Server shutting down or changing session
    ServerShutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Disconnected => write!(f, "disconnected"),
            DropReason::TimedOut => write!(f, "timed out"),
            DropReason::Reconnected => write!(f, "reconnected"),
            DropReason::TooManyReliableCommands => write!(f, "too many reliable commands"),
            DropReason::LostReliableCommands => write!(f, "lost reliable commands"),
            DropReason::FragmentQueueOverflow => write!(f, "outgoing message queue overflow"),
            DropReason::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
            DropReason::Kicked(reason) => write!(f, "kicked: {}", reason),
            DropReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

/// Outcome of slot allocation for a verified connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Use this free slot. `replaced` names a live session from the same
    /// address that must be dropped first; it goes through the zombie state
    /// like any other drop.
    Slot {
        index: usize,
        replaced: Option<usize>,
    },
    /// Reconnect flood from a live session: ignore silently
    Ignore,
    /// Refuse with a printed reason
    Reject(&'static str),
}

pub struct ConnectionRegistry {
    slots: Vec<Connection>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl ConnectionRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            slots: (0..config.max_clients)
                .map(|num| Connection::new(num, config))
                .collect(),
            by_addr: HashMap::with_capacity(config.max_clients),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Connection> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.iter_mut()
    }

    /// Slot bound to `addr`, live or zombie
    pub fn find(&self, addr: SocketAddr) -> Option<usize> {
        self.by_addr.get(&addr).copied()
    }

    /// Slot bound to `addr` that may exchange in-sequence packets
    pub fn find_live(&self, addr: SocketAddr) -> Option<usize> {
        self.find(addr)
            .filter(|&index| self.slots[index].state().is_live())
    }

    pub fn count(&self, state: ClientState) -> usize {
        self.slots.iter().filter(|c| c.state() == state).count()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|c| c.state().is_live()).count()
    }

    /// Decide where a verified connect request from `addr` goes
    pub fn allocate(&self, addr: SocketAddr, now_ms: u64, config: &ServerConfig) -> Allocation {
        let mut replaced = None;
        if let Some(index) = self.find(addr) {
            let conn = &self.slots[index];
            match conn.state() {
                ClientState::Zombie => {
                    return Allocation::Reject(
                        "Server is still releasing your previous slot, try again shortly.",
                    );
                }
                state if state.is_live() => {
                    if now_ms.saturating_sub(conn.last_connect_time) < config.reconnect_limit_ms {
                        debug!("Ignoring reconnect from {} (too soon)", addr);
                        return Allocation::Ignore;
                    }
                    replaced = Some(index);
                }
                _ => {}
            }
        }

        let same_ip = self
            .slots
            .iter()
            .filter(|c| c.state().is_live() && Some(c.num) != replaced)
            .filter(|c| c.addr.is_some_and(|a| a.ip() == addr.ip()))
            .count();
        if same_ip >= config.max_clients_per_ip {
            return Allocation::Reject("Too many connections from the same IP.");
        }

        match self
            .slots
            .iter()
            .position(|c| c.state() == ClientState::Free)
        {
            Some(index) => Allocation::Slot { index, replaced },
            None => Allocation::Reject("Server is full."),
        }
    }

    /// Bind `addr` to a free slot and move it to Connected
    pub fn bind(
        &mut self,
        index: usize,
        addr: SocketAddr,
        userinfo: InfoString,
        now_ms: u64,
        config: &ServerConfig,
    ) -> bool {
        let Some(conn) = self.slots.get_mut(index) else {
            return false;
        };
        if let Err(e) = conn.connect(addr, userinfo, now_ms, config) {
            debug!("Cannot bind slot {}: {}", index, e);
            return false;
        }
        self.by_addr.insert(addr, index);
        info!("Client {} connected from {} ({})", index, addr, conn.name);
        true
    }

    /// Move a live slot to Zombie, clearing its queues. Returns the address
    /// it was bound to so the caller can send a final disconnect.
    pub fn drop_client(
        &mut self,
        index: usize,
        reason: &DropReason,
        now_ms: u64,
    ) -> Option<SocketAddr> {
        let conn = self.slots.get_mut(index)?;
        if !conn.state().is_live() {
            return None;
        }
        let addr = conn.addr;
        info!(
            "Dropping client {} ({}) from {:?}: {}",
            index, conn.name, addr, reason
        );
        conn.disconnect(now_ms).ok()?;
        addr
    }

    /// Live slots that have gone silent too long
    pub fn timed_out(&self, now_ms: u64, config: &ServerConfig) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|c| {
                let limit = match c.state() {
                    ClientState::Active => config.client_timeout_ms,
                    ClientState::Connected | ClientState::Primed => config.connect_timeout_ms,
                    _ => return false,
                };
                c.idle_time(now_ms) > limit
            })
            .map(|c| c.num)
            .collect()
    }

    /// Free zombies whose grace period has passed
    pub fn release_zombies(&mut self, now_ms: u64, config: &ServerConfig) -> usize {
        let mut released = 0;
        for conn in &mut self.slots {
            if conn.state() != ClientState::Zombie
                || now_ms.saturating_sub(conn.last_disconnect_time) < config.zombie_time_ms
            {
                continue;
            }
            // A replacing session may already own the address
            if let Some(addr) = conn.addr {
                if self.by_addr.get(&addr) == Some(&conn.num) {
                    self.by_addr.remove(&addr);
                }
            }
            if conn.release().is_ok() {
                debug!("Client slot {} released", conn.num);
                released += 1;
            }
        }
        released
    }
}
