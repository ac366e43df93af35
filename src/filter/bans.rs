use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tracing::info;

use crate::filter::{Admission, AdmissionFilter};
use crate::net::userinfo::InfoString;

/// Address range in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    address: IpAddr,
    /// Never longer than the address itself
    prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    #[error("Invalid address in {0:?}")]
    Address(String),
    #[error("Invalid prefix length in {0:?}")]
    Prefix(String),
}

impl Subnet {
    pub fn host(address: IpAddr) -> Self {
        let prefix = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { address, prefix }
    }

    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, SubnetError> {
        if prefix > Self::host(address).prefix {
            return Err(SubnetError::Prefix(format!("{}/{}", address, prefix)));
        }
        Ok(Self { address, prefix })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let address: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| SubnetError::Address(s.to_string()))?;
        match prefix {
            Some(p) => {
                let prefix = p
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| SubnetError::Prefix(s.to_string()))?;
                Self::new(address, prefix).map_err(|_| SubnetError::Prefix(s.to_string()))
            }
            None => Ok(Self::host(address)),
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// A ban or exception entry
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub subnet: Subnet,
    /// Exceptions override bans covering the same address
    pub is_exception: bool,
    pub reason: String,
    pub created_at: u64,
    /// `None` never expires
    pub expires_at: Option<u64>,
}

impl BanRecord {
    pub fn new(subnet: Subnet, reason: impl Into<String>, now_ms: u64, duration_ms: Option<u64>) -> Self {
        Self {
            subnet,
            is_exception: false,
            reason: reason.into(),
            created_at: now_ms,
            expires_at: duration_ms.map(|d| now_ms + d),
        }
    }

    pub fn exception(subnet: Subnet, now_ms: u64) -> Self {
        Self {
            subnet,
            is_exception: true,
            reason: String::new(),
            created_at: now_ms,
            expires_at: None,
        }
    }

    /// Check if ban has expired
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    /// Remaining duration, `None` when permanent
    pub fn remaining(&self, now_ms: u64) -> Option<u64> {
        self.expires_at.map(|expires| expires.saturating_sub(now_ms))
    }
}

/// In-memory ban list; loading and saving it is left to the embedder
#[derive(Debug, Default, Clone)]
pub struct BanList {
    records: Vec<BanRecord>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: BanRecord) {
        info!(
            "{} {} ({})",
            if record.is_exception { "Exception" } else { "Ban" },
            record.subnet,
            record.reason
        );
        self.records
            .retain(|r| !(r.subnet == record.subnet && r.is_exception == record.is_exception));
        self.records.push(record);
    }

    pub fn remove(&mut self, subnet: &Subnet) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.subnet != *subnet);
        before - self.records.len()
    }

    /// Active ban covering `ip`, unless an exception also covers it
    pub fn is_banned(&self, ip: IpAddr, now_ms: u64) -> Option<&BanRecord> {
        let active = |r: &&BanRecord| !r.is_expired(now_ms) && r.subnet.contains(ip);
        if self.records.iter().filter(|r| r.is_exception).any(|r| active(&r)) {
            return None;
        }
        self.records
            .iter()
            .filter(|r| !r.is_exception)
            .find(active)
    }

    /// Clean up expired bans
    pub fn cleanup_expired(&mut self, now_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.is_expired(now_ms));
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AdmissionFilter for BanList {
    fn check(&self, addr: SocketAddr, _userinfo: &InfoString, now_ms: u64) -> Admission {
        match self.is_banned(addr.ip(), now_ms) {
            Some(record) if record.reason.is_empty() => {
                Admission::Reject("You are banned from this server.".to_string())
            }
            Some(record) => Admission::Reject(format!(
                "You are banned from this server: {}",
                record.reason
            )),
            None => Admission::Admit,
        }
    }
}
