//! Admission filtering consulted before a slot is handed out

pub mod bans;

use std::net::SocketAddr;

use crate::net::userinfo::InfoString;

pub use bans::{BanList, BanRecord, Subnet};

/// Verdict on a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Rejected; the reason is printed to the client
    Reject(String),
}

/// External ban/filter collaborator
pub trait AdmissionFilter: Send {
    fn check(&self, addr: SocketAddr, userinfo: &InfoString, now_ms: u64) -> Admission;
}

/// Admits everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl AdmissionFilter for AdmitAll {
    fn check(&self, _addr: SocketAddr, _userinfo: &InfoString, _now_ms: u64) -> Admission {
        Admission::Admit
    }
}
