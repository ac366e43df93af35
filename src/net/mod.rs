//! Networking: wire protocol, per-connection channels and the UDP transport

pub mod challenge;
pub mod connection;
pub mod datagram_queue;
pub mod download;
pub mod fragment;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod reliable;
pub mod transport;
pub mod userinfo;

use std::net::SocketAddr;

/// One UDP payload and its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(addr: SocketAddr, data: Vec<u8>) -> Self {
        Self { addr, data }
    }
}
