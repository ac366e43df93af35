//! Server context and the per-tick frame
//!
//! `ServerContext` owns every piece of per-run state: the client table, the
//! shared snapshot ring, the address limiter and the challenge secret. One
//! task owns it and calls [`ServerContext::run_frame`] once per tick with the
//! datagrams received since the last tick; nothing inside a frame blocks.

mod client_message;
mod connectionless;
mod outbound;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::filter::{AdmissionFilter, AdmitAll};
use crate::metrics::Metrics;
use crate::net::challenge::ChallengeIssuer;
use crate::net::connection::ClientState;
use crate::net::download::{DirectorySource, DownloadSource};
use crate::net::protocol::{self, ConnectionlessResponse, UserCmd, WireFrame};
use crate::net::rate_limit::RateLimiter;
use crate::net::registry::{ConnectionRegistry, DropReason};
use crate::net::reliable::ReliableError;
use crate::net::Datagram;
use crate::snapshot::history::SnapshotHistory;
use crate::world::{Simulation, VisibilityOracle};

/// How often idle limiter entries are returned to the pool
const LIMITER_SWEEP_MS: u64 = 1_000;

/// Something the game logic needs to know about
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientConnected {
        client: usize,
        addr: SocketAddr,
        name: String,
    },
    /// First user command received; the client is in the world
    ClientEntered { client: usize },
    /// Reliable command not handled by the server itself
    ClientCommand { client: usize, command: String },
    UserCmd { client: usize, cmd: UserCmd },
    UserinfoChanged { client: usize, userinfo: String },
    ClientDisconnected { client: usize, reason: DropReason },
    /// Authenticated remote console command
    RemoteCommand { addr: SocketAddr, command: String },
}

/// Everything produced by one tick
#[derive(Debug, Default)]
pub struct FrameOutput {
    pub outbound: Vec<Datagram>,
    pub events: Vec<ServerEvent>,
}

pub struct ServerContext {
    config: ServerConfig,
    registry: ConnectionRegistry,
    limiter: RateLimiter,
    challenges: ChallengeIssuer,
    filter: Box<dyn AdmissionFilter>,
    history: SnapshotHistory,
    config_strings: BTreeMap<u16, String>,
    /// Identifies the current session in gamestates and client packets
    server_id: u32,
    download_source: Option<Box<dyn DownloadSource>>,
    metrics: Arc<Metrics>,
    next_sweep: u64,

    outbound: Vec<Datagram>,
    events: Vec<ServerEvent>,
}

impl ServerContext {
    /// Build the context for one server run. Fails on fatal misconfiguration.
    pub fn new(config: ServerConfig, metrics: Arc<Metrics>) -> Result<Self, ConfigError> {
        config.validate()?;

        let download_source: Option<Box<dyn DownloadSource>> = match &config.download_dir {
            Some(dir) if config.allow_download => Some(Box::new(DirectorySource::new(dir))),
            _ => None,
        };

        info!(
            "Server context: {} slots, {} Hz, {} snapshot frames",
            config.max_clients, config.tick_rate, config.snapshot_frames
        );

        Ok(Self {
            registry: ConnectionRegistry::new(&config),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            challenges: ChallengeIssuer::new(),
            filter: Box::new(AdmitAll),
            history: SnapshotHistory::new(
                config.snapshot_frames,
                config.snapshot_storage,
                config.max_frame_entities,
            ),
            config_strings: BTreeMap::new(),
            server_id: rand::random(),
            download_source,
            metrics,
            next_sweep: 0,
            outbound: Vec::new(),
            events: Vec::new(),
            config,
        })
    }

    /// Replace the admission filter (ban list, allow list ...)
    pub fn with_filter(mut self, filter: Box<dyn AdmissionFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_challenges(mut self, challenges: ChallengeIssuer) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_download_source(mut self, source: Box<dyn DownloadSource>) -> Self {
        self.download_source = Some(source);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Run one tick: handle inbound datagrams, drop silent clients, record
    /// the world frame and send every client what it is due.
    pub fn run_frame(
        &mut self,
        now_ms: u64,
        inbound: Vec<Datagram>,
        sim: &dyn Simulation,
        visibility: &dyn VisibilityOracle,
    ) -> FrameOutput {
        let started = Instant::now();

        for datagram in inbound {
            self.handle_datagram(datagram, now_ms);
        }

        self.check_timeouts(now_ms);

        if let Err(e) = self.history.record_frame(now_ms, sim.entities()) {
            warn!("Skipping world frame at {}: {}", now_ms, e);
        }

        self.send_client_messages(now_ms, visibility);

        self.registry.release_zombies(now_ms, &self.config);
        if now_ms >= self.next_sweep {
            self.limiter.sweep(now_ms);
            self.next_sweep = now_ms + LIMITER_SWEEP_MS;
        }

        self.metrics.set_clients(
            (self.registry.count(ClientState::Connected) + self.registry.count(ClientState::Primed))
                as u64,
            self.registry.count(ClientState::Active) as u64,
            self.registry.count(ClientState::Zombie) as u64,
        );
        self.metrics.record_tick_time(started.elapsed());

        FrameOutput {
            outbound: std::mem::take(&mut self.outbound),
            events: std::mem::take(&mut self.events),
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram, now_ms: u64) {
        let addr = datagram.addr;
        Metrics::incr(&self.metrics.packets_received);
        Metrics::add(&self.metrics.bytes_received, datagram.data.len() as u64);

        let frame: WireFrame = match protocol::decode(&datagram.data) {
            Ok(frame) => frame,
            Err(e) => {
                // Source cannot be trusted, so nobody is dropped for this
                debug!("Ignoring undecodable datagram from {}: {}", addr, e);
                Metrics::incr(&self.metrics.packets_malformed);
                return;
            }
        };

        match frame {
            WireFrame::Request(request) => self.handle_connectionless(addr, request, now_ms),
            WireFrame::Client(packet) => match self.registry.find_live(addr) {
                Some(index) => self.handle_client_packet(index, packet, now_ms),
                None => debug!("In-sequence packet from unknown address {}", addr),
            },
            WireFrame::Fragment(fragment) => match self.registry.find_live(addr) {
                Some(index) => self.handle_fragment(index, fragment, now_ms),
                None => debug!("Fragment from unknown address {}", addr),
            },
            WireFrame::FragmentAck(ack) => {
                if let Some(conn) = self
                    .registry
                    .find_live(addr)
                    .and_then(|index| self.registry.get_mut(index))
                {
                    conn.fragments.acknowledge(ack);
                }
            }
            WireFrame::Response(_) | WireFrame::Server(_) => {
                debug!("Ignoring server-bound frame type from {}", addr);
            }
        }
    }

    fn check_timeouts(&mut self, now_ms: u64) {
        for index in self.registry.timed_out(now_ms, &self.config) {
            self.drop_client(index, DropReason::TimedOut, now_ms);
        }
    }

    /// Encode and queue one datagram
    pub(crate) fn send_frame(&mut self, addr: SocketAddr, frame: &WireFrame) {
        match protocol::encode(frame) {
            Ok(data) => self.push_datagram(addr, data),
            Err(e) => warn!("Failed to encode frame for {}: {}", addr, e),
        }
    }

    fn push_datagram(&mut self, addr: SocketAddr, data: Vec<u8>) {
        Metrics::incr(&self.metrics.packets_sent);
        Metrics::add(&self.metrics.bytes_sent, data.len() as u64);
        self.outbound.push(Datagram::new(addr, data));
    }

    /// Out-of-band text for an address (rcon replies, rejections)
    pub fn send_print(&mut self, addr: SocketAddr, text: impl Into<String>) {
        self.send_frame(
            addr,
            &WireFrame::Response(ConnectionlessResponse::Print { text: text.into() }),
        );
    }

    /// Move a client to Zombie, tell it why and report the drop
    pub fn drop_client(&mut self, index: usize, reason: DropReason, now_ms: u64) {
        let Some(addr) = self.registry.drop_client(index, &reason, now_ms) else {
            return;
        };
        Metrics::incr(&self.metrics.drops);
        if reason == DropReason::TimedOut {
            Metrics::incr(&self.metrics.timeouts);
        }
        // The replacing session is about to be accepted on the same address
        if reason != DropReason::Reconnected {
            self.send_frame(
                addr,
                &WireFrame::Response(ConnectionlessResponse::Disconnect {
                    reason: reason.to_string(),
                }),
            );
        }
        self.events
            .push(ServerEvent::ClientDisconnected { client: index, reason });
    }

    pub fn kick(&mut self, index: usize, reason: &str, now_ms: u64) {
        self.drop_client(index, DropReason::Kicked(reason.to_string()), now_ms);
    }

    /// Queue a reliable command for one client. A client too far behind to
    /// keep ordering is dropped and `false` returned.
    pub fn send_reliable(&mut self, index: usize, command: &str, now_ms: u64) -> bool {
        let Some(conn) = self.registry.get_mut(index) else {
            return false;
        };
        if !conn.state().is_live() {
            return false;
        }
        match conn.reliable.push(command) {
            Ok(_) => true,
            Err(ReliableError::Overflow(pending)) => {
                warn!("Client {} has {} unacknowledged commands", index, pending);
                self.drop_client(index, DropReason::TooManyReliableCommands, now_ms);
                false
            }
            Err(e) => {
                warn!("Not sending command to client {}: {}", index, e);
                false
            }
        }
    }

    /// Queue a reliable command for every client that has its gamestate
    pub fn broadcast(&mut self, command: &str, now_ms: u64) {
        let targets: Vec<usize> = self
            .registry
            .iter()
            .filter(|c| c.state() >= ClientState::Primed)
            .map(|c| c.num)
            .collect();
        for index in targets {
            self.send_reliable(index, command, now_ms);
        }
    }

    /// Change a config string and tell everyone who already has a gamestate
    pub fn set_config_string(&mut self, index: u16, value: &str, now_ms: u64) {
        if self.config_strings.get(&index).map(String::as_str) == Some(value) {
            return;
        }
        self.config_strings.insert(index, value.to_string());
        self.broadcast(&format!("cs {} \"{}\"", index, value), now_ms);
    }

    pub fn config_string(&self, index: u16) -> Option<&str> {
        self.config_strings.get(&index).map(String::as_str)
    }

    /// Start a new session (map change). Connected clients keep their slots
    /// but must load a fresh gamestate before they are sent snapshots again.
    pub fn reset_session(&mut self) {
        self.server_id = rand::random();
        self.history.clear();
        self.config_strings.clear();
        for conn in self.registry.iter_mut().filter(|c| c.state().is_live()) {
            conn.gamestate_message = None;
            conn.delta_message = None;
            conn.frames.clear();
        }
        info!("Session reset, server id {:#010x}", self.server_id);
    }

    /// Drop every client (process shutdown)
    pub fn shutdown(&mut self, now_ms: u64) -> Vec<Datagram> {
        let live: Vec<usize> = self
            .registry
            .iter()
            .filter(|c| c.state().is_live())
            .map(|c| c.num)
            .collect();
        for index in live {
            self.drop_client(index, DropReason::ServerShutdown, now_ms);
        }
        std::mem::take(&mut self.outbound)
    }
}
