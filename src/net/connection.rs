use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::net::download::DownloadSession;
use crate::net::fragment::{FragmentAssembler, FragmentSender};
use crate::net::protocol::UserCmd;
use crate::net::rate_limit::LeakyBucket;
use crate::net::reliable::{InboundCommands, ReliableLog};
use crate::net::userinfo::{client_rate, sanitize_name, snapshot_interval, InfoString};
use crate::snapshot::history::ClientFrames;
use crate::util::sequence::Seq;

/// Lifecycle of a client slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientState {
    /// Can be handed to a new connection
    Free,
    /// Recently dropped; held back so stale packets cannot hit a new session
    Zombie,
    /// Handshake accepted, no gamestate yet
    Connected,
    /// Gamestate queued, waiting for the first user command
    Primed,
    /// In the world
    Active,
}

impl ClientState {
    /// Transitions never skip a state
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Free, Connected)
                | (Connected, Primed)
                | (Primed, Active)
                | (Connected | Primed | Active, Zombie)
                | (Zombie, Free)
        )
    }

    /// Connected, Primed or Active
    pub fn is_live(self) -> bool {
        self >= ClientState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Illegal client state transition {from:?} -> {to:?}")]
    IllegalTransition { from: ClientState, to: ClientState },
}

/// One client slot; its index is the client number
pub struct Connection {
    pub num: usize,
    state: ClientState,
    pub addr: Option<SocketAddr>,
    pub name: String,
    pub userinfo: InfoString,

    pub reliable: ReliableLog,
    pub inbound: InboundCommands,
    /// Last in-sequence packet received from the client
    pub incoming_sequence: Seq,
    /// Sequence the next server packet will carry
    pub outgoing_sequence: Seq,
    /// Last server packet the client reports receiving
    pub message_acknowledge: Seq,
    /// Packet that carried the current gamestate
    pub gamestate_message: Option<Seq>,
    /// Snapshot message the client asked us to delta from
    pub delta_message: Option<Seq>,
    pub frames: ClientFrames,

    pub last_packet_time: u64,
    pub last_connect_time: u64,
    pub last_disconnect_time: u64,
    pub last_snapshot_time: u64,
    pub next_snapshot_time: u64,

    /// Bytes per second
    pub rate: u32,
    pub snapshot_msec: u64,
    /// Last pacing decision was bandwidth bound
    pub rate_delayed: bool,
    pub ping: u32,
    pub last_usercmd: Option<UserCmd>,

    pub cmd_bucket: LeakyBucket,
    pub info_bucket: LeakyBucket,
    pub gamestate_bucket: LeakyBucket,

    pub fragments: FragmentSender,
    pub assembler: FragmentAssembler,
    pub download: Option<DownloadSession>,
}

impl Connection {
    pub fn new(num: usize, config: &ServerConfig) -> Self {
        Self {
            num,
            state: ClientState::Free,
            addr: None,
            name: String::new(),
            userinfo: InfoString::default(),
            reliable: ReliableLog::new(config.reliable_log_capacity, config.max_command_length),
            inbound: InboundCommands::new(),
            incoming_sequence: 0,
            outgoing_sequence: 1,
            message_acknowledge: 0,
            gamestate_message: None,
            delta_message: None,
            frames: ClientFrames::new(config.packet_backup, config.max_frame_entities),
            last_packet_time: 0,
            last_connect_time: 0,
            last_disconnect_time: 0,
            last_snapshot_time: 0,
            next_snapshot_time: 0,
            rate: config.default_rate,
            snapshot_msec: 1000 / config.default_snaps.max(1) as u64,
            rate_delayed: false,
            ping: 0,
            last_usercmd: None,
            cmd_bucket: LeakyBucket::new(),
            info_bucket: LeakyBucket::new(),
            gamestate_bucket: LeakyBucket::new(),
            fragments: FragmentSender::new(config.fragment_size, config.fragment_queue_limit),
            assembler: FragmentAssembler::new(config.fragment_size, config.max_message_size),
            download: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn transition(&mut self, next: ClientState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Clear every per-session queue and counter
    fn reset_session(&mut self) {
        self.reliable.clear();
        self.inbound.clear();
        self.frames.clear();
        self.fragments.clear();
        self.assembler.clear();
        self.download = None;
        self.incoming_sequence = 0;
        self.outgoing_sequence = 1;
        self.message_acknowledge = 0;
        self.gamestate_message = None;
        self.delta_message = None;
        self.next_snapshot_time = 0;
        self.rate_delayed = false;
        self.ping = 0;
        self.last_usercmd = None;
        self.cmd_bucket.reset();
        self.info_bucket.reset();
        self.gamestate_bucket.reset();
    }

    /// Free -> Connected for a newly accepted handshake
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        userinfo: InfoString,
        now_ms: u64,
        config: &ServerConfig,
    ) -> Result<(), LifecycleError> {
        self.transition(ClientState::Connected)?;
        self.reset_session();
        self.addr = Some(addr);
        self.last_packet_time = now_ms;
        self.last_connect_time = now_ms;
        self.apply_userinfo(userinfo, config);
        Ok(())
    }

    /// Live -> Zombie; every queue is invalidated in the same call
    pub fn disconnect(&mut self, now_ms: u64) -> Result<(), LifecycleError> {
        self.transition(ClientState::Zombie)?;
        self.reset_session();
        self.last_disconnect_time = now_ms;
        Ok(())
    }

    /// Zombie -> Free once the grace period has passed
    pub fn release(&mut self) -> Result<(), LifecycleError> {
        self.transition(ClientState::Free)?;
        self.addr = None;
        self.name.clear();
        self.userinfo = InfoString::default();
        Ok(())
    }

    /// Pick up name, rate and snapshot interval from new userinfo
    pub fn apply_userinfo(&mut self, userinfo: InfoString, config: &ServerConfig) {
        self.name = sanitize_name(userinfo.get("name").unwrap_or_default());
        self.rate = client_rate(
            &userinfo,
            config.min_rate,
            config.max_rate,
            config.default_rate,
        );
        self.snapshot_msec = snapshot_interval(&userinfo, config.default_snaps, config.tick_rate);
        self.userinfo = userinfo;
    }

    pub fn idle_time(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_packet_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:27960".parse().unwrap()
    }

    #[test]
    fn test_transitions_never_skip() {
        use ClientState::*;
        let all = [Free, Zombie, Connected, Primed, Active];
        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                match to {
                    Active => assert_eq!(allowed, from == Primed),
                    Primed => assert_eq!(allowed, from == Connected),
                    Connected => assert_eq!(allowed, from == Free),
                    Free => assert_eq!(allowed, from == Zombie),
                    Zombie => assert_eq!(allowed, from.is_live()),
                }
            }
        }
    }

    #[test]
    fn test_lifecycle_round_trip() {
        let config = ServerConfig::default();
        let mut conn = Connection::new(0, &config);

        assert_eq!(
            conn.transition(ClientState::Active),
            Err(LifecycleError::IllegalTransition {
                from: ClientState::Free,
                to: ClientState::Active
            })
        );

        conn.connect(addr(), InfoString::default(), 100, &config)
            .unwrap();
        conn.transition(ClientState::Primed).unwrap();
        conn.transition(ClientState::Active).unwrap();
        conn.disconnect(500).unwrap();
        assert_eq!(conn.state(), ClientState::Zombie);
        assert_eq!(conn.last_disconnect_time, 500);

        conn.release().unwrap();
        assert_eq!(conn.state(), ClientState::Free);
        assert!(conn.addr.is_none());
    }

    #[test]
    fn test_disconnect_clears_queues() {
        let config = ServerConfig::default();
        let mut conn = Connection::new(0, &config);
        conn.connect(addr(), InfoString::default(), 0, &config)
            .unwrap();

        conn.reliable.push("print hi").unwrap();
        conn.fragments.transmit(vec![0; config.fragment_size * 3]).unwrap();
        conn.frames.start(1, 0);
        conn.delta_message = Some(1);

        conn.disconnect(10).unwrap();
        assert_eq!(conn.reliable.unacknowledged(), 0);
        assert!(!conn.fragments.is_busy());
        assert!(conn.frames.get(1).is_none());
        assert!(conn.delta_message.is_none());
    }

    #[test]
    fn test_userinfo_applied() {
        let config = ServerConfig::default();
        let mut conn = Connection::new(3, &config);
        let info = InfoString::parse("\\name\\  Doom \\rate\\8000\\snaps\\10").unwrap();
        conn.connect(addr(), info, 0, &config).unwrap();

        assert_eq!(conn.name, "Doom");
        assert_eq!(conn.rate, 8000);
        assert_eq!(conn.snapshot_msec, 100);
    }

    #[test]
    fn test_idle_time() {
        let config = ServerConfig::default();
        let mut conn = Connection::new(0, &config);
        conn.connect(addr(), InfoString::default(), 1000, &config)
            .unwrap();
        assert_eq!(conn.idle_time(1500), 500);
        assert_eq!(conn.idle_time(500), 0);
    }
}
