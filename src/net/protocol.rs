use serde::{Deserialize, Serialize};

use crate::net::fragment::{FragmentAck, FragmentFrame};
use crate::snapshot::delta::SnapshotPayload;
use crate::util::sequence::Seq;

/// Bumped whenever the wire layout changes; checked at connect
pub const PROTOCOL_VERSION: u16 = 3;

/// Largest UDP payload we will ever try to decode
pub const MAX_DATAGRAM: usize = 65_507;

/// Every datagram on the wire is one of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    /// Out-of-band request from an unconnected peer
    Request(ConnectionlessRequest),
    /// Out-of-band reply from the server
    Response(ConnectionlessResponse),
    /// In-sequence packet from a connected client
    Client(ClientPacket),
    /// In-sequence packet from the server
    Server(ServerPacket),
    /// Piece of an oversized in-sequence packet
    Fragment(FragmentFrame),
    /// Acknowledges a fragment received from the peer
    FragmentAck(FragmentAck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionlessRequest {
    GetChallenge,
    Connect {
        protocol: u16,
        challenge: u32,
        /// Backslash-delimited info string
        userinfo: String,
    },
    /// Full status including player list; `nonce` is echoed back
    GetStatus { nonce: String },
    /// Short server info for browsers
    GetInfo { nonce: String },
    Rcon { password: String, command: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionlessResponse {
    Challenge { challenge: u32 },
    ConnectAccepted { client_num: u16 },
    Print { text: String },
    Status(StatusResponse),
    Info(InfoResponse),
    Disconnect { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub nonce: String,
    /// Server info string
    pub info: String,
    pub players: Vec<PlayerLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLine {
    pub client_num: u16,
    pub ping: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub nonce: String,
    pub protocol: u16,
    pub hostname: String,
    pub clients: u16,
    pub max_clients: u16,
}

/// One frame of player input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCmd {
    /// Server time the client was simulating when it sampled this input
    pub server_time: u64,
    pub angles: [f32; 3],
    pub buttons: u32,
    pub forward: i8,
    pub right: i8,
    pub up: i8,
    pub weapon: u8,
}

/// In-sequence packet sent by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientPacket {
    /// Session id from the last gamestate the client loaded
    pub server_id: u32,
    pub sequence: Seq,
    /// Last server packet sequence received
    pub message_ack: Seq,
    /// Last reliable server command processed
    pub reliable_ack: Seq,
    /// Last snapshot message received intact; delta baseline request
    pub delta_message: Option<Seq>,
    /// Reliable client commands not yet acknowledged by the server
    pub commands: Vec<(Seq, String)>,
    pub usercmds: Vec<UserCmd>,
    /// Fragment of the server's in-flight message received
    pub fragment_ack: Option<FragmentAck>,
}

/// In-sequence packet sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPacket {
    pub sequence: Seq,
    /// Last reliable client command executed
    pub command_ack: Seq,
    /// Every unacknowledged reliable server command
    pub commands: Vec<(Seq, String)>,
    pub body: ServerBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerBody {
    None,
    Gamestate(Gamestate),
    Snapshot(SnapshotPayload),
    Download(DownloadBlock),
}

/// Initial full state for a newly connected client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gamestate {
    /// Changes whenever the server resets its session
    pub server_id: u32,
    pub client_num: u16,
    /// Reliable sequence at the time the gamestate was built
    pub command_sequence: Seq,
    pub config_strings: Vec<(u16, String)>,
}

/// One block of a file download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadBlock {
    pub block: u32,
    /// File size, present on the first block only
    pub total_size: Option<u64>,
    /// Empty data marks the end of the file
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Datagram too large ({0} bytes)")]
    TooLarge(usize),
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a message using bincode, refusing allocations beyond one datagram
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_DATAGRAM {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    let config = bincode::config::legacy().with_limit::<MAX_DATAGRAM>();
    bincode::serde::decode_from_slice(data, config)
        .map(|(msg, _)| msg)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}
