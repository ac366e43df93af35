//! In-sequence packets from connected clients

use tracing::{debug, info, trace, warn};

use super::outbound::Written;
use super::{ServerContext, ServerEvent};
use crate::metrics::Metrics;
use crate::net::connection::ClientState;
use crate::net::download::{DownloadAck, DownloadSession};
use crate::net::fragment::FragmentFrame;
use crate::net::protocol::{self, ClientPacket, Gamestate, ServerBody, WireFrame};
use crate::net::rate_limit::LimitCategory;
use crate::net::registry::DropReason;
use crate::net::reliable::{InboundAction, ReliableError};
use crate::net::userinfo::InfoString;
use crate::util::sequence::{seq_greater_than, seq_less_than};

/// More user commands than this in one packet is abuse
const MAX_PACKET_USERCMDS: usize = 32;

fn violation(detail: impl Into<String>) -> DropReason {
    DropReason::ProtocolViolation(detail.into())
}

/// Strip one pair of surrounding double quotes
fn unquote(arg: &str) -> &str {
    arg.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(arg)
}

impl ServerContext {
    pub(super) fn handle_client_packet(&mut self, index: usize, packet: ClientPacket, now_ms: u64) {
        if let Err(reason) = self.process_client_packet(index, packet, now_ms) {
            self.drop_client(index, reason, now_ms);
        }
    }

    /// Reassemble a fragmented client packet; every accepted fragment is
    /// acknowledged straight away
    pub(super) fn handle_fragment(&mut self, index: usize, fragment: FragmentFrame, now_ms: u64) {
        let Some(conn) = self.registry.get_mut(index) else {
            return;
        };
        let Some(addr) = conn.addr else {
            return;
        };

        let assembled = match conn.assembler.accept(&fragment) {
            Ok(Some(assembled)) => assembled,
            Ok(None) => {
                trace!("Out of order fragment {} from client {}", fragment.index, index);
                return;
            }
            Err(e) => {
                self.drop_client(index, violation(e.to_string()), now_ms);
                return;
            }
        };

        self.send_frame(addr, &WireFrame::FragmentAck(assembled.ack));
        let Some(message) = assembled.message else {
            return;
        };

        match protocol::decode::<WireFrame>(&message) {
            Ok(WireFrame::Client(packet)) => self.handle_client_packet(index, packet, now_ms),
            Ok(_) => self.drop_client(index, violation("fragmented non-client frame"), now_ms),
            Err(e) => self.drop_client(index, violation(e.to_string()), now_ms),
        }
    }

    fn process_client_packet(
        &mut self,
        index: usize,
        packet: ClientPacket,
        now_ms: u64,
    ) -> Result<(), DropReason> {
        let server_id = self.server_id;
        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(());
        };

        // Duplicated or reordered: the newer packet already covered it
        if !seq_greater_than(packet.sequence, conn.incoming_sequence) {
            trace!(
                "Out of order packet {} from client {} (at {})",
                packet.sequence,
                index,
                conn.incoming_sequence
            );
            return Ok(());
        }
        conn.incoming_sequence = packet.sequence;
        conn.last_packet_time = now_ms;

        let last_sent = conn.outgoing_sequence.wrapping_sub(1);
        if seq_greater_than(packet.message_ack, last_sent) {
            return Err(violation(format!(
                "acknowledged message {} but only {} sent",
                packet.message_ack, last_sent
            )));
        }
        if seq_greater_than(packet.message_ack, conn.message_acknowledge) {
            conn.message_acknowledge = packet.message_ack;
            conn.frames.mark_acked(packet.message_ack, now_ms);
            if let Some(ping) = conn.frames.average_ping() {
                conn.ping = ping.min(u32::MAX as u64) as u32;
            }
        }

        conn.reliable
            .acknowledge(packet.reliable_ack)
            .map_err(|e| violation(e.to_string()))?;

        if let Some(ack) = packet.fragment_ack {
            conn.fragments.acknowledge(ack);
        }

        if packet.usercmds.len() > MAX_PACKET_USERCMDS {
            return Err(violation(format!(
                "{} user commands in one packet",
                packet.usercmds.len()
            )));
        }

        // Client is still on an older gamestate (or has none yet)
        let current = packet.server_id == server_id;
        if !current || conn.state() == ClientState::Connected {
            let lost = match conn.gamestate_message {
                None => true,
                Some(sent) => !current && seq_greater_than(conn.message_acknowledge, sent),
            };
            if lost {
                self.send_gamestate(index, now_ms)?;
            }
        }

        for (seq, text) in packet.commands {
            let Some(conn) = self.registry.get_mut(index) else {
                return Ok(());
            };
            // An earlier command dropped the client
            if !conn.state().is_live() {
                return Ok(());
            }
            if text.len() > self.config.max_command_length {
                return Err(violation(format!("command of {} bytes", text.len())));
            }
            match conn.inbound.accept(seq) {
                Ok(InboundAction::Duplicate) => continue,
                Ok(InboundAction::Execute) => {}
                Err(ReliableError::Gap { expected, got }) => {
                    debug!(
                        "Client {} skipped commands: expected {}, got {}",
                        index, expected, got
                    );
                    return Err(DropReason::LostReliableCommands);
                }
                Err(e) => return Err(violation(e.to_string())),
            }
            self.execute_client_command(index, &text, now_ms)?;
        }

        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(());
        };

        if let Some(delta) = packet.delta_message {
            if seq_less_than(delta, conn.outgoing_sequence) {
                conn.delta_message = Some(delta);
            }
        } else {
            conn.delta_message = None;
        }

        // User commands from a previous session are meaningless
        if !current || packet.usercmds.is_empty() || conn.state() < ClientState::Primed {
            return Ok(());
        }

        if conn.state() == ClientState::Primed {
            conn.transition(ClientState::Active)
                .map_err(|e| violation(e.to_string()))?;
            conn.next_snapshot_time = now_ms;
            info!("Client {} ({}) entered the world", index, conn.name);
            self.events.push(ServerEvent::ClientEntered { client: index });
        }

        for cmd in packet.usercmds {
            let newer = conn
                .last_usercmd
                .as_ref()
                .map_or(true, |last| cmd.server_time > last.server_time);
            if !newer {
                continue;
            }
            conn.last_usercmd = Some(cmd.clone());
            self.events.push(ServerEvent::UserCmd { client: index, cmd });
        }

        Ok(())
    }

    /// Send the full session state. Moves a Connected client to Primed.
    pub(super) fn send_gamestate(&mut self, index: usize, now_ms: u64) -> Result<(), DropReason> {
        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(());
        };
        let Some(addr) = conn.addr else {
            return Ok(());
        };

        if !conn
            .gamestate_bucket
            .allow(&self.config.rate_limits.client_gamestate, now_ms)
            || !self
                .limiter
                .check(addr.ip(), LimitCategory::Gamestate, now_ms)
                .is_allowed()
        {
            debug!("Gamestate request from client {} rate limited", index);
            Metrics::incr(&self.metrics.packets_rate_limited);
            return Ok(());
        }

        if conn.state() == ClientState::Connected {
            conn.transition(ClientState::Primed)
                .map_err(|e| violation(e.to_string()))?;
        }
        conn.gamestate_message = Some(conn.outgoing_sequence);
        conn.delta_message = None;
        conn.frames.clear();

        let gamestate = Gamestate {
            server_id: self.server_id,
            client_num: index as u16,
            command_sequence: conn.reliable.sequence(),
            config_strings: self
                .config_strings
                .iter()
                .map(|(i, value)| (*i, value.clone()))
                .collect(),
        };
        debug!(
            "Sending gamestate to client {} in message {}",
            index, conn.outgoing_sequence
        );

        // A fragmented gamestate is released one piece per tick by the send path
        if let Some(Written {
            whole: Some(bytes), ..
        }) = self.write_packet(index, ServerBody::Gamestate(gamestate))?
        {
            self.push_datagram(addr, bytes);
        }
        Ok(())
    }

    fn execute_client_command(
        &mut self,
        index: usize,
        text: &str,
        now_ms: u64,
    ) -> Result<(), DropReason> {
        let text = text.trim();
        let (verb, args) = match text.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (text, ""),
        };

        match verb {
            "disconnect" => Err(DropReason::Disconnected),
            "userinfo" => {
                self.update_userinfo(index, unquote(args), now_ms);
                Ok(())
            }
            "download" => {
                self.begin_download(index, unquote(args), now_ms);
                Ok(())
            }
            "nextdl" => {
                let block = args
                    .parse::<u32>()
                    .map_err(|_| violation(format!("bad nextdl block {:?}", args)))?;
                self.acknowledge_download(index, block, now_ms);
                Ok(())
            }
            "stopdl" | "donedl" => {
                if let Some(conn) = self.registry.get_mut(index) {
                    if let Some(download) = conn.download.take() {
                        debug!("Client {} finished with download {}", index, download.name());
                    }
                }
                Ok(())
            }
            _ => {
                self.game_command(index, text, now_ms);
                Ok(())
            }
        }
    }

    fn update_userinfo(&mut self, index: usize, raw: &str, now_ms: u64) {
        let Some(conn) = self.registry.get_mut(index) else {
            return;
        };
        if !conn
            .info_bucket
            .allow(&self.config.rate_limits.client_userinfo, now_ms)
        {
            debug!("Userinfo flood from client {}", index);
            Metrics::incr(&self.metrics.packets_rate_limited);
            return;
        }

        let userinfo = match InfoString::parse(raw) {
            Ok(info) => info,
            Err(e) => {
                debug!("Ignoring userinfo from client {}: {}", index, e);
                return;
            }
        };

        conn.apply_userinfo(userinfo, &self.config);
        self.events.push(ServerEvent::UserinfoChanged {
            client: index,
            userinfo: conn.userinfo.to_string(),
        });
    }

    /// Hand a command to the game, unless the client is flooding
    fn game_command(&mut self, index: usize, text: &str, now_ms: u64) {
        let Some(conn) = self.registry.get_mut(index) else {
            return;
        };
        let state = conn.state();
        if state < ClientState::Primed {
            debug!("Client {} sent {:?} before its gamestate", index, text);
            return;
        }

        if self.config.flood_protect && state == ClientState::Active {
            let flooding = !conn
                .cmd_bucket
                .allow(&self.config.rate_limits.client_command, now_ms)
                || conn.addr.is_some_and(|addr| {
                    !self
                        .limiter
                        .check(addr.ip(), LimitCategory::Command, now_ms)
                        .is_allowed()
                });
            if flooding {
                // Sequence is already consumed so ordering holds
                debug!("Client {} command flood, skipping {:?}", index, text);
                Metrics::incr(&self.metrics.packets_rate_limited);
                return;
            }
        }

        self.events.push(ServerEvent::ClientCommand {
            client: index,
            command: text.to_string(),
        });
    }

    fn begin_download(&mut self, index: usize, name: &str, now_ms: u64) {
        let opened = match self.download_source.as_ref() {
            Some(source) if self.config.allow_download => source.open(name),
            _ => Err(crate::net::download::DownloadError::Disabled),
        };

        let Some(conn) = self.registry.get_mut(index) else {
            return;
        };
        match opened {
            Ok((file, size)) => {
                info!(
                    "Client {} ({}) downloading {} ({} bytes)",
                    index, conn.name, name, size
                );
                conn.download = Some(DownloadSession::new(
                    name.to_string(),
                    file,
                    size,
                    self.config.download_block_size,
                    self.config.download_window,
                ));
                conn.next_snapshot_time = now_ms;
            }
            Err(e) => {
                debug!("Refusing download {:?} for client {}: {}", name, index, e);
                conn.download = None;
                let message = format!("print \"Download refused: {}\"", e);
                self.send_reliable(index, &message, now_ms);
            }
        }
    }

    fn acknowledge_download(&mut self, index: usize, block: u32, now_ms: u64) {
        let Some(conn) = self.registry.get_mut(index) else {
            return;
        };
        let Some(download) = conn.download.as_mut() else {
            return;
        };
        match download.acknowledge(block, now_ms) {
            DownloadAck::Complete => {
                info!("Client {} completed download {}", index, download.name());
                conn.download = None;
            }
            DownloadAck::Progress => {}
            DownloadAck::Ignored => {
                warn!("Client {} acknowledged unexpected block {}", index, block);
            }
        }
    }
}
