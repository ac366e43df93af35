//! Per-client send path: fragments, downloads, snapshots and pacing

use tracing::{debug, trace, warn};

use super::ServerContext;
use crate::metrics::Metrics;
use crate::net::connection::ClientState;
use crate::net::fragment::{FragmentError, Outbound};
use crate::net::protocol::{self, ServerBody, ServerPacket, WireFrame};
use crate::net::registry::DropReason;
use crate::net::reliable::pending_batch;
use crate::snapshot::delta::encode_snapshot;
use crate::snapshot::entity::EntityState;
use crate::util::sequence::Seq;
use crate::world::VisibilityOracle;

/// Assumed UDP/IP header bytes per datagram, counted against the client rate
const HEADER_OVERHEAD: u64 = 48;

/// Clients that are not in the world yet hear from us once a second
const NON_ACTIVE_SNAPSHOT_MSEC: u64 = 1_000;

/// Server packet accepted by the fragment sender
pub(super) struct Written {
    /// Set when the packet fits one datagram and nothing is queued ahead of it
    pub whole: Option<Vec<u8>>,
    pub size: usize,
    pub sequence: Seq,
}

impl ServerContext {
    pub(super) fn send_client_messages(&mut self, now_ms: u64, visibility: &dyn VisibilityOracle) {
        for index in 0..self.registry.capacity() {
            if let Err(reason) = self.send_to_client(index, now_ms, visibility) {
                self.drop_client(index, reason, now_ms);
            }
        }
    }

    fn send_to_client(
        &mut self,
        index: usize,
        now_ms: u64,
        visibility: &dyn VisibilityOracle,
    ) -> Result<(), DropReason> {
        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(());
        };
        let state = conn.state();
        if !state.is_live() {
            return Ok(());
        }
        let Some(addr) = conn.addr else {
            return Ok(());
        };

        // A fragmented message in flight owns the link, one piece per tick
        if conn.fragments.is_busy() {
            if let Some(out) = conn.fragments.poll() {
                self.emit(addr, out);
            }
            return Ok(());
        }

        if now_ms < conn.next_snapshot_time {
            return Ok(());
        }

        let mut body = None;
        if let Some(download) = conn.download.as_mut() {
            match download.next_block(now_ms, self.config.download_timeout_ms) {
                Ok(Some(block)) => body = Some(ServerBody::Download(block)),
                Ok(None) => {}
                Err(e) => {
                    warn!("Download {} for client {} failed: {}", download.name(), index, e);
                    conn.download = None;
                }
            }
        }

        let mut snapshot_stats = None;
        let body = match body {
            Some(body) => body,
            // Nothing to say until the client has a gamestate for this session
            None if conn.gamestate_message.is_none() => return Ok(()),
            None => {
                let delta_message = if state == ClientState::Active {
                    conn.delta_message
                } else {
                    None
                };
                let is_visible = |entity: &EntityState| visibility.is_visible(index, entity);
                let Some((payload, stats)) = encode_snapshot(
                    &self.history,
                    &mut conn.frames,
                    conn.outgoing_sequence,
                    delta_message,
                    is_visible,
                    self.config.max_snapshot_entities,
                    now_ms,
                ) else {
                    return Ok(());
                };
                snapshot_stats = Some(stats);
                ServerBody::Snapshot(payload)
            }
        };

        let Some(written) = self.write_packet(index, body)? else {
            return Ok(());
        };

        if let Some(stats) = snapshot_stats {
            if stats.full_update {
                Metrics::incr(&self.metrics.snapshots_full);
            } else {
                Metrics::incr(&self.metrics.snapshots_delta);
            }
            Metrics::add(
                &self.metrics.snapshot_entities,
                (stats.added + stats.changed + stats.removed) as u64,
            );
        }

        match written.whole {
            Some(bytes) => self.push_datagram(addr, bytes),
            None => {
                // Too large for one datagram: the first fragment goes now
                if let Some(out) = self
                    .registry
                    .get_mut(index)
                    .and_then(|conn| conn.fragments.poll())
                {
                    self.emit(addr, out);
                }
            }
        }

        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(());
        };
        if snapshot_stats.is_some() {
            conn.frames.record_size(written.sequence, written.size);
        }
        conn.last_snapshot_time = now_ms;

        // Bandwidth bound: the packet must drain at the client's rate first
        let rate_msec = (written.size as u64 + HEADER_OVERHEAD) * 1000 / conn.rate.max(1) as u64;
        let interval = if state == ClientState::Active || conn.download.is_some() {
            conn.snapshot_msec
        } else {
            NON_ACTIVE_SNAPSHOT_MSEC
        };
        conn.rate_delayed = rate_msec > interval;
        if conn.rate_delayed {
            trace!("Client {} rate delayed by {} ms", index, rate_msec - interval);
            Metrics::incr(&self.metrics.rate_delayed);
        }
        conn.next_snapshot_time = now_ms + interval.max(rate_msec);

        Ok(())
    }

    /// Wrap `body` in a server packet carrying every pending reliable command
    /// and hand it to the fragment sender. Consumes one outgoing sequence.
    pub(super) fn write_packet(
        &mut self,
        index: usize,
        body: ServerBody,
    ) -> Result<Option<Written>, DropReason> {
        let Some(conn) = self.registry.get_mut(index) else {
            return Ok(None);
        };

        let sequence = conn.outgoing_sequence;
        let packet = ServerPacket {
            sequence,
            command_ack: conn.inbound.last_executed(),
            commands: pending_batch(&conn.reliable).into_vec(),
            body,
        };
        let bytes = match protocol::encode(&WireFrame::Server(packet)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode packet for client {}: {}", index, e);
                return Ok(None);
            }
        };
        conn.outgoing_sequence = sequence.wrapping_add(1);

        let size = bytes.len();
        match conn.fragments.transmit(bytes) {
            Ok(whole) => Ok(Some(Written {
                whole,
                size,
                sequence,
            })),
            Err(FragmentError::QueueOverflow(queued)) => {
                debug!("Client {} has {} messages queued", index, queued);
                Err(DropReason::FragmentQueueOverflow)
            }
            Err(e) => {
                warn!("Dropping packet {} for client {}: {}", sequence, index, e);
                Ok(None)
            }
        }
    }

    /// Put one fragment sender output on the wire
    fn emit(&mut self, addr: std::net::SocketAddr, out: Outbound) {
        match out {
            Outbound::Whole(bytes) => self.push_datagram(addr, bytes),
            Outbound::Fragment(fragment) => {
                Metrics::incr(&self.metrics.fragments_sent);
                self.send_frame(addr, &WireFrame::Fragment(fragment));
            }
        }
    }
}
