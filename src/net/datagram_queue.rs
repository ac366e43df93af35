//! Bounded hand-off from the socket reader to the tick loop
//!
//! The receive task pushes datagrams without blocking; the tick drains
//! everything pending at the start of each frame. Datagrams that cannot be
//! queued are counted in `Metrics` and otherwise treated as packet loss.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::net::protocol::MAX_DATAGRAM;
use crate::net::Datagram;

/// Datagrams buffered between two ticks
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Why the receive task must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Tick loop stopped")]
pub struct Disconnected;

/// Receive-task end of the queue
pub struct DatagramSender {
    sender: Sender<Datagram>,
    metrics: Arc<Metrics>,
    /// Set while the queue is overflowing, so a burst logs once
    overflowing: bool,
}

/// Tick-loop end of the queue
pub struct DatagramReceiver {
    receiver: Receiver<Datagram>,
}

pub fn datagram_queue(capacity: usize, metrics: Arc<Metrics>) -> (DatagramSender, DatagramReceiver) {
    let (sender, receiver) = bounded(capacity.max(1));
    (
        DatagramSender {
            sender,
            metrics,
            overflowing: false,
        },
        DatagramReceiver { receiver },
    )
}

impl DatagramSender {
    /// Queue one received payload. Oversized payloads and overflow are
    /// dropped and counted; only a stopped tick loop is an error.
    pub fn push(&mut self, datagram: Datagram) -> Result<(), Disconnected> {
        if datagram.data.len() > MAX_DATAGRAM {
            debug!(
                "Dropping {} byte datagram from {}",
                datagram.data.len(),
                datagram.addr
            );
            Metrics::incr(&self.metrics.packets_malformed);
            return Ok(());
        }

        match self.sender.try_send(datagram) {
            Ok(()) => {
                self.overflowing = false;
                Ok(())
            }
            Err(TrySendError::Full(dropped)) => {
                if !self.overflowing {
                    warn!(
                        "Datagram queue full, dropping input (first from {})",
                        dropped.addr
                    );
                    self.overflowing = true;
                }
                Metrics::incr(&self.metrics.queue_dropped);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Disconnected),
        }
    }
}

impl DatagramReceiver {
    /// Everything received since the last tick
    pub fn drain(&self) -> Vec<Datagram> {
        self.receiver.try_iter().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}
