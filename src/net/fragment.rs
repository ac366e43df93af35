//! Fragmentation of oversized in-sequence messages
//!
//! At most one fragmented message is in flight per connection; later messages
//! wait in a bounded FIFO so ordering holds. Exactly one fragment goes out per
//! tick, and the sender only moves on once the client acknowledges the
//! fragment it was sent. An unacknowledged fragment is simply sent again on
//! the next tick.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Upper bound on fragments in one message
pub const MAX_FRAGMENT_COUNT: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("Fragment queue full ({0} messages waiting)")]
    QueueOverflow(usize),
    #[error("Message of {0} bytes needs too many fragments")]
    TooManyFragments(usize),
    #[error("Reassembled message of {0} bytes exceeds limit of {1}")]
    MessageTooLarge(usize, usize),
    #[error("Fragment {index}/{count} of message {message_id} is inconsistent")]
    Inconsistent {
        message_id: u32,
        index: u16,
        count: u16,
    },
}

/// One piece of a fragmented message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentFrame {
    pub message_id: u32,
    pub index: u16,
    pub count: u16,
    /// Length of the whole message
    pub total_len: u32,
    pub data: Vec<u8>,
}

/// Positive acknowledgment of one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentAck {
    pub message_id: u32,
    pub index: u16,
}

/// Next thing the sender wants on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Fits in one datagram
    Whole(Vec<u8>),
    Fragment(FragmentFrame),
}

#[derive(Debug)]
struct InFlight {
    message_id: u32,
    data: Vec<u8>,
    count: u16,
    /// First fragment the client has not acknowledged
    next_index: u16,
}

impl InFlight {
    fn frame(&self, fragment_size: usize) -> FragmentFrame {
        let start = self.next_index as usize * fragment_size;
        let end = (start + fragment_size).min(self.data.len());
        FragmentFrame {
            message_id: self.message_id,
            index: self.next_index,
            count: self.count,
            total_len: self.data.len() as u32,
            data: self.data[start..end].to_vec(),
        }
    }
}

/// Outbound side for one connection
#[derive(Debug)]
pub struct FragmentSender {
    fragment_size: usize,
    queue_limit: usize,
    queue: VecDeque<Vec<u8>>,
    in_flight: Option<InFlight>,
    next_message_id: u32,
}

impl FragmentSender {
    pub fn new(fragment_size: usize, queue_limit: usize) -> Self {
        Self {
            fragment_size,
            queue_limit,
            queue: VecDeque::new(),
            in_flight: None,
            next_message_id: 0,
        }
    }

    /// A fragmented message is in flight or messages are waiting
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Hand a message to the transport. Small messages with nothing ahead of
    /// them go straight out; everything else is queued behind the in-flight
    /// message and released by [`poll`](Self::poll).
    pub fn transmit(&mut self, message: Vec<u8>) -> Result<Option<Vec<u8>>, FragmentError> {
        if message.len().div_ceil(self.fragment_size) > MAX_FRAGMENT_COUNT {
            return Err(FragmentError::TooManyFragments(message.len()));
        }
        if !self.is_busy() && message.len() <= self.fragment_size {
            return Ok(Some(message));
        }
        if self.queue.len() >= self.queue_limit {
            return Err(FragmentError::QueueOverflow(self.queue.len()));
        }
        self.queue.push_back(message);
        Ok(None)
    }

    /// Datagram to send this tick, if any
    pub fn poll(&mut self) -> Option<Outbound> {
        if self.in_flight.is_none() {
            let message = self.queue.pop_front()?;
            if message.len() <= self.fragment_size {
                return Some(Outbound::Whole(message));
            }
            let count = message.len().div_ceil(self.fragment_size) as u16;
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            self.in_flight = Some(InFlight {
                message_id,
                data: message,
                count,
                next_index: 0,
            });
        }

        self.in_flight
            .as_ref()
            .map(|flight| Outbound::Fragment(flight.frame(self.fragment_size)))
    }

    /// Apply an acknowledgment. Only the fragment currently awaited moves the
    /// sender forward; anything else is ignored. Returns true on progress.
    pub fn acknowledge(&mut self, ack: FragmentAck) -> bool {
        let Some(flight) = self.in_flight.as_mut() else {
            return false;
        };
        if flight.message_id != ack.message_id || flight.next_index != ack.index {
            return false;
        }
        flight.next_index += 1;
        if flight.next_index >= flight.count {
            self.in_flight = None;
        }
        true
    }

    /// Drop everything pending (connection dropped)
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = None;
    }
}

/// Result of feeding one fragment to the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Acknowledgment to return to the sender
    pub ack: FragmentAck,
    /// Complete message, produced exactly once
    pub message: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Partial {
    message_id: u32,
    count: u16,
    total_len: usize,
    next_index: u16,
    buffer: Vec<u8>,
}

/// Inbound side for one connection
#[derive(Debug)]
pub struct FragmentAssembler {
    max_message_size: usize,
    max_fragment_size: usize,
    partial: Option<Partial>,
    completed: Option<u32>,
}

impl FragmentAssembler {
    pub fn new(max_fragment_size: usize, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            max_fragment_size,
            partial: None,
            completed: None,
        }
    }

    /// Feed one fragment. Returns `Ok(None)` for fragments that are out of
    /// order and must be resent; errors are protocol violations.
    pub fn accept(&mut self, frame: &FragmentFrame) -> Result<Option<Assembled>, FragmentError> {
        let inconsistent = || FragmentError::Inconsistent {
            message_id: frame.message_id,
            index: frame.index,
            count: frame.count,
        };

        let total_len = frame.total_len as usize;
        if total_len > self.max_message_size {
            return Err(FragmentError::MessageTooLarge(
                total_len,
                self.max_message_size,
            ));
        }
        if frame.count == 0
            || frame.index >= frame.count
            || frame.data.len() > self.max_fragment_size
        {
            return Err(inconsistent());
        }

        let ack = FragmentAck {
            message_id: frame.message_id,
            index: frame.index,
        };

        // Late copy of a message already delivered: re-ack only
        if self.completed == Some(frame.message_id) {
            return Ok(Some(Assembled { ack, message: None }));
        }

        let starts_new = self
            .partial
            .as_ref()
            .map_or(true, |p| p.message_id != frame.message_id);
        if starts_new {
            if frame.index != 0 {
                return Ok(None);
            }
            self.partial = Some(Partial {
                message_id: frame.message_id,
                count: frame.count,
                total_len,
                next_index: 0,
                buffer: Vec::with_capacity(total_len),
            });
        }

        let Some(partial) = self.partial.as_mut() else {
            return Ok(None);
        };
        if partial.count != frame.count || partial.total_len != total_len {
            return Err(inconsistent());
        }
        if frame.index < partial.next_index {
            return Ok(Some(Assembled { ack, message: None }));
        }
        if frame.index > partial.next_index {
            return Ok(None);
        }
        if partial.buffer.len() + frame.data.len() > partial.total_len {
            return Err(inconsistent());
        }

        partial.buffer.extend_from_slice(&frame.data);
        partial.next_index += 1;

        if partial.next_index < partial.count {
            return Ok(Some(Assembled { ack, message: None }));
        }
        if partial.buffer.len() != partial.total_len {
            return Err(inconsistent());
        }

        let message = std::mem::take(&mut partial.buffer);
        self.completed = Some(frame.message_id);
        self.partial = None;
        Ok(Some(Assembled {
            ack,
            message: Some(message),
        }))
    }

    pub fn clear(&mut self) {
        self.partial = None;
        self.completed = None;
    }
}
