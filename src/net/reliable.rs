//! Reliable, ordered command channel
//!
//! Outbound: every unacknowledged command rides on every outgoing packet until
//! the client reports it processed. The log is a fixed ring, so a client that
//! falls further behind than its capacity cannot be served in order and must
//! be dropped.
//!
//! Inbound: client commands carry their own sequence and are executed strictly
//! in order; duplicates are skipped and a gap means commands were lost.

use smallvec::SmallVec;

use crate::util::sequence::{seq_diff, seq_greater_than, Seq};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReliableError {
    #[error("Too many reliable commands ({0} unacknowledged)")]
    Overflow(usize),
    #[error("Acknowledged command {ack} was never sent (latest {sent})")]
    InvalidAck { ack: Seq, sent: Seq },
    #[error("Reliable command too long ({0} bytes)")]
    CommandTooLong(usize),
    #[error("Lost reliable commands (expected {expected}, got {got})")]
    Gap { expected: Seq, got: Seq },
}

/// Outbound command log for one connection
#[derive(Debug, Clone)]
pub struct ReliableLog {
    commands: Vec<String>,
    mask: usize,
    /// Sequence of the most recently queued command
    sequence: Seq,
    /// Highest sequence the client has acknowledged
    acknowledged: Seq,
    max_length: usize,
}

impl ReliableLog {
    pub fn new(capacity: usize, max_length: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            commands: vec![String::new(); capacity],
            mask: capacity - 1,
            sequence: 0,
            acknowledged: 0,
            max_length,
        }
    }

    pub fn capacity(&self) -> usize {
        self.commands.len()
    }

    pub fn sequence(&self) -> Seq {
        self.sequence
    }

    pub fn acknowledged(&self) -> Seq {
        self.acknowledged
    }

    /// Commands queued but not yet acknowledged
    pub fn unacknowledged(&self) -> usize {
        seq_diff(self.sequence, self.acknowledged).max(0) as usize
    }

    /// Queue a command. Fails when the client is too far behind to keep
    /// ordering guarantees; the caller drops the connection.
    pub fn push(&mut self, command: impl Into<String>) -> Result<Seq, ReliableError> {
        let command = command.into();
        if command.len() > self.max_length {
            return Err(ReliableError::CommandTooLong(command.len()));
        }

        let pending = self.unacknowledged();
        if pending >= self.capacity() {
            return Err(ReliableError::Overflow(pending + 1));
        }

        self.sequence = self.sequence.wrapping_add(1);
        let slot = self.sequence as usize & self.mask;
        self.commands[slot] = command;
        Ok(self.sequence)
    }

    /// Apply the client's acknowledgment. Stale or duplicate acks are ignored;
    /// an ack for a command never sent is a protocol violation.
    pub fn acknowledge(&mut self, ack: Seq) -> Result<(), ReliableError> {
        if seq_greater_than(ack, self.sequence) {
            return Err(ReliableError::InvalidAck {
                ack,
                sent: self.sequence,
            });
        }
        if seq_greater_than(ack, self.acknowledged) {
            self.acknowledged = ack;
        }
        Ok(())
    }

    /// Every unacknowledged command, oldest first
    pub fn pending(&self) -> impl Iterator<Item = (Seq, &str)> + '_ {
        let count = self.unacknowledged() as u32;
        (1..=count).map(move |offset| {
            let seq = self.acknowledged.wrapping_add(offset);
            (seq, self.commands[seq as usize & self.mask].as_str())
        })
    }

    /// Forget everything (slot reset)
    pub fn clear(&mut self) {
        for command in &mut self.commands {
            command.clear();
        }
        self.sequence = 0;
        self.acknowledged = 0;
    }
}

/// What to do with one received client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    /// Already executed; resent because our ack was lost
    Duplicate,
    /// Next in order
    Execute,
}

/// Inbound command ordering for one connection
#[derive(Debug, Clone, Default)]
pub struct InboundCommands {
    last_executed: Seq,
}

impl InboundCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_executed(&self) -> Seq {
        self.last_executed
    }

    /// Classify `seq`. On `Execute` the sequence is consumed, even if the
    /// caller then skips the command for flood protection.
    pub fn accept(&mut self, seq: Seq) -> Result<InboundAction, ReliableError> {
        let expected = self.last_executed.wrapping_add(1);
        if !seq_greater_than(seq, self.last_executed) {
            return Ok(InboundAction::Duplicate);
        }
        if seq != expected {
            return Err(ReliableError::Gap { expected, got: seq });
        }
        self.last_executed = seq;
        Ok(InboundAction::Execute)
    }

    pub fn clear(&mut self) {
        self.last_executed = 0;
    }
}

/// Commands carried by one packet; almost always a handful
pub type CommandBatch = SmallVec<[(Seq, String); 4]>;

/// Snapshot of the pending log for an outgoing packet
pub fn pending_batch(log: &ReliableLog) -> CommandBatch {
    log.pending().map(|(seq, text)| (seq, text.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_pending() {
        let mut log = ReliableLog::new(8, 64);
        log.push("print hello").unwrap();
        log.push("cs 1 \"map\"").unwrap();

        let pending: Vec<_> = log.pending().collect();
        assert_eq!(pending, vec![(1, "print hello"), (2, "cs 1 \"map\"")]);
    }

    #[test]
    fn test_acknowledge_trims_pending() {
        let mut log = ReliableLog::new(8, 64);
        for i in 0..4 {
            log.push(format!("cmd {i}")).unwrap();
        }
        log.acknowledge(2).unwrap();
        let seqs: Vec<_> = log.pending().map(|(s, _)| s).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut log = ReliableLog::new(8, 64);
        for _ in 0..5 {
            log.push("x").unwrap();
        }
        log.acknowledge(4).unwrap();
        log.acknowledge(2).unwrap();
        log.acknowledge(4).unwrap();
        assert_eq!(log.acknowledged(), 4);
    }

    #[test]
    fn test_ack_beyond_sent_rejected() {
        let mut log = ReliableLog::new(8, 64);
        log.push("x").unwrap();
        assert_eq!(
            log.acknowledge(3),
            Err(ReliableError::InvalidAck { ack: 3, sent: 1 })
        );
        assert_eq!(log.acknowledged(), 0);
    }

    #[test]
    fn test_ack_monotonic_and_bounded() {
        // Arbitrary ack stream never regresses or passes the sent counter
        let mut log = ReliableLog::new(16, 64);
        let acks = [0u32, 3, 1, 7, 7, 2, 12, 9, 40, 15];
        let mut previous = 0;
        for (i, ack) in acks.iter().enumerate() {
            if i % 2 == 0 {
                for _ in 0..3 {
                    let _ = log.push("x");
                }
            }
            let _ = log.acknowledge(*ack);
            assert!(!seq_greater_than(previous, log.acknowledged()));
            assert!(!seq_greater_than(log.acknowledged(), log.sequence()));
            previous = log.acknowledged();
        }
    }

    #[test]
    fn test_overflow() {
        let mut log = ReliableLog::new(4, 64);
        for _ in 0..4 {
            log.push("x").unwrap();
        }
        assert_eq!(log.push("x"), Err(ReliableError::Overflow(5)));

        log.acknowledge(1).unwrap();
        assert!(log.push("x").is_ok());
    }

    #[test]
    fn test_command_too_long() {
        let mut log = ReliableLog::new(4, 8);
        assert_eq!(
            log.push("0123456789"),
            Err(ReliableError::CommandTooLong(10))
        );
    }

    #[test]
    fn test_log_across_wrap() {
        let mut log = ReliableLog::new(4, 64);
        log.sequence = u32::MAX - 1;
        log.acknowledged = u32::MAX - 1;
        log.push("a").unwrap();
        log.push("b").unwrap();
        log.push("c").unwrap();

        let pending: Vec<_> = log.pending().collect();
        assert_eq!(pending, vec![(u32::MAX, "a"), (0, "b"), (1, "c")]);
        log.acknowledge(0).unwrap();
        assert_eq!(log.unacknowledged(), 1);
    }

    #[test]
    fn test_inbound_in_order() {
        let mut inbound = InboundCommands::new();
        assert_eq!(inbound.accept(1), Ok(InboundAction::Execute));
        assert_eq!(inbound.accept(2), Ok(InboundAction::Execute));
        assert_eq!(inbound.accept(2), Ok(InboundAction::Duplicate));
        assert_eq!(inbound.accept(1), Ok(InboundAction::Duplicate));
        assert_eq!(inbound.last_executed(), 2);
    }

    #[test]
    fn test_inbound_gap() {
        let mut inbound = InboundCommands::new();
        inbound.accept(1).unwrap();
        assert_eq!(
            inbound.accept(3),
            Err(ReliableError::Gap {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn test_pending_batch() {
        let mut log = ReliableLog::new(8, 64);
        log.push("a").unwrap();
        let batch = pending_batch(&log);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0], (1, "a".to_string()));
    }
}
