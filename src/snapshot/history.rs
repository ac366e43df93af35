//! Shared snapshot ring and per-client sent-frame bookkeeping
//!
//! One common frame is recorded per tick into a single entity ring shared by
//! every client. Clients never copy entity states: each sent snapshot keeps the
//! frame number it was cut from plus a visibility mask over entity numbers, and
//! baselines are looked up in the ring when the next delta is built. A frame
//! whose storage has been overwritten is simply no longer resident, and any
//! client still pointing at it falls back to a full update.

use bitvec::prelude::*;

use crate::snapshot::entity::{EntityNum, EntityState};
use crate::util::sequence::{seq_diff, Seq};

/// Errors recording a frame into the ring
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("Frame has {0} entities, limit is {1}")]
    TooManyEntities(usize, usize),
    #[error("Entity number {0} outside 0..{1}")]
    EntityNumberOutOfRange(EntityNum, usize),
    #[error("Entities must be sorted by number without duplicates (at {0})")]
    Unsorted(EntityNum),
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameSlot {
    frame_num: Seq,
    /// Absolute position of the first entity in the storage ring
    start: u64,
    count: usize,
    server_time: u64,
    valid: bool,
}

/// Ring of recent world frames
pub struct SnapshotHistory {
    storage: Vec<EntityState>,
    frames: Vec<FrameSlot>,
    /// Absolute write position in `storage` (never wraps)
    next_storage: u64,
    /// Frames recorded so far (slot index source)
    frames_built: u64,
    next_frame_num: Seq,
    max_frame_entities: usize,
}

/// Read-only view of one resident frame
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    history: &'a SnapshotHistory,
    slot: FrameSlot,
}

impl<'a> FrameView<'a> {
    pub fn frame_num(&self) -> Seq {
        self.slot.frame_num
    }

    pub fn server_time(&self) -> u64 {
        self.slot.server_time
    }

    pub fn len(&self) -> usize {
        self.slot.count
    }

    pub fn is_empty(&self) -> bool {
        self.slot.count == 0
    }

    /// Entities in ascending number order
    pub fn iter(&self) -> impl Iterator<Item = &'a EntityState> + 'a {
        let storage = &self.history.storage;
        let cap = storage.len() as u64;
        let start = self.slot.start;
        (0..self.slot.count as u64).map(move |i| &storage[((start + i) % cap) as usize])
    }
}

impl SnapshotHistory {
    pub fn new(frames: usize, storage: usize, max_frame_entities: usize) -> Self {
        Self {
            storage: vec![EntityState::default(); storage.max(1)],
            frames: vec![FrameSlot::default(); frames.max(1)],
            next_storage: 0,
            frames_built: 0,
            next_frame_num: 0,
            max_frame_entities,
        }
    }

    /// Frame number the next call to [`record_frame`](Self::record_frame) will use
    pub fn next_frame_num(&self) -> Seq {
        self.next_frame_num
    }

    pub fn max_frame_entities(&self) -> usize {
        self.max_frame_entities
    }

    /// Append the world state for this tick. Entities must be sorted by
    /// number. The frame is never mutated afterwards.
    pub fn record_frame(
        &mut self,
        server_time: u64,
        entities: &[EntityState],
    ) -> Result<Seq, HistoryError> {
        if entities.len() > self.max_frame_entities || entities.len() > self.storage.len() {
            return Err(HistoryError::TooManyEntities(
                entities.len(),
                self.max_frame_entities.min(self.storage.len()),
            ));
        }

        let mut previous: Option<EntityNum> = None;
        for entity in entities {
            if entity.number as usize >= self.max_frame_entities {
                return Err(HistoryError::EntityNumberOutOfRange(
                    entity.number,
                    self.max_frame_entities,
                ));
            }
            if let Some(prev) = previous {
                if entity.number <= prev {
                    return Err(HistoryError::Unsorted(entity.number));
                }
            }
            previous = Some(entity.number);
        }

        let cap = self.storage.len() as u64;
        let start = self.next_storage;
        for (i, entity) in entities.iter().enumerate() {
            let index = ((start + i as u64) % cap) as usize;
            self.storage[index] = entity.clone();
        }
        self.next_storage += entities.len() as u64;

        let frame_num = self.next_frame_num;
        let slot_index = (self.frames_built % self.frames.len() as u64) as usize;
        self.frames[slot_index] = FrameSlot {
            frame_num,
            start,
            count: entities.len(),
            server_time,
            valid: true,
        };
        self.frames_built += 1;
        self.next_frame_num = self.next_frame_num.wrapping_add(1);

        Ok(frame_num)
    }

    /// Most recently recorded frame
    pub fn latest(&self) -> Option<FrameView<'_>> {
        if self.frames_built == 0 {
            return None;
        }
        self.frame(self.next_frame_num.wrapping_sub(1))
    }

    /// Look up a frame if it is still resident: its slot has not been reused
    /// and none of its entity records have been overwritten.
    pub fn frame(&self, frame_num: Seq) -> Option<FrameView<'_>> {
        if self.frames_built == 0 {
            return None;
        }
        let latest = self.next_frame_num.wrapping_sub(1);
        let age = seq_diff(latest, frame_num);
        if age < 0 || age as u64 >= self.frames.len() as u64 || age as u64 >= self.frames_built {
            return None;
        }

        let slot_index = ((self.frames_built - 1 - age as u64) % self.frames.len() as u64) as usize;
        let slot = self.frames[slot_index];
        if !slot.valid || slot.frame_num != frame_num {
            return None;
        }
        if self.next_storage - slot.start > self.storage.len() as u64 {
            return None;
        }

        Some(FrameView {
            history: self,
            slot,
        })
    }

    pub fn is_resident(&self, frame_num: Seq) -> bool {
        self.frame(frame_num).is_some()
    }

    /// Forget every frame (session change)
    pub fn clear(&mut self) {
        for slot in &mut self.frames {
            slot.valid = false;
        }
        self.frames_built = 0;
        self.next_storage = 0;
    }
}

// ============================================================================
// Per-client records
// ============================================================================

/// What was sent to one client in one snapshot message
#[derive(Debug, Clone)]
pub struct ClientSnapshotRecord {
    /// Outgoing message sequence that carried this snapshot
    pub message_num: Option<Seq>,
    /// Common frame the snapshot was cut from
    pub frame_num: Seq,
    /// Entities of that frame the client could see
    pub visible: BitVec<u64, Lsb0>,
    pub entity_count: usize,
    pub message_sent: u64,
    pub message_acked: Option<u64>,
    /// Encoded size, used for bandwidth pacing
    pub message_size: usize,
}

impl ClientSnapshotRecord {
    fn empty(max_entities: usize) -> Self {
        Self {
            message_num: None,
            frame_num: 0,
            visible: bitvec![u64, Lsb0; 0; max_entities],
            entity_count: 0,
            message_sent: 0,
            message_acked: None,
            message_size: 0,
        }
    }

    pub fn is_visible(&self, number: EntityNum) -> bool {
        self.visible
            .get(number as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }
}

/// Fixed window of the last `packet_backup` snapshots sent to one client,
/// indexed by message sequence.
pub struct ClientFrames {
    records: Vec<ClientSnapshotRecord>,
    mask: usize,
}

impl ClientFrames {
    pub fn new(packet_backup: usize, max_entities: usize) -> Self {
        debug_assert!(packet_backup.is_power_of_two());
        Self {
            records: (0..packet_backup)
                .map(|_| ClientSnapshotRecord::empty(max_entities))
                .collect(),
            mask: packet_backup - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Record sent under `message_num`, if it has not been overwritten since
    pub fn get(&self, message_num: Seq) -> Option<&ClientSnapshotRecord> {
        let record = &self.records[message_num as usize & self.mask];
        (record.message_num == Some(message_num)).then_some(record)
    }

    /// Reset and return the slot for a new message
    pub fn start(&mut self, message_num: Seq, frame_num: Seq) -> &mut ClientSnapshotRecord {
        let record = &mut self.records[message_num as usize & self.mask];
        record.message_num = Some(message_num);
        record.frame_num = frame_num;
        record.visible.fill(false);
        record.entity_count = 0;
        record.message_sent = 0;
        record.message_acked = None;
        record.message_size = 0;
        record
    }

    /// Note the time a message was first acknowledged
    pub fn mark_acked(&mut self, message_num: Seq, now_ms: u64) {
        let record = &mut self.records[message_num as usize & self.mask];
        if record.message_num == Some(message_num) && record.message_acked.is_none() {
            record.message_acked = Some(now_ms);
        }
    }

    /// Store the encoded size of the packet that carried `message_num`
    pub fn record_size(&mut self, message_num: Seq, size: usize) {
        let record = &mut self.records[message_num as usize & self.mask];
        if record.message_num == Some(message_num) {
            record.message_size = size;
        }
    }

    /// Average round trip over acknowledged records, in milliseconds
    pub fn average_ping(&self) -> Option<u64> {
        let mut total = 0u64;
        let mut count = 0u64;
        for record in &self.records {
            if let (Some(_), Some(acked)) = (record.message_num, record.message_acked) {
                total += acked.saturating_sub(record.message_sent);
                count += 1;
            }
        }
        (count > 0).then(|| total / count)
    }

    pub fn clear(&mut self) {
        for record in &mut self.records {
            record.message_num = None;
            record.message_acked = None;
            record.visible.fill(false);
            record.entity_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(numbers: &[EntityNum]) -> Vec<EntityState> {
        numbers.iter().map(|&n| EntityState::new(n)).collect()
    }

    #[test]
    fn test_record_and_read_frame() {
        let mut history = SnapshotHistory::new(8, 64, 16);
        let frame = history.record_frame(100, &entities(&[1, 4, 9])).unwrap();

        let view = history.frame(frame).unwrap();
        assert_eq!(view.server_time(), 100);
        let numbers: Vec<_> = view.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 4, 9]);
        assert_eq!(history.latest().unwrap().frame_num(), frame);
    }

    #[test]
    fn test_frame_numbers_increase() {
        let mut history = SnapshotHistory::new(8, 64, 16);
        let a = history.record_frame(0, &[]).unwrap();
        let b = history.record_frame(50, &[]).unwrap();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn test_unsorted_frame_rejected() {
        let mut history = SnapshotHistory::new(8, 64, 16);
        assert_eq!(
            history.record_frame(0, &entities(&[3, 2])),
            Err(HistoryError::Unsorted(2))
        );
        assert_eq!(
            history.record_frame(0, &entities(&[3, 3])),
            Err(HistoryError::Unsorted(3))
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut history = SnapshotHistory::new(8, 64, 4);
        assert!(matches!(
            history.record_frame(0, &entities(&[0, 1, 2, 3, 4])),
            Err(HistoryError::TooManyEntities(5, 4))
        ));
        assert!(matches!(
            history.record_frame(0, &entities(&[7])),
            Err(HistoryError::EntityNumberOutOfRange(7, 4))
        ));
    }

    #[test]
    fn test_frame_evicted_when_slots_reused() {
        let mut history = SnapshotHistory::new(4, 1024, 16);
        let first = history.record_frame(0, &entities(&[1])).unwrap();
        for t in 1..4 {
            history.record_frame(t, &entities(&[1])).unwrap();
        }
        assert!(history.is_resident(first));

        history.record_frame(4, &entities(&[1])).unwrap();
        assert!(!history.is_resident(first));
    }

    #[test]
    fn test_frame_evicted_when_storage_overwritten() {
        // Plenty of frame slots, but storage holds only 6 entity records
        let mut history = SnapshotHistory::new(16, 6, 4);
        let first = history.record_frame(0, &entities(&[0, 1, 2])).unwrap();
        let second = history.record_frame(1, &entities(&[0, 1, 2])).unwrap();
        assert!(history.is_resident(first));

        history.record_frame(2, &entities(&[0])).unwrap();
        assert!(!history.is_resident(first));
        assert!(history.is_resident(second));
    }

    #[test]
    fn test_storage_wraps_inside_frame() {
        let mut history = SnapshotHistory::new(16, 5, 4);
        history.record_frame(0, &entities(&[0, 1, 2])).unwrap();
        history.record_frame(1, &entities(&[3])).unwrap();
        // positions 4, 0, 1
        let wrapped = history.record_frame(2, &entities(&[0, 1, 2])).unwrap();

        let numbers: Vec<_> = history
            .frame(wrapped)
            .unwrap()
            .iter()
            .map(|e| e.number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_future_frame_not_resident() {
        let mut history = SnapshotHistory::new(8, 64, 16);
        let frame = history.record_frame(0, &[]).unwrap();
        assert!(!history.is_resident(frame.wrapping_add(1)));
    }

    #[test]
    fn test_frame_lookup_across_wrap() {
        let mut history = SnapshotHistory::new(8, 64, 16);
        history.next_frame_num = u32::MAX - 1;
        let a = history.record_frame(0, &entities(&[1])).unwrap();
        let b = history.record_frame(1, &entities(&[1])).unwrap();
        let c = history.record_frame(2, &entities(&[1])).unwrap();
        assert_eq!(c, 0);
        assert!(history.is_resident(a));
        assert!(history.is_resident(b));
        assert!(history.is_resident(c));
    }

    #[test]
    fn test_client_frames_indexing() {
        let mut frames = ClientFrames::new(4, 16);
        let record = frames.start(10, 3);
        record.visible.set(5, true);
        record.message_sent = 1000;

        assert!(frames.get(10).unwrap().is_visible(5));
        assert!(!frames.get(10).unwrap().is_visible(6));
        // 14 maps onto the same slot and replaces it
        frames.start(14, 4);
        assert!(frames.get(10).is_none());
        assert_eq!(frames.get(14).unwrap().frame_num, 4);
    }

    #[test]
    fn test_client_frames_ping() {
        let mut frames = ClientFrames::new(4, 16);
        frames.start(1, 0).message_sent = 1000;
        frames.start(2, 1).message_sent = 1050;
        frames.mark_acked(1, 1080);
        frames.mark_acked(2, 1110);
        // second ack of the same message is ignored
        frames.mark_acked(2, 1500);
        assert_eq!(frames.average_ping(), Some(70));
    }
}
