//! Per-client delta compression against the shared snapshot ring
//!
//! Every entity visible in the current frame is classified against the
//! client's baseline:
//! - unchanged: omitted
//! - changed: field delta ([`EntityUpdate::Changed`])
//! - newly visible: full record ([`EntityUpdate::Added`])
//! - no longer visible: removal marker ([`EntityUpdate::Removed`])
//!
//! Without a usable baseline the payload degrades to a full update of every
//! visible entity. That path never fails; it only costs bandwidth.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::snapshot::entity::{EntityDelta, EntityNum, EntityState, EntityUpdate};
use crate::snapshot::history::{ClientFrames, ClientSnapshotRecord, FrameView, SnapshotHistory};
use crate::util::sequence::{seq_diff, Seq};

/// Snapshot body sent to one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Common frame this snapshot was cut from
    pub frame_num: Seq,
    /// Message sequence of the baseline snapshot, `None` for a full update
    pub delta_from: Option<Seq>,
    pub server_time: u64,
    /// Sorted by entity number
    pub entities: Vec<EntityUpdate>,
}

/// Why a client received a full update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    /// Client has not acknowledged any snapshot yet (or is not active)
    NoBaseline,
    /// Acknowledged message is outside the backup window
    BaselineTooOld,
    /// Baseline frame has been overwritten in the shared ring
    BaselineEvicted,
}

/// Baseline chosen for the next snapshot
pub enum Baseline<'a> {
    Full(FullReason),
    Delta {
        message_num: Seq,
        record: &'a ClientSnapshotRecord,
        frame: FrameView<'a>,
    },
}

/// Statistics about one encoded snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeltaStats {
    pub visible: usize,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub full_update: bool,
}

/// Choose the most recent acknowledged snapshot as the delta reference,
/// provided both the client record and its frame are still resident.
pub fn select_baseline<'a>(
    history: &'a SnapshotHistory,
    frames: &'a ClientFrames,
    outgoing_seq: Seq,
    delta_message: Option<Seq>,
) -> Baseline<'a> {
    let Some(message_num) = delta_message else {
        return Baseline::Full(FullReason::NoBaseline);
    };

    // Leave a little headroom so the record is not being reused as we read it
    let age = seq_diff(outgoing_seq, message_num);
    if age <= 0 || age as usize >= frames.capacity().saturating_sub(3) {
        return Baseline::Full(FullReason::BaselineTooOld);
    }

    let Some(record) = frames.get(message_num) else {
        return Baseline::Full(FullReason::BaselineTooOld);
    };

    match history.frame(record.frame_num) {
        Some(frame) => Baseline::Delta {
            message_num,
            record,
            frame,
        },
        None => Baseline::Full(FullReason::BaselineEvicted),
    }
}

/// Build the snapshot for one client and record what was sent under
/// `outgoing_seq`. At most `max_entities` visible entities are sent, lowest
/// numbers first. Returns `None` when no frame has been recorded yet.
pub fn encode_snapshot<V>(
    history: &SnapshotHistory,
    frames: &mut ClientFrames,
    outgoing_seq: Seq,
    delta_message: Option<Seq>,
    is_visible: V,
    max_entities: usize,
    now_ms: u64,
) -> Option<(SnapshotPayload, DeltaStats)>
where
    V: Fn(&EntityState) -> bool,
{
    let current = history.latest()?;
    let visible: Vec<&EntityState> = current
        .iter()
        .filter(|e| is_visible(e))
        .take(max_entities)
        .collect();

    let mut stats = DeltaStats {
        visible: visible.len(),
        ..Default::default()
    };

    let (delta_from, entities) = match select_baseline(history, frames, outgoing_seq, delta_message)
    {
        Baseline::Delta {
            message_num,
            record,
            frame,
        } => {
            let baseline = frame.iter().filter(|e| record.is_visible(e.number));
            (Some(message_num), diff_sorted(baseline, visible.iter().copied(), &mut stats))
        }
        Baseline::Full(_) => {
            stats.full_update = true;
            (
                None,
                diff_sorted(std::iter::empty(), visible.iter().copied(), &mut stats),
            )
        }
    };

    let record = frames.start(outgoing_seq, current.frame_num());
    for entity in &visible {
        record.visible.set(entity.number as usize, true);
    }
    record.entity_count = visible.len();
    record.message_sent = now_ms;

    Some((
        SnapshotPayload {
            frame_num: current.frame_num(),
            delta_from,
            server_time: current.server_time(),
            entities,
        },
        stats,
    ))
}

/// Merge-walk two entity lists sorted by number
fn diff_sorted<'a, B, C>(baseline: B, current: C, stats: &mut DeltaStats) -> Vec<EntityUpdate>
where
    B: Iterator<Item = &'a EntityState>,
    C: Iterator<Item = &'a EntityState>,
{
    let mut updates = Vec::new();
    let mut baseline = baseline.peekable();
    let mut current = current.peekable();

    loop {
        match (current.peek().copied(), baseline.peek().copied()) {
            (Some(cur), Some(base)) if cur.number == base.number => {
                match EntityDelta::between(base, cur) {
                    Some(delta) => {
                        stats.changed += 1;
                        updates.push(EntityUpdate::Changed(delta));
                    }
                    None => stats.unchanged += 1,
                }
                current.next();
                baseline.next();
            }
            (Some(cur), Some(base)) if cur.number < base.number => {
                stats.added += 1;
                updates.push(EntityUpdate::Added(cur.clone()));
                current.next();
            }
            (_, Some(base)) => {
                stats.removed += 1;
                updates.push(EntityUpdate::Removed(base.number));
                baseline.next();
            }
            (Some(cur), None) => {
                stats.added += 1;
                updates.push(EntityUpdate::Added(cur.clone()));
                current.next();
            }
            (None, None) => break,
        }
    }

    updates
}

/// Receiver-side reconstruction: apply a payload to the entity set the
/// client holds for its baseline. Used by tests and tooling.
pub fn reconstruct(
    baseline: &FxHashMap<EntityNum, EntityState>,
    payload: &SnapshotPayload,
) -> FxHashMap<EntityNum, EntityState> {
    let mut result = if payload.delta_from.is_some() {
        baseline.clone()
    } else {
        FxHashMap::default()
    };

    for update in &payload.entities {
        match update {
            EntityUpdate::Added(state) => {
                result.insert(state.number, state.clone());
            }
            EntityUpdate::Changed(delta) => {
                let base = result
                    .get(&delta.number)
                    .cloned()
                    .unwrap_or_else(|| EntityState::new(delta.number));
                result.insert(delta.number, delta.apply(&base));
            }
            EntityUpdate::Removed(number) => {
                result.remove(number);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn entity(number: EntityNum, x: f32) -> EntityState {
        EntityState {
            number,
            origin: [x, 0.0, 0.0],
            ..Default::default()
        }
    }

    fn world(numbers: &[EntityNum]) -> Vec<EntityState> {
        numbers.iter().map(|&n| entity(n, n as f32)).collect()
    }

    fn as_map<'a>(entities: impl Iterator<Item = &'a EntityState>) -> FxHashMap<EntityNum, EntityState> {
        entities.map(|e| (e.number, e.clone())).collect()
    }

    #[test]
    fn test_first_snapshot_is_full() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(50, &world(&[1, 2, 3])).unwrap();

        let (payload, stats) =
            encode_snapshot(&history, &mut frames, 1, None, |_| true, 64, 1000).unwrap();

        assert!(payload.delta_from.is_none());
        assert!(stats.full_update);
        assert_eq!(stats.added, 3);
        assert!(payload
            .entities
            .iter()
            .all(|u| matches!(u, EntityUpdate::Added(_))));
        assert_eq!(frames.get(1).unwrap().entity_count, 3);
    }

    #[test]
    fn test_nothing_recorded_yields_none() {
        let history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        assert!(encode_snapshot(&history, &mut frames, 1, None, |_| true, 64, 0).is_none());
    }

    #[test]
    fn test_single_field_change_only() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(50, &world(&[1, 5, 9])).unwrap();
        encode_snapshot(&history, &mut frames, 1, None, |_| true, 64, 0).unwrap();

        let mut next = world(&[1, 5, 9]);
        next[1].origin = [99.0, 1.0, 0.0];
        history.record_frame(100, &next).unwrap();

        let (payload, stats) =
            encode_snapshot(&history, &mut frames, 2, Some(1), |_| true, 64, 50).unwrap();

        assert_eq!(payload.delta_from, Some(1));
        assert_eq!(payload.entities.len(), 1);
        match &payload.entities[0] {
            EntityUpdate::Changed(delta) => {
                assert_eq!(delta.number, 5);
                assert_eq!(delta.origin, Some([99.0, 1.0, 0.0]));
                assert_eq!(delta.changed_fields(), 1);
            }
            other => panic!("expected field delta, got {other:?}"),
        }
        assert_eq!(stats.unchanged, 2);
    }

    #[test]
    fn test_visibility_changes_add_and_remove() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(0, &world(&[1, 2, 3, 4])).unwrap();
        encode_snapshot(&history, &mut frames, 1, None, |e| e.number <= 2, 64, 0).unwrap();

        history.record_frame(50, &world(&[1, 2, 3, 4])).unwrap();
        let (payload, stats) =
            encode_snapshot(&history, &mut frames, 2, Some(1), |e| e.number >= 2, 64, 50).unwrap();

        let updates: Vec<_> = payload.entities.clone();
        assert_eq!(
            updates,
            vec![
                EntityUpdate::Removed(1),
                EntityUpdate::Added(entity(3, 3.0)),
                EntityUpdate::Added(entity(4, 4.0)),
            ]
        );
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_never_visible_entities_omitted() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(0, &world(&[1, 2])).unwrap();
        let (payload, _) =
            encode_snapshot(&history, &mut frames, 1, None, |e| e.number == 2, 64, 0).unwrap();
        assert_eq!(payload.entities.len(), 1);
        assert_eq!(payload.entities[0].number(), 2);
    }

    #[test]
    fn test_entity_cap_keeps_lowest_numbers() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(0, &world(&[1, 2, 3, 4])).unwrap();
        let (payload, stats) =
            encode_snapshot(&history, &mut frames, 1, None, |_| true, 2, 0).unwrap();
        let numbers: Vec<_> = payload.entities.iter().map(|u| u.number()).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(stats.visible, 2);
    }

    #[test]
    fn test_evicted_baseline_degrades_to_full() {
        let mut history = SnapshotHistory::new(4, 256, 32);
        let mut frames = ClientFrames::new(32, 32);
        history.record_frame(0, &world(&[1])).unwrap();
        encode_snapshot(&history, &mut frames, 1, None, |_| true, 64, 0).unwrap();

        for t in 1..=5 {
            history.record_frame(t * 50, &world(&[1])).unwrap();
        }
        let (payload, stats) =
            encode_snapshot(&history, &mut frames, 2, Some(1), |_| true, 64, 300).unwrap();
        assert!(stats.full_update);
        assert!(payload.delta_from.is_none());
        assert_eq!(payload.entities, vec![EntityUpdate::Added(entity(1, 1.0))]);
    }

    #[test]
    fn test_baseline_outside_backup_window() {
        let mut history = SnapshotHistory::new(64, 1024, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(0, &world(&[1])).unwrap();
        encode_snapshot(&history, &mut frames, 1, None, |_| true, 64, 0).unwrap();
        history.record_frame(50, &world(&[1])).unwrap();

        assert!(matches!(
            select_baseline(&history, &frames, 7, Some(1)),
            Baseline::Full(FullReason::BaselineTooOld)
        ));
        assert!(matches!(
            select_baseline(&history, &frames, 3, Some(1)),
            Baseline::Delta { .. }
        ));
    }

    #[test]
    fn test_baseline_across_sequence_wrap() {
        let mut history = SnapshotHistory::new(16, 256, 32);
        let mut frames = ClientFrames::new(8, 32);
        history.record_frame(0, &world(&[1])).unwrap();
        encode_snapshot(&history, &mut frames, u32::MAX, None, |_| true, 64, 0).unwrap();
        history.record_frame(50, &world(&[1])).unwrap();

        assert!(matches!(
            select_baseline(&history, &frames, 0, Some(u32::MAX)),
            Baseline::Delta { .. }
        ));
    }

    #[test]
    fn test_reconstruction_matches_visible_set() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut history = SnapshotHistory::new(32, 4096, 64);
        let mut frames = ClientFrames::new(16, 64);

        let mut client_view: FxHashMap<Seq, FxHashMap<EntityNum, EntityState>> =
            FxHashMap::default();
        let mut acked: Option<Seq> = None;

        for seq in 1..200u32 {
            let mut entities = Vec::new();
            for number in 0..64u16 {
                if rng.gen_bool(0.6) {
                    let mut e = entity(number, rng.gen_range(0..4) as f32);
                    e.frame = rng.gen_range(0..3);
                    entities.push(e);
                }
            }
            history.record_frame(seq as u64 * 50, &entities).unwrap();
            let mask: u64 = rng.gen();
            let visible = |e: &EntityState| mask & (1 << e.number) != 0;

            let (payload, _) =
                encode_snapshot(&history, &mut frames, seq, acked, visible, 64, 0).unwrap();

            let baseline = payload
                .delta_from
                .and_then(|m| client_view.get(&m).cloned())
                .unwrap_or_default();
            let rebuilt = reconstruct(&baseline, &payload);

            let expected = as_map(entities.iter().filter(|e| visible(e)));
            assert_eq!(rebuilt, expected, "mismatch at sequence {seq}");

            client_view.insert(seq, rebuilt);
            // Drop roughly a third of the snapshots
            if rng.gen_bool(0.66) {
                acked = Some(seq);
            }
        }
    }
}
