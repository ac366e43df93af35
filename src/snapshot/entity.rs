use serde::{Deserialize, Serialize};

/// Stable entity number; doubles as the index into the world's entity table
pub type EntityNum = u16;

pub type Vec3 = [f32; 3];

/// Networked state of one world entity at one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub number: EntityNum,
    /// Game-defined entity type
    pub kind: u8,
    pub flags: u32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub velocity: Vec3,
    pub model_index: u16,
    /// Animation frame
    pub frame: u16,
    /// One-shot event id, 0 for none
    pub event: u16,
    /// Packed collision bounds
    pub solid: u32,
}

impl EntityState {
    pub fn new(number: EntityNum) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }
}

/// Field-level difference between two states of the same entity.
/// `None` means the field is unchanged from the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub number: EntityNum,
    pub kind: Option<u8>,
    pub flags: Option<u32>,
    pub origin: Option<Vec3>,
    pub angles: Option<Vec3>,
    pub velocity: Option<Vec3>,
    pub model_index: Option<u16>,
    pub frame: Option<u16>,
    pub event: Option<u16>,
    pub solid: Option<u32>,
}

/// Pick `current` when it differs from `base`
#[inline]
fn changed<T: PartialEq + Copy>(base: &T, current: &T) -> Option<T> {
    if base != current {
        Some(*current)
    } else {
        None
    }
}

impl EntityDelta {
    /// Compare two states of the same entity.
    /// Returns `None` if nothing changed.
    pub fn between(base: &EntityState, current: &EntityState) -> Option<Self> {
        debug_assert_eq!(base.number, current.number);

        let delta = Self {
            number: current.number,
            kind: changed(&base.kind, &current.kind),
            flags: changed(&base.flags, &current.flags),
            origin: changed(&base.origin, &current.origin),
            angles: changed(&base.angles, &current.angles),
            velocity: changed(&base.velocity, &current.velocity),
            model_index: changed(&base.model_index, &current.model_index),
            frame: changed(&base.frame, &current.frame),
            event: changed(&base.event, &current.event),
            solid: changed(&base.solid, &current.solid),
        };

        if delta.changed_fields() == 0 {
            None
        } else {
            Some(delta)
        }
    }

    /// Number of fields carried by this delta
    pub fn changed_fields(&self) -> usize {
        [
            self.kind.is_some(),
            self.flags.is_some(),
            self.origin.is_some(),
            self.angles.is_some(),
            self.velocity.is_some(),
            self.model_index.is_some(),
            self.frame.is_some(),
            self.event.is_some(),
            self.solid.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Rebuild the current state from the baseline this delta was built against
    pub fn apply(&self, base: &EntityState) -> EntityState {
        EntityState {
            number: self.number,
            kind: self.kind.unwrap_or(base.kind),
            flags: self.flags.unwrap_or(base.flags),
            origin: self.origin.unwrap_or(base.origin),
            angles: self.angles.unwrap_or(base.angles),
            velocity: self.velocity.unwrap_or(base.velocity),
            model_index: self.model_index.unwrap_or(base.model_index),
            frame: self.frame.unwrap_or(base.frame),
            event: self.event.unwrap_or(base.event),
            solid: self.solid.unwrap_or(base.solid),
        }
    }
}

/// One entry of a snapshot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityUpdate {
    /// Entity entered the client's view (or no baseline exists): full record
    Added(EntityState),
    /// Entity stayed visible and some fields changed
    Changed(EntityDelta),
    /// Entity left the client's view
    Removed(EntityNum),
}

impl EntityUpdate {
    pub fn number(&self) -> EntityNum {
        match self {
            EntityUpdate::Added(state) => state.number,
            EntityUpdate::Changed(delta) => delta.number,
            EntityUpdate::Removed(number) => *number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving_entity(number: EntityNum) -> EntityState {
        EntityState {
            number,
            kind: 1,
            origin: [10.0, 20.0, 30.0],
            model_index: 7,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_changes_produces_no_delta() {
        let state = moving_entity(3);
        assert!(EntityDelta::between(&state, &state).is_none());
    }

    #[test]
    fn test_origin_change_detected() {
        let base = moving_entity(3);
        let mut current = base.clone();
        current.origin[0] = 11.0;

        let delta = EntityDelta::between(&base, &current).unwrap();
        assert_eq!(delta.origin, Some([11.0, 20.0, 30.0]));
        assert!(delta.angles.is_none());
        assert!(delta.model_index.is_none());
        assert_eq!(delta.changed_fields(), 1);
    }

    #[test]
    fn test_multiple_changes_combined() {
        let base = moving_entity(3);
        let mut current = base.clone();
        current.frame = 4;
        current.event = 2;
        current.velocity = [1.0, 0.0, 0.0];

        let delta = EntityDelta::between(&base, &current).unwrap();
        assert_eq!(delta.changed_fields(), 3);
        assert!(delta.origin.is_none());
    }

    #[test]
    fn test_apply_rebuilds_current() {
        let base = moving_entity(9);
        let mut current = base.clone();
        current.angles = [0.0, 90.0, 0.0];
        current.solid = 0x00ff_00ff;
        current.flags = 4;

        let delta = EntityDelta::between(&base, &current).unwrap();
        assert_eq!(delta.apply(&base), current);
    }

    #[test]
    fn test_update_number() {
        assert_eq!(EntityUpdate::Removed(12).number(), 12);
        assert_eq!(EntityUpdate::Added(EntityState::new(4)).number(), 4);
    }
}
