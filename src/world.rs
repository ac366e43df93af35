//! Collaborators consulted by the server core
//!
//! The core never simulates or runs visibility queries itself. Game logic
//! hands it the entity list once per tick and answers visibility for each
//! client through these traits.

use crate::server::{ServerContext, ServerEvent};
use crate::snapshot::entity::{EntityNum, EntityState};

/// Source of the authoritative world state
pub trait Simulation {
    /// Every networked entity for this tick, sorted by entity number
    fn entities(&self) -> &[EntityState];
}

/// Opaque visibility oracle (PVS, area portals, team rules ...)
pub trait VisibilityOracle {
    fn is_visible(&self, client: usize, entity: &EntityState) -> bool;
}

impl<F> VisibilityOracle for F
where
    F: Fn(usize, &EntityState) -> bool,
{
    fn is_visible(&self, client: usize, entity: &EntityState) -> bool {
        self(client, entity)
    }
}

/// Game logic driven by the tick loop
pub trait Game: Simulation + VisibilityOracle + Send {
    /// Advance the world to `now_ms`, before the frame is recorded
    fn advance(&mut self, _now_ms: u64) {}

    /// React to what the last frame produced. Anything queued on `ctx`
    /// goes out with the next frame.
    fn handle_events(&mut self, ctx: &mut ServerContext, events: Vec<ServerEvent>, now_ms: u64);
}

/// Every client sees every entity
#[derive(Debug, Default, Clone, Copy)]
pub struct AllVisible;

impl VisibilityOracle for AllVisible {
    fn is_visible(&self, _client: usize, _entity: &EntityState) -> bool {
        true
    }
}

/// Entity table kept sorted by number
#[derive(Debug, Default, Clone)]
pub struct EntityTable {
    entities: Vec<EntityState>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity
    pub fn upsert(&mut self, state: EntityState) {
        match self
            .entities
            .binary_search_by_key(&state.number, |e| e.number)
        {
            Ok(index) => self.entities[index] = state,
            Err(index) => self.entities.insert(index, state),
        }
    }

    pub fn get_mut(&mut self, number: EntityNum) -> Option<&mut EntityState> {
        let index = self
            .entities
            .binary_search_by_key(&number, |e| e.number)
            .ok()?;
        self.entities.get_mut(index)
    }

    pub fn remove(&mut self, number: EntityNum) -> Option<EntityState> {
        let index = self
            .entities
            .binary_search_by_key(&number, |e| e.number)
            .ok()?;
        Some(self.entities.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Simulation for EntityTable {
    fn entities(&self) -> &[EntityState] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_stays_sorted() {
        let mut table = EntityTable::new();
        table.upsert(EntityState::new(9));
        table.upsert(EntityState::new(2));
        table.upsert(EntityState::new(5));

        let numbers: Vec<_> = table.entities().iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![2, 5, 9]);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut table = EntityTable::new();
        table.upsert(EntityState::new(3));
        let mut moved = EntityState::new(3);
        moved.origin = [1.0, 2.0, 3.0];
        table.upsert(moved.clone());

        assert_eq!(table.len(), 1);
        assert_eq!(table.entities()[0], moved);
        assert!(table.remove(3).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_closure_oracle() {
        let oracle = |client: usize, e: &EntityState| e.number as usize != client;
        assert!(!oracle.is_visible(1, &EntityState::new(1)));
        assert!(oracle.is_visible(1, &EntityState::new(2)));
        assert!(AllVisible.is_visible(0, &EntityState::new(0)));
    }
}
