use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{BlackoutInfo, Slot, Span};

/// Institution-wide no-booking windows. Globally scoped: every request is
/// intersected against every period regardless of resource.
pub struct BlackoutRegistry {
    periods: DashMap<Ulid, Span>,
}

impl Default for BlackoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackoutRegistry {
    pub fn new() -> Self {
        Self {
            periods: DashMap::new(),
        }
    }

    pub fn insert(&self, id: Ulid, span: Span) {
        self.periods.insert(id, span);
    }

    /// Idempotent: removing an unknown id is a no-op. Returns whether the
    /// period existed.
    pub fn remove(&self, id: Ulid) -> bool {
        self.periods.remove(&id).is_some()
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.periods.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// The first blackout period any of the slots' intervals intersects.
    pub fn covering(&self, slots: &[Slot]) -> Option<Ulid> {
        for entry in self.periods.iter() {
            for slot in slots {
                if slot.span().overlaps(entry.value()) {
                    return Some(*entry.key());
                }
            }
        }
        None
    }

    pub fn is_blackout(&self, slots: &[Slot]) -> bool {
        self.covering(slots).is_some()
    }

    pub fn list(&self) -> Vec<BlackoutInfo> {
        let mut out: Vec<BlackoutInfo> = self
            .periods
            .iter()
            .map(|e| BlackoutInfo {
                id: *e.key(),
                start: e.value().start,
                end: e.value().end,
            })
            .collect();
        out.sort_by_key(|b| (b.start, b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SLOT_MS;

    fn slot(n: i64) -> Slot {
        Slot::new(n * SLOT_MS)
    }

    #[test]
    fn covering_finds_intersecting_period() {
        let reg = BlackoutRegistry::new();
        let id = Ulid::new();
        // Covers slots 36..39 (12:00-13:00 in slot numbers)
        reg.insert(id, Span::new(36 * SLOT_MS, 39 * SLOT_MS));

        assert_eq!(reg.covering(&[slot(37)]), Some(id));
        assert!(reg.is_blackout(&[slot(35), slot(36)]));
        assert!(!reg.is_blackout(&[slot(35)]));
        // Period end is exclusive: the slot starting right at the end is fine
        assert!(!reg.is_blackout(&[slot(39)]));
    }

    #[test]
    fn partial_slot_overlap_counts() {
        let reg = BlackoutRegistry::new();
        // Period covering only the middle of one slot still blocks it
        reg.insert(Ulid::new(), Span::new(SLOT_MS / 2, SLOT_MS / 2 + 1000));
        assert!(reg.is_blackout(&[slot(0)]));
        assert!(!reg.is_blackout(&[slot(1)]));
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = BlackoutRegistry::new();
        let id = Ulid::new();
        reg.insert(id, Span::new(0, 1000));
        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        assert!(!reg.remove(Ulid::new()));
        assert!(reg.is_empty());
    }

    #[test]
    fn list_is_sorted_by_start() {
        let reg = BlackoutRegistry::new();
        reg.insert(Ulid::new(), Span::new(5000, 6000));
        reg.insert(Ulid::new(), Span::new(1000, 2000));
        reg.insert(Ulid::new(), Span::new(3000, 4000));
        let starts: Vec<i64> = reg.list().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![1000, 3000, 5000]);
    }
}
