use std::collections::HashSet;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::QuotaInfo;

/// System policy default: bookings per requester per period.
pub const DEFAULT_QUOTA_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    WithinLimit,
    RequiresJustification,
}

#[derive(Debug)]
struct QuotaState {
    limit: u32,
    /// Booking ids that have committed against this period's counter.
    /// `used` is the size of this set, which makes commit idempotent per
    /// booking and release a floor-at-zero operation by construction.
    committed: HashSet<Ulid>,
}

/// Per-requester booking counters. Each operation touches a single dashmap
/// entry under its shard lock, so commit/release are atomic per requester.
pub struct QuotaTracker {
    records: DashMap<String, QuotaState>,
    default_limit: u32,
}

impl QuotaTracker {
    pub fn new(default_limit: u32) -> Self {
        Self {
            records: DashMap::new(),
            default_limit,
        }
    }

    fn state(&self, requester: &str) -> dashmap::mapref::one::RefMut<'_, String, QuotaState> {
        self.records
            .entry(requester.to_string())
            .or_insert_with(|| QuotaState {
                limit: self.default_limit,
                committed: HashSet::new(),
            })
    }

    /// Current record; default-initialized view if the requester is unknown.
    pub fn get(&self, requester: &str) -> QuotaInfo {
        match self.records.get(requester) {
            Some(s) => QuotaInfo {
                requester: requester.to_string(),
                used: s.committed.len() as u32,
                limit: s.limit,
            },
            None => QuotaInfo {
                requester: requester.to_string(),
                used: 0,
                limit: self.default_limit,
            },
        }
    }

    /// Would one more booking fit? Pure read: nothing is held or counted
    /// until the booking actually commits.
    pub fn reserve(&self, requester: &str) -> QuotaDecision {
        let info = self.get(requester);
        if info.used >= info.limit {
            QuotaDecision::RequiresJustification
        } else {
            QuotaDecision::WithinLimit
        }
    }

    /// Count a committed booking. Idempotent per booking id.
    pub fn commit(&self, requester: &str, booking_id: Ulid) {
        self.state(requester).committed.insert(booking_id);
    }

    /// Release a booking's count on cancellation. No-op if the booking never
    /// committed (or was already released).
    pub fn release(&self, requester: &str, booking_id: Ulid) {
        if let Some(mut s) = self.records.get_mut(requester) {
            s.committed.remove(&booking_id);
        }
    }

    /// Move a committed count from one booking id to another without changing
    /// `used`; reschedule must not double-count.
    pub fn transfer(&self, requester: &str, old_id: Ulid, new_id: Ulid) {
        let mut s = self.state(requester);
        if s.committed.remove(&old_id) {
            s.committed.insert(new_id);
        }
    }

    /// Staff override: replaces the limit unconditionally.
    pub fn set_limit(&self, requester: &str, limit: u32) {
        self.state(requester).limit = limit;
    }

    /// Policy-period rollover: clears the committed set. Cancelling a
    /// pre-reset booking afterwards releases nothing.
    pub fn reset(&self, requester: &str) {
        if let Some(mut s) = self.records.get_mut(requester) {
            s.committed.clear();
        }
    }

    /// Overwrite a record exactly. Used when replaying compacted WALs.
    pub fn restore(&self, requester: &str, limit: u32, committed: Vec<Ulid>) {
        self.records.insert(
            requester.to_string(),
            QuotaState {
                limit,
                committed: committed.into_iter().collect(),
            },
        );
    }

    /// Every materialized record, for the staff dashboard.
    pub fn all(&self) -> Vec<QuotaInfo> {
        let mut out: Vec<QuotaInfo> = self
            .records
            .iter()
            .map(|e| QuotaInfo {
                requester: e.key().clone(),
                used: e.value().committed.len() as u32,
                limit: e.value().limit,
            })
            .collect();
        out.sort_by(|a, b| a.requester.cmp(&b.requester));
        out
    }

    /// Snapshot for WAL compaction: `(requester, limit, committed ids)`.
    pub fn snapshot(&self) -> Vec<(String, u32, Vec<Ulid>)> {
        self.records
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().limit,
                    e.value().committed.iter().copied().collect(),
                )
            })
            .collect()
    }
}
