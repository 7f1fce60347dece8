use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Slot granularity: 20 minutes. Fixed system-wide.
pub const SLOT_MS: Ms = 20 * 60_000;

/// Round down to the nearest slot boundary.
pub fn floor_slot(t: Ms) -> Ms {
    t - t.rem_euclid(SLOT_MS)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// One aligned 20-minute bookable unit. Equality and ordering are by `start`;
/// the covered interval is `[start, start + SLOT_MS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
}

impl Slot {
    pub fn new(start: Ms) -> Self {
        debug_assert!(start % SLOT_MS == 0, "Slot start must be aligned");
        Self { start }
    }

    pub fn is_aligned(start: Ms) -> bool {
        start % SLOT_MS == 0
    }

    pub fn end(&self) -> Ms {
        self.start + SLOT_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    /// The slot immediately after this one.
    pub fn next(&self) -> Slot {
        Slot { start: self.start + SLOT_MS }
    }

    /// The slot immediately before this one.
    pub fn prev(&self) -> Slot {
        Slot { start: self.start - SLOT_MS }
    }
}

// ── Booking lifecycle ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingApproval,
    Confirmed,
    Declined,
    Rescheduled,
    Cancelled,
}

impl BookingStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Declined | BookingStatus::Rescheduled | BookingStatus::Cancelled
        )
    }

    /// Whether a booking in this state still holds its slots.
    pub fn blocks_slots(&self) -> bool {
        matches!(self, BookingStatus::PendingApproval | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingApproval => "pending_approval",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Declined => "declined",
            BookingStatus::Rescheduled => "rescheduled",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Normalize a status tag at the storage boundary. The predecessor system
    /// wrote a mix of ad-hoc strings ("Yes", "No", "Reschedule", "Approved",
    /// "pending"); those are accepted here and nowhere else. Unknown tags are
    /// rejected.
    pub fn parse(tag: &str) -> Option<BookingStatus> {
        match tag {
            "pending_approval" | "pending" => Some(BookingStatus::PendingApproval),
            "confirmed" | "Yes" | "Approved" => Some(BookingStatus::Confirmed),
            "declined" | "No" | "Declined" => Some(BookingStatus::Declined),
            "rescheduled" | "Reschedule" => Some(BookingStatus::Rescheduled),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub at: Ms,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, at: Ms) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            at,
        }
    }
}

/// A submitted booking request, before the scheduler has accepted it.
/// `slots` must be a non-empty run of contiguous aligned slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource: String,
    pub requester: String,
    pub slots: Vec<Slot>,
    pub location: String,
    pub comment: String,
    pub topic: Option<String>,
    pub assignment_id: Option<String>,
    pub prep_materials: Vec<String>,
    pub justification: Option<String>,
}

/// The persisted booking record. Mutated only through scheduler operations.
/// The slot run is stored as `first_slot` + `slot_count`; contiguity is a
/// submit-time invariant, so the run is always reconstructible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource: String,
    pub requester: String,
    pub first_slot: Slot,
    pub slot_count: u32,
    pub location: String,
    pub comment: String,
    pub topic: Option<String>,
    pub assignment_id: Option<String>,
    pub prep_materials: Vec<String>,
    pub justification: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub audit: Vec<AuditEntry>,
}

impl Booking {
    /// Full interval covered by the slot run.
    pub fn span(&self) -> Span {
        Span::new(
            self.first_slot.start,
            self.first_slot.start + self.slot_count as Ms * SLOT_MS,
        )
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        (0..self.slot_count as Ms).map(|i| Slot {
            start: self.first_slot.start + i * SLOT_MS,
        })
    }
}

// ── Busy periods (calendar sync + manual blocks) ─────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusySource {
    /// Imported from an external calendar for a staff resource.
    CalendarSync,
    /// Ad-hoc block placed by staff.
    Manual,
}

impl BusySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusySource::CalendarSync => "calendar_sync",
            BusySource::Manual => "manual",
        }
    }

    pub fn parse(tag: &str) -> Option<BusySource> {
        match tag {
            "calendar_sync" => Some(BusySource::CalendarSync),
            "manual" => Some(BusySource::Manual),
            _ => None,
        }
    }
}

// ── Per-resource availability index ──────────────────────────────

/// Why an interval on a resource is blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A booking still holding its slots (confirmed or pending approval).
    Booking,
    /// A busy period (calendar sync or manual block).
    Busy { source: BusySource },
}

/// One blocked interval on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

/// Materialized blocked-time view for one resource. Derived state: rebuilt
/// from the WAL on startup, updated incrementally as bookings commit and
/// cancel. Entries exist only while they hold time; a booking that reaches
/// a terminal state has its entry removed.
#[derive(Debug, Clone)]
pub struct ResourceSchedule {
    pub resource: String,
    /// Sorted by `span.start`.
    pub entries: Vec<ScheduleEntry>,
}

impl ResourceSchedule {
    pub fn new(resource: String) -> Self {
        Self {
            resource,
            entries: Vec::new(),
        }
    }

    /// Insert an entry maintaining sort order by span.start.
    pub fn insert_entry(&mut self, entry: ScheduleEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    /// Remove an entry by id.
    pub fn remove_entry(&mut self, id: Ulid) -> Option<ScheduleEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            Some(self.entries.remove(pos))
        } else {
            None
        }
    }

    /// Return only entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduleEntry> {
        let right_bound = self
            .entries
            .partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingSubmitted {
        booking: Booking,
    },
    BookingDecided {
        id: Ulid,
        resource: String,
        approved: bool,
        actor: String,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource: String,
        actor: String,
        at: Ms,
    },
    /// The old record becomes terminal; `replacement` is a new confirmed
    /// booking linked back to `old_id` through its audit trail.
    BookingRescheduled {
        old_id: Ulid,
        replacement: Booking,
        reason: String,
        actor: String,
        at: Ms,
    },
    BlackoutAdded {
        id: Ulid,
        span: Span,
    },
    BlackoutRemoved {
        id: Ulid,
    },
    BusyMarked {
        id: Ulid,
        resource: String,
        span: Span,
        source: BusySource,
    },
    BusyCleared {
        id: Ulid,
        resource: String,
    },
    QuotaLimitSet {
        requester: String,
        limit: u32,
    },
    /// Policy-period rollover for one requester, triggered by staff.
    QuotaReset {
        requester: String,
    },
    /// Exact quota record, written by WAL compaction only. Replay overwrites
    /// the requester's record with this, after all booking events applied.
    QuotaSnapshot {
        requester: String,
        limit: u32,
        committed: Vec<Ulid>,
    },
}

impl Event {
    /// The resource a scoped event belongs to, for per-resource notification
    /// channels. Global events (blackouts, quotas) have none.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Event::BookingSubmitted { booking } => Some(&booking.resource),
            Event::BookingDecided { resource, .. }
            | Event::BookingCancelled { resource, .. }
            | Event::BusyMarked { resource, .. }
            | Event::BusyCleared { resource, .. } => Some(resource),
            Event::BookingRescheduled { replacement, .. } => Some(&replacement.resource),
            Event::BlackoutAdded { .. }
            | Event::BlackoutRemoved { .. }
            | Event::QuotaLimitSet { .. }
            | Event::QuotaReset { .. }
            | Event::QuotaSnapshot { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaInfo {
    pub requester: String,
    pub used: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlackoutInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInfo {
    pub id: Ulid,
    pub resource: String,
    pub start: Ms,
    pub end: Ms,
    pub source: BusySource,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(first: Ms, count: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            resource: "t@school.edu".into(),
            requester: "s@school.edu".into(),
            first_slot: Slot::new(first),
            slot_count: count,
            location: "Online".into(),
            comment: "help".into(),
            topic: None,
            assignment_id: None,
            prep_materials: Vec::new(),
            justification: None,
            status: BookingStatus::Confirmed,
            created_at: 0,
            audit: Vec::new(),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn slot_alignment() {
        assert!(Slot::is_aligned(0));
        assert!(Slot::is_aligned(SLOT_MS));
        assert!(Slot::is_aligned(3 * SLOT_MS));
        assert!(!Slot::is_aligned(SLOT_MS + 1));
        assert_eq!(floor_slot(SLOT_MS + 1), SLOT_MS);
        assert_eq!(floor_slot(SLOT_MS), SLOT_MS);
        assert_eq!(floor_slot(SLOT_MS - 1), 0);
    }

    #[test]
    fn slot_span_covers_granularity() {
        let s = Slot::new(2 * SLOT_MS);
        assert_eq!(s.span(), Span::new(2 * SLOT_MS, 3 * SLOT_MS));
        assert_eq!(s.next().start, 3 * SLOT_MS);
        assert_eq!(s.prev().start, SLOT_MS);
    }

    #[test]
    fn booking_slot_run() {
        let b = booking(3 * SLOT_MS, 2);
        assert_eq!(b.span(), Span::new(3 * SLOT_MS, 5 * SLOT_MS));
        let slots: Vec<Ms> = b.slots().map(|s| s.start).collect();
        assert_eq!(slots, vec![3 * SLOT_MS, 4 * SLOT_MS]);
    }

    #[test]
    fn status_terminality() {
        assert!(!BookingStatus::PendingApproval.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Declined.is_terminal());
        assert!(BookingStatus::Rescheduled.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_blocking() {
        assert!(BookingStatus::PendingApproval.blocks_slots());
        assert!(BookingStatus::Confirmed.blocks_slots());
        assert!(!BookingStatus::Cancelled.blocks_slots());
        assert!(!BookingStatus::Declined.blocks_slots());
        assert!(!BookingStatus::Rescheduled.blocks_slots());
    }

    #[test]
    fn status_normalizes_legacy_tags() {
        assert_eq!(BookingStatus::parse("Yes"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("Approved"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("No"), Some(BookingStatus::Declined));
        assert_eq!(BookingStatus::parse("Reschedule"), Some(BookingStatus::Rescheduled));
        assert_eq!(BookingStatus::parse("pending"), Some(BookingStatus::PendingApproval));
        assert_eq!(BookingStatus::parse("confirmed"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("maybe"), None);
        assert_eq!(BookingStatus::parse(""), None);
    }

    #[test]
    fn entry_ordering() {
        let mut rs = ResourceSchedule::new("lab-1".into());
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(300, 400),
            kind: EntryKind::Booking,
        });
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(100, 200),
            kind: EntryKind::Busy { source: BusySource::Manual },
        });
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(200, 300),
            kind: EntryKind::Booking,
        });
        assert_eq!(rs.entries[0].span.start, 100);
        assert_eq!(rs.entries[1].span.start, 200);
        assert_eq!(rs.entries[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut rs = ResourceSchedule::new("lab-1".into());
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(100, 200),
            kind: EntryKind::Booking,
        });
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(450, 600),
            kind: EntryKind::Booking,
        });
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(1000, 1100),
            kind: EntryKind::Booking,
        });

        let query = Span::new(500, 800);
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Entry ending exactly at query.start is NOT overlapping (half-open)
        let mut rs = ResourceSchedule::new("lab-1".into());
        rs.insert_entry(ScheduleEntry {
            id: Ulid::new(),
            span: Span::new(100, 200),
            kind: EntryKind::Booking,
        });
        let query = Span::new(200, 300);
        assert!(rs.overlapping(&query).next().is_none());
    }

    #[test]
    fn remove_entry_preserves_order() {
        let mut rs = ResourceSchedule::new("lab-1".into());
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, &id) in ids.iter().enumerate() {
            rs.insert_entry(ScheduleEntry {
                id,
                span: Span::new((i as Ms) * 100, (i as Ms) * 100 + 50),
                kind: EntryKind::Booking,
            });
        }
        rs.remove_entry(ids[1]);
        assert_eq!(rs.entries.len(), 2);
        assert_eq!(rs.entries[0].id, ids[0]);
        assert_eq!(rs.entries[1].id, ids[2]);
        assert!(rs.remove_entry(Ulid::new()).is_none());
    }

    #[test]
    fn event_resource_scoping() {
        let b = booking(0, 1);
        let e = Event::BookingSubmitted { booking: b.clone() };
        assert_eq!(e.resource(), Some("t@school.edu"));
        let e = Event::BlackoutAdded {
            id: Ulid::new(),
            span: Span::new(0, 100),
        };
        assert_eq!(e.resource(), None);
        let e = Event::QuotaReset { requester: "s@school.edu".into() };
        assert_eq!(e.resource(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingSubmitted { booking: booking(6 * SLOT_MS, 3) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
