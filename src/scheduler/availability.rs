use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::{floor_slot, Ms, ResourceSchedule, Slot, Span};
use crate::slots::slots_between;

// ── Availability index reads ─────────────────────────────────────
//
// A blocked interval `[s, e)` occupies every aligned slot whose start lies in
// `[floor_slot(s), e)`: a partial overlap at either edge still takes the
// whole slot.

/// Slot-start range `[first, end)` blocked by an interval.
fn blocked_slot_range(span: &Span) -> (Ms, Ms) {
    (floor_slot(span.start), span.end)
}

/// Whether an entry's interval blocks any slot of `run` (the contiguous
/// slot-run interval of a request, slot-aligned at both ends).
fn blocks_run(entry_span: &Span, run: &Span) -> bool {
    let (first, end) = blocked_slot_range(entry_span);
    first < run.end && run.start < end
}

/// Every blocked slot start for a resource inside the window.
pub fn blocked_slots(schedule: &ResourceSchedule, window: &Span) -> BTreeSet<Slot> {
    // Widen the query left by one slot so an entry starting mid-slot just
    // before the window still contributes its floored first slot.
    let probe = Span::new(window.start - crate::model::SLOT_MS, window.end);
    let mut blocked = BTreeSet::new();
    for entry in schedule.overlapping(&probe) {
        let (first, end) = blocked_slot_range(&entry.span);
        let mut s = first.max(floor_slot(window.start));
        if s < window.start {
            s += crate::model::SLOT_MS;
        }
        while s < end && s < window.end {
            blocked.insert(Slot { start: s });
            s += crate::model::SLOT_MS;
        }
    }
    blocked
}

/// True iff none of `slots` is blocked on the resource.
pub fn is_available(schedule: &ResourceSchedule, slots: &[Slot]) -> bool {
    slots.iter().all(|slot| {
        let run = slot.span();
        !schedule
            .overlapping(&Span::new(run.start - crate::model::SLOT_MS, run.end))
            .any(|e| blocks_run(&e.span, &run))
    })
}

/// First entry conflicting with the request run, if any. `exclude` skips one
/// entry id: a reschedule frees its own old run, so that run must not count
/// against the replacement.
pub fn check_no_conflict(
    schedule: &ResourceSchedule,
    run: &Span,
    exclude: Option<Ulid>,
) -> Result<(), Ulid> {
    let probe = Span::new(run.start - crate::model::SLOT_MS, run.end);
    for entry in schedule.overlapping(&probe) {
        if Some(entry.id) == exclude {
            continue;
        }
        if blocks_run(&entry.span, run) {
            return Err(entry.id);
        }
    }
    Ok(())
}

/// Free aligned slots in the window: everything `slots_between` yields minus
/// the blocked set.
pub fn free_slots(schedule: &ResourceSchedule, window: &Span) -> Vec<Slot> {
    let blocked = blocked_slots(schedule, window);
    slots_between(window.start, window.end)
        .into_iter()
        .filter(|s| !blocked.contains(s))
        .collect()
}
