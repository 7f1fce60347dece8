use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_slots;
use super::{Scheduler, SchedulingError};

impl Scheduler {
    pub fn booking(&self, id: Ulid) -> Option<Booking> {
        self.bookings.get(&id).map(|b| b.clone())
    }

    /// All bookings addressed to a resource, oldest slot first.
    pub fn bookings_for_resource(&self, resource: &str) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().resource == resource)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.first_slot, b.id));
        out
    }

    /// All bookings submitted by a requester, oldest slot first.
    pub fn bookings_for_requester(&self, requester: &str) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().requester == requester)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.first_slot, b.id));
        out
    }

    /// One requester's quota record; default-initialized view if absent.
    pub fn quota(&self, requester: &str) -> QuotaInfo {
        self.quotas.get(requester)
    }

    /// Every materialized quota record, for the staff dashboard.
    pub fn all_quotas(&self) -> Vec<QuotaInfo> {
        self.quotas.all()
    }

    pub fn list_blackouts(&self) -> Vec<BlackoutInfo> {
        self.blackouts.list()
    }

    /// Busy periods (calendar sync + manual blocks) on a resource.
    pub async fn busy_for_resource(&self, resource: &str) -> Vec<BusyInfo> {
        let Some(rs) = self.get_schedule(resource) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .entries
            .iter()
            .filter_map(|e| match e.kind {
                EntryKind::Busy { source } => Some(BusyInfo {
                    id: e.id,
                    resource: resource.to_string(),
                    start: e.span.start,
                    end: e.span.end,
                    source,
                }),
                EntryKind::Booking => None,
            })
            .collect()
    }

    /// Free aligned slots for a resource in the window. A resource nobody
    /// has booked or blocked yet is fully free.
    pub async fn availability(
        &self,
        resource: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Slot>, SchedulingError> {
        if end <= start {
            return Err(SchedulingError::InvalidRequest("window end must be after start"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(SchedulingError::InvalidRequest("query window too wide"));
        }
        let window = Span::new(start, end);
        match self.get_schedule(resource) {
            Some(rs) => {
                let guard = rs.read().await;
                Ok(free_slots(&guard, &window))
            }
            None => Ok(crate::slots::slots_between(start, end)),
        }
    }

    /// Slots currently blocked for a resource in the window.
    pub async fn blocked(
        &self,
        resource: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Slot>, SchedulingError> {
        if end <= start {
            return Err(SchedulingError::InvalidRequest("window end must be after start"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(SchedulingError::InvalidRequest("query window too wide"));
        }
        let window = Span::new(start, end);
        match self.get_schedule(resource) {
            Some(rs) => {
                let guard = rs.read().await;
                Ok(super::availability::blocked_slots(&guard, &window)
                    .into_iter()
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }
}
