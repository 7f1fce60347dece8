use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::slots::is_contiguous;

use super::availability::check_no_conflict;
use super::quota::QuotaDecision;
use super::{Scheduler, SchedulingError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Ms
}

/// Interval covered by a validated contiguous slot run.
fn run_span(slots: &[Slot]) -> Span {
    Span::new(slots[0].start, slots[slots.len() - 1].end())
}

/// Shape checks shared by submit and reschedule: non-empty, aligned,
/// contiguous, in the future, within range limits.
fn validate_slot_run(slots: &[Slot], now: Ms) -> Result<(), SchedulingError> {
    if slots.is_empty() {
        return Err(SchedulingError::InvalidRequest("booking needs at least one slot"));
    }
    if slots.len() > MAX_SLOTS_PER_BOOKING {
        return Err(SchedulingError::InvalidRequest("too many slots in one booking"));
    }
    if slots.iter().any(|s| !Slot::is_aligned(s.start)) {
        return Err(SchedulingError::InvalidRequest(
            "slots must be aligned to the 20-minute grid",
        ));
    }
    if !is_contiguous(slots) {
        return Err(SchedulingError::InvalidRequest("slots must be consecutive"));
    }
    if slots[0].start < now {
        return Err(SchedulingError::InvalidRequest("slots must not be in the past"));
    }
    if slots[0].start < MIN_VALID_TIMESTAMP_MS
        || slots[slots.len() - 1].end() > MAX_VALID_TIMESTAMP_MS
    {
        return Err(SchedulingError::InvalidRequest("timestamp out of range"));
    }
    Ok(())
}

fn validate_identifier(value: &str, what: &'static str) -> Result<(), SchedulingError> {
    if value.is_empty() {
        return Err(SchedulingError::InvalidRequest(what));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(SchedulingError::InvalidRequest("identifier too long"));
    }
    Ok(())
}

fn validate_span_input(start: Ms, end: Ms) -> Result<Span, SchedulingError> {
    if end <= start {
        return Err(SchedulingError::InvalidRequest("period end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulingError::InvalidRequest("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(SchedulingError::InvalidRequest("period too wide"));
    }
    Ok(Span::new(start, end))
}

impl Scheduler {
    fn validate_request(&self, req: &BookingRequest, now: Ms) -> Result<(), SchedulingError> {
        validate_identifier(&req.resource, "resource must not be empty")?;
        validate_identifier(&req.requester, "requester must not be empty")?;
        validate_slot_run(&req.slots, now)?;
        if req.location.is_empty() {
            return Err(SchedulingError::InvalidRequest("location must not be empty"));
        }
        if req.location.len() > MAX_LOCATION_LEN {
            return Err(SchedulingError::InvalidRequest("location too long"));
        }
        if req.comment.is_empty() {
            return Err(SchedulingError::InvalidRequest("comment must not be empty"));
        }
        if req.comment.len() > MAX_COMMENT_LEN {
            return Err(SchedulingError::InvalidRequest("comment too long"));
        }
        if req.topic.as_ref().is_some_and(|t| t.len() > MAX_TOPIC_LEN) {
            return Err(SchedulingError::InvalidRequest("topic too long"));
        }
        if req
            .assignment_id
            .as_ref()
            .is_some_and(|a| a.len() > MAX_IDENTIFIER_LEN)
        {
            return Err(SchedulingError::InvalidRequest("assignment id too long"));
        }
        if req.prep_materials.len() > MAX_PREP_MATERIALS {
            return Err(SchedulingError::InvalidRequest("too many prep materials"));
        }
        if req.prep_materials.iter().any(|u| u.len() > MAX_PREP_URL_LEN) {
            return Err(SchedulingError::InvalidRequest("prep material url too long"));
        }
        if self.config.require_prep_materials && req.prep_materials.is_empty() {
            return Err(SchedulingError::InvalidRequest("prep materials required"));
        }
        if req
            .justification
            .as_ref()
            .is_some_and(|j| j.len() > MAX_REASON_LEN)
        {
            return Err(SchedulingError::InvalidRequest("justification too long"));
        }
        Ok(())
    }

    fn check_resource_capacity(&self, resource: &str) -> Result<(), SchedulingError> {
        if self.schedules.len() >= MAX_RESOURCES_PER_SCHOOL && !self.schedules.contains_key(resource)
        {
            return Err(SchedulingError::InvalidRequest("too many resources"));
        }
        Ok(())
    }

    fn send_notification(&self, kind: NotificationKind, booking: &Booking, recipient: &str) {
        let span = booking.span();
        let payload = serde_json::json!({
            "booking": booking.id.to_string(),
            "resource": booking.resource,
            "requester": booking.requester,
            "start": span.start,
            "end": span.end,
            "location": booking.location,
            "status": booking.status.as_str(),
        });
        self.dispatcher.dispatch(Notification {
            kind,
            booking_id: booking.id,
            resource: booking.resource.clone(),
            recipient: recipient.to_string(),
            payload,
        });
    }

    /// Accept a booking request: validate shape, blackout, availability and
    /// quota in that order, then persist and commit atomically under the
    /// resource's write lock. Over-quota requests with a justification come
    /// back as `pending_approval` instead of `confirmed`.
    pub async fn submit(&self, request: BookingRequest) -> Result<Booking, SchedulingError> {
        let now = now_ms();
        self.validate_request(&request, now)?;
        self.check_resource_capacity(&request.resource)?;

        let rs = self.schedule_handle(&request.resource);
        let mut guard = rs.write().await;
        if guard.entries.len() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(SchedulingError::InvalidRequest("resource schedule is full"));
        }

        if let Some(blackout_id) = self.blackouts.covering(&request.slots) {
            return Err(SchedulingError::BlackoutConflict(blackout_id));
        }

        let run = run_span(&request.slots);
        check_no_conflict(&guard, &run, None).map_err(SchedulingError::SlotUnavailable)?;

        let status = match self.quotas.reserve(&request.requester) {
            QuotaDecision::WithinLimit => BookingStatus::Confirmed,
            QuotaDecision::RequiresJustification => match &request.justification {
                Some(j) if !j.trim().is_empty() => BookingStatus::PendingApproval,
                _ => {
                    let q = self.quotas.get(&request.requester);
                    return Err(SchedulingError::QuotaExceeded {
                        used: q.used,
                        limit: q.limit,
                    });
                }
            },
        };

        let audit = vec![AuditEntry::new(request.requester.clone(), "created", now)];
        let booking = Booking {
            id: Ulid::new(),
            resource: request.resource,
            requester: request.requester,
            first_slot: request.slots[0],
            slot_count: request.slots.len() as u32,
            location: request.location,
            comment: request.comment,
            topic: request.topic,
            assignment_id: request.assignment_id,
            prep_materials: request.prep_materials,
            justification: request.justification,
            status,
            created_at: now,
            audit,
        };

        let event = Event::BookingSubmitted {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.record_booking(&mut guard, &booking);
        if status == BookingStatus::Confirmed {
            self.quotas.commit(&booking.requester, booking.id);
        }
        self.publish(&event);
        drop(guard);

        // The resource (teacher or lab owner) is told about the new booking.
        self.send_notification(NotificationKind::BookingCreated, &booking, &booking.resource);
        Ok(booking)
    }

    /// Approve or decline a pending booking. Approval commits the quota that
    /// submission deferred; declining frees the held slots without counting.
    pub async fn decide(
        &self,
        id: Ulid,
        approve: bool,
        actor: &str,
    ) -> Result<Booking, SchedulingError> {
        validate_identifier(actor, "actor must not be empty")?;
        let resource = self
            .bookings
            .get(&id)
            .map(|b| b.resource.clone())
            .ok_or(SchedulingError::NotFound(id))?;
        let rs = self.schedule_handle(&resource);
        let mut guard = rs.write().await;

        // Re-read under the lock: another writer may have raced us here.
        let (status, requester) = self
            .bookings
            .get(&id)
            .map(|b| (b.status, b.requester.clone()))
            .ok_or(SchedulingError::NotFound(id))?;
        if status != BookingStatus::PendingApproval {
            return Err(SchedulingError::InvalidState(status));
        }

        let now = now_ms();
        let event = Event::BookingDecided {
            id,
            resource: resource.clone(),
            approved: approve,
            actor: actor.to_string(),
            at: now,
        };
        self.wal_append(&event).await?;
        if approve {
            self.approve_booking(id, actor, now);
            self.quotas.commit(&requester, id);
        } else {
            self.finalize_booking(&mut guard, id, BookingStatus::Declined, actor, "declined", now);
        }
        self.publish(&event);
        drop(guard);

        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(SchedulingError::NotFound(id))?;
        self.send_notification(NotificationKind::ApprovalDecided, &booking, &requester);
        Ok(booking)
    }

    /// Cancel a live booking: frees its slots, releases its quota count, and
    /// appends the acting identity to the audit trail. A terminal booking is
    /// reported as not found.
    pub async fn cancel(&self, id: Ulid, actor: &str) -> Result<(), SchedulingError> {
        validate_identifier(actor, "actor must not be empty")?;
        let (resource, requester) = self
            .bookings
            .get(&id)
            .map(|b| (b.resource.clone(), b.requester.clone()))
            .ok_or(SchedulingError::NotFound(id))?;
        let rs = self.schedule_handle(&resource);
        let mut guard = rs.write().await;

        let status = self
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(SchedulingError::NotFound(id))?;
        if status.is_terminal() {
            return Err(SchedulingError::NotFound(id));
        }

        let now = now_ms();
        let event = Event::BookingCancelled {
            id,
            resource: resource.clone(),
            actor: actor.to_string(),
            at: now,
        };
        self.wal_append(&event).await?;
        self.finalize_booking(&mut guard, id, BookingStatus::Cancelled, actor, "cancelled", now);
        self.quotas.release(&requester, id);
        self.publish(&event);
        drop(guard);

        if let Some(booking) = self.bookings.get(&id).map(|b| b.clone()) {
            // Tell the party that didn't act.
            let recipient = if actor == requester { &resource } else { &requester };
            self.send_notification(NotificationKind::BookingCancelled, &booking, recipient);
        }
        Ok(())
    }

    /// Move a confirmed booking to new slots (optionally on a new resource).
    /// The old record becomes terminal `rescheduled`; a replacement is
    /// created `confirmed` with the quota count transferred, never repeated.
    pub async fn reschedule(
        &self,
        id: Ulid,
        new_slots: Vec<Slot>,
        new_resource: Option<String>,
        reason: &str,
        actor: &str,
    ) -> Result<Booking, SchedulingError> {
        let now = now_ms();
        validate_identifier(actor, "actor must not be empty")?;
        validate_slot_run(&new_slots, now)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(SchedulingError::InvalidRequest("reason too long"));
        }

        let old = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(SchedulingError::NotFound(id))?;
        let target = match new_resource {
            Some(r) => {
                validate_identifier(&r, "resource must not be empty")?;
                r
            }
            None => old.resource.clone(),
        };
        self.check_resource_capacity(&target)?;

        // Acquire write locks in name order to prevent deadlocks when the
        // booking moves between resources.
        let same_resource = target == old.resource;
        let old_rs = self.schedule_handle(&old.resource);
        let (mut old_guard, mut target_guard) = if same_resource {
            (old_rs.write_owned().await, None)
        } else {
            let target_rs = self.schedule_handle(&target);
            if old.resource < target {
                let og = old_rs.write_owned().await;
                let tg = target_rs.write_owned().await;
                (og, Some(tg))
            } else {
                let tg = target_rs.write_owned().await;
                let og = old_rs.write_owned().await;
                (og, Some(tg))
            }
        };

        // Re-read under the locks.
        let status = self
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(SchedulingError::NotFound(id))?;
        if status != BookingStatus::Confirmed {
            return Err(SchedulingError::InvalidState(status));
        }

        if let Some(blackout_id) = self.blackouts.covering(&new_slots) {
            return Err(SchedulingError::BlackoutConflict(blackout_id));
        }

        let run = run_span(&new_slots);
        {
            let (schedule, exclude) = match &target_guard {
                Some(tg) => (&**tg, None),
                // Same resource: the old run is about to be freed, so it
                // must not conflict with its own replacement.
                None => (&*old_guard, Some(id)),
            };
            check_no_conflict(schedule, &run, exclude).map_err(SchedulingError::SlotUnavailable)?;
            if schedule.entries.len() >= MAX_ENTRIES_PER_RESOURCE {
                return Err(SchedulingError::InvalidRequest("resource schedule is full"));
            }
        }

        let replacement = Booking {
            id: Ulid::new(),
            resource: target,
            requester: old.requester.clone(),
            first_slot: new_slots[0],
            slot_count: new_slots.len() as u32,
            location: old.location.clone(),
            comment: old.comment.clone(),
            topic: old.topic.clone(),
            assignment_id: old.assignment_id.clone(),
            prep_materials: old.prep_materials.clone(),
            justification: None,
            status: BookingStatus::Confirmed,
            created_at: now,
            audit: vec![AuditEntry::new(actor, format!("rescheduled_from:{id}"), now)],
        };

        let event = Event::BookingRescheduled {
            old_id: id,
            replacement: replacement.clone(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            at: now,
        };
        self.wal_append(&event).await?;
        self.finalize_booking(
            &mut old_guard,
            id,
            BookingStatus::Rescheduled,
            actor,
            &format!("rescheduled_to:{}", replacement.id),
            now,
        );
        match target_guard.as_mut() {
            Some(tg) => self.record_booking(tg, &replacement),
            None => self.record_booking(&mut old_guard, &replacement),
        }
        self.quotas.transfer(&old.requester, id, replacement.id);
        self.publish(&event);
        drop(target_guard);
        drop(old_guard);

        self.send_notification(NotificationKind::BookingRescheduled, &replacement, &old.requester);
        Ok(replacement)
    }

    // ── Staff mutations ──────────────────────────────────────────

    /// Open an institution-wide blackout window.
    pub async fn add_blackout(&self, start: Ms, end: Ms) -> Result<BlackoutInfo, SchedulingError> {
        let span = validate_span_input(start, end)?;
        if self.blackouts.len() >= MAX_BLACKOUTS {
            return Err(SchedulingError::InvalidRequest("too many blackout periods"));
        }
        let id = Ulid::new();
        self.wal_append(&Event::BlackoutAdded { id, span }).await?;
        self.blackouts.insert(id, span);
        Ok(BlackoutInfo { id, start, end })
    }

    /// Idempotent: removing an unknown blackout id is a no-op success.
    pub async fn remove_blackout(&self, id: Ulid) -> Result<(), SchedulingError> {
        if !self.blackouts.contains(id) {
            return Ok(());
        }
        self.wal_append(&Event::BlackoutRemoved { id }).await?;
        self.blackouts.remove(id);
        Ok(())
    }

    /// Record an externally-synced busy period or a manual block on a
    /// resource. Busy periods may overlap anything: they are observed
    /// truth, not requests.
    pub async fn mark_busy(
        &self,
        resource: &str,
        start: Ms,
        end: Ms,
        source: BusySource,
    ) -> Result<BusyInfo, SchedulingError> {
        validate_identifier(resource, "resource must not be empty")?;
        let span = validate_span_input(start, end)?;
        self.check_resource_capacity(resource)?;

        let rs = self.schedule_handle(resource);
        let mut guard = rs.write().await;
        if guard.entries.len() >= MAX_ENTRIES_PER_RESOURCE {
            return Err(SchedulingError::InvalidRequest("resource schedule is full"));
        }

        let id = Ulid::new();
        let event = Event::BusyMarked {
            id,
            resource: resource.to_string(),
            span,
            source,
        };
        self.wal_append(&event).await?;
        self.record_busy(&mut guard, id, span, source);
        self.publish(&event);
        Ok(BusyInfo {
            id,
            resource: resource.to_string(),
            start,
            end,
            source,
        })
    }

    /// Idempotent: clearing an unknown busy id is a no-op success (calendar
    /// sync retries deletes).
    pub async fn clear_busy(&self, id: Ulid) -> Result<(), SchedulingError> {
        let resource = match self.busy_index.get(&id) {
            Some(r) => r.value().clone(),
            None => return Ok(()),
        };
        let rs = self.schedule_handle(&resource);
        let mut guard = rs.write().await;
        if !self.busy_index.contains_key(&id) {
            return Ok(()); // lost the race to another clear
        }
        let event = Event::BusyCleared {
            id,
            resource: resource.clone(),
        };
        self.wal_append(&event).await?;
        self.erase_busy(&mut guard, id);
        self.publish(&event);
        Ok(())
    }

    /// Staff override of a requester's booking limit.
    pub async fn set_quota_limit(
        &self,
        requester: &str,
        limit: u32,
    ) -> Result<QuotaInfo, SchedulingError> {
        validate_identifier(requester, "requester must not be empty")?;
        if limit > MAX_QUOTA_LIMIT {
            return Err(SchedulingError::InvalidRequest("quota limit too large"));
        }
        self.wal_append(&Event::QuotaLimitSet {
            requester: requester.to_string(),
            limit,
        })
        .await?;
        self.quotas.set_limit(requester, limit);
        Ok(self.quotas.get(requester))
    }

    /// Policy-period rollover for one requester.
    pub async fn reset_quota(&self, requester: &str) -> Result<QuotaInfo, SchedulingError> {
        validate_identifier(requester, "requester must not be empty")?;
        self.wal_append(&Event::QuotaReset {
            requester: requester.to_string(),
        })
        .await?;
        self.quotas.reset(requester);
        Ok(self.quotas.get(requester))
    }
}
