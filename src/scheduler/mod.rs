mod availability;
mod blackout;
mod error;
mod ops;
mod queries;
mod quota;

pub use availability::{blocked_slots, check_no_conflict, free_slots, is_available};
pub use blackout::BlackoutRegistry;
pub use error::SchedulingError;
pub use quota::{QuotaDecision, QuotaTracker, DEFAULT_QUOTA_LIMIT};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotificationDispatcher, NotifyHub};
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<ResourceSchedule>>;

/// Variant behavior from the predecessor system, surfaced as configuration
/// rather than code forks.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub default_quota_limit: u32,
    /// When set, a submission must attach at least one prep material.
    pub require_prep_materials: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_quota_limit: DEFAULT_QUOTA_LIMIT,
            require_prep_materials: false,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The availability & booking scheduler for one school: the single authority
/// over bookings, quotas, blackouts, and the per-resource availability index.
pub struct Scheduler {
    /// Per-resource availability index, keyed by teacher email or room id.
    pub(super) schedules: DashMap<String, SharedSchedule>,
    /// System of record: every booking ever accepted, terminal ones included.
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) quotas: QuotaTracker,
    pub(super) blackouts: BlackoutRegistry,
    /// Reverse lookup: busy-period id → resource, for clears by id.
    pub(super) busy_index: DashMap<Ulid, String>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) dispatcher: Arc<dyn NotificationDispatcher>,
    pub(super) config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: SchedulerConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let scheduler = Self {
            schedules: DashMap::new(),
            bookings: DashMap::new(),
            quotas: QuotaTracker::new(config.default_quota_limit),
            blackouts: BlackoutRegistry::new(),
            busy_index: DashMap::new(),
            wal_tx,
            notify,
            dispatcher,
            config,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (lazy school
        // creation happens on a connection task).
        for event in &events {
            scheduler.replay_event(event);
        }

        Ok(scheduler)
    }

    /// Get or lazily create the schedule handle for a resource. No limit
    /// check here; callers on the mutation path enforce MAX_RESOURCES_PER_SCHOOL.
    pub(super) fn schedule_handle(&self, resource: &str) -> SharedSchedule {
        self.schedules
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceSchedule::new(resource.to_string()))))
            .value()
            .clone()
    }

    pub fn get_schedule(&self, resource: &str) -> Option<SharedSchedule> {
        self.schedules.get(resource).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer. A full
    /// queue is write-path congestion (retryable); a closed queue means the
    /// writer is gone.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .try_send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => SchedulingError::Contention,
                TrySendError::Closed(_) => {
                    SchedulingError::DependencyUnavailable("WAL writer shut down".into())
                }
            })?;
        rx.await
            .map_err(|_| SchedulingError::DependencyUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::DependencyUnavailable(e.to_string()))
    }

    /// Publish a committed event on its resource channel, if it has one.
    pub(super) fn publish(&self, event: &Event) {
        if let Some(resource) = event.resource() {
            self.notify.send(resource, event);
        }
    }

    // ── State transitions ────────────────────────────────────────
    //
    // These helpers are the only code that touches the bookings map and the
    // schedule entry list together. Both the live operations and WAL replay
    // go through them, so the two paths cannot drift.

    /// Insert an accepted booking: record plus, while it holds slots, an
    /// availability-index entry.
    pub(super) fn record_booking(&self, rs: &mut ResourceSchedule, booking: &Booking) {
        if booking.status.blocks_slots() {
            rs.insert_entry(ScheduleEntry {
                id: booking.id,
                span: booking.span(),
                kind: EntryKind::Booking,
            });
        }
        self.bookings.insert(booking.id, booking.clone());
    }

    /// Move a booking to a terminal state: audit, status, and index entry.
    pub(super) fn finalize_booking(
        &self,
        rs: &mut ResourceSchedule,
        id: Ulid,
        status: BookingStatus,
        actor: &str,
        action: &str,
        at: Ms,
    ) {
        debug_assert!(status.is_terminal());
        rs.remove_entry(id);
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = status;
            b.audit.push(AuditEntry::new(actor, action, at));
        }
    }

    /// Approve a pending booking in place. The index entry stays: a pending
    /// booking already held its slots.
    pub(super) fn approve_booking(&self, id: Ulid, actor: &str, at: Ms) {
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = BookingStatus::Confirmed;
            b.audit.push(AuditEntry::new(actor, "approved", at));
        }
    }

    pub(super) fn record_busy(&self, rs: &mut ResourceSchedule, id: Ulid, span: Span, source: BusySource) {
        rs.insert_entry(ScheduleEntry {
            id,
            span,
            kind: EntryKind::Busy { source },
        });
        self.busy_index.insert(id, rs.resource.clone());
    }

    pub(super) fn erase_busy(&self, rs: &mut ResourceSchedule, id: Ulid) {
        rs.remove_entry(id);
        self.busy_index.remove(&id);
    }

    /// Apply one replayed event. Uncontended by construction (startup only).
    fn replay_event(&self, event: &Event) {
        match event {
            Event::BookingSubmitted { booking } => {
                let rs = self.schedule_handle(&booking.resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                self.record_booking(&mut guard, booking);
                if booking.status == BookingStatus::Confirmed {
                    self.quotas.commit(&booking.requester, booking.id);
                }
            }
            Event::BookingDecided {
                id,
                resource,
                approved,
                actor,
                at,
            } => {
                let rs = self.schedule_handle(resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                if *approved {
                    self.approve_booking(*id, actor, *at);
                    if let Some(b) = self.bookings.get(id) {
                        self.quotas.commit(&b.requester, *id);
                    }
                } else {
                    self.finalize_booking(&mut guard, *id, BookingStatus::Declined, actor, "declined", *at);
                }
            }
            Event::BookingCancelled { id, resource, actor, at } => {
                let rs = self.schedule_handle(resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                let requester = self.bookings.get(id).map(|b| b.requester.clone());
                self.finalize_booking(&mut guard, *id, BookingStatus::Cancelled, actor, "cancelled", *at);
                if let Some(requester) = requester {
                    self.quotas.release(&requester, *id);
                }
            }
            Event::BookingRescheduled {
                old_id,
                replacement,
                reason: _,
                actor,
                at,
            } => {
                let old_resource = self.bookings.get(old_id).map(|b| b.resource.clone());
                if let Some(old_resource) = old_resource {
                    let rs = self.schedule_handle(&old_resource);
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    self.finalize_booking(
                        &mut guard,
                        *old_id,
                        BookingStatus::Rescheduled,
                        actor,
                        &format!("rescheduled_to:{}", replacement.id),
                        *at,
                    );
                }
                let rs = self.schedule_handle(&replacement.resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                self.record_booking(&mut guard, replacement);
                self.quotas.transfer(&replacement.requester, *old_id, replacement.id);
            }
            Event::BlackoutAdded { id, span } => {
                self.blackouts.insert(*id, *span);
            }
            Event::BlackoutRemoved { id } => {
                self.blackouts.remove(*id);
            }
            Event::BusyMarked { id, resource, span, source } => {
                let rs = self.schedule_handle(resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                self.record_busy(&mut guard, *id, *span, *source);
            }
            Event::BusyCleared { id, resource } => {
                let rs = self.schedule_handle(resource);
                let mut guard = rs.try_write().expect("replay: uncontended write");
                self.erase_busy(&mut guard, *id);
            }
            Event::QuotaLimitSet { requester, limit } => {
                self.quotas.set_limit(requester, *limit);
            }
            Event::QuotaReset { requester } => {
                self.quotas.reset(requester);
            }
            Event::QuotaSnapshot { requester, limit, committed } => {
                self.quotas.restore(requester, *limit, committed.clone());
            }
        }
    }

    /// Pending approvals whose run has already started. Approval after the
    /// fact is meaningless, so the reaper declines these.
    pub fn collect_lapsed_approvals(&self, now: Ms) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|e| {
                e.value().status == BookingStatus::PendingApproval && e.value().span().start <= now
            })
            .map(|e| *e.key())
            .collect()
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: every booking record (current status),
    /// busy periods, blackouts, then exact quota snapshots last so replay
    /// lands on the precise committed sets.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let mut events = Vec::new();

        for entry in self.bookings.iter() {
            events.push(Event::BookingSubmitted {
                booking: entry.value().clone(),
            });
        }

        // Snapshot the handle list first; never await while holding a
        // dashmap shard.
        let handles: Vec<SharedSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        for rs in handles {
            let guard = rs.read().await;
            for e in &guard.entries {
                if let EntryKind::Busy { source } = e.kind {
                    events.push(Event::BusyMarked {
                        id: e.id,
                        resource: guard.resource.clone(),
                        span: e.span,
                        source,
                    });
                }
            }
        }

        for b in self.blackouts.list() {
            events.push(Event::BlackoutAdded {
                id: b.id,
                span: Span::new(b.start, b.end),
            });
        }

        for (requester, limit, committed) in self.quotas.snapshot() {
            events.push(Event::QuotaSnapshot { requester, limit, committed });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulingError::DependencyUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::DependencyUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::DependencyUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
