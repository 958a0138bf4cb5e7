mod conflict;
mod error;
mod inventory;
mod maintenance;
mod profiles;
mod queries;
mod reservations;

pub use error::EngineError;
pub use reservations::{CancelOutcome, LineRequest};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::{self, Action, Principal};
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

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

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
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

// ── Item lock discipline ─────────────────────────────────

/// Write locks over a set of items, always acquired in sorted id order so
/// multi-item operations cannot deadlock each other. A guard set is held
/// across conflict-check + WAL append + apply — the advisory lock that makes
/// booking race-free.
pub(super) struct ItemGuards {
    map: HashMap<Ulid, OwnedRwLockWriteGuard<ItemState>>,
}

impl ItemGuards {
    /// For events that touch no item state (categories, profiles).
    pub(super) fn none() -> Self {
        Self { map: HashMap::new() }
    }

    /// Lock all `ids`; fails with NotFound on the first missing item.
    pub(super) async fn lock(
        engine: &Engine,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<Self, EngineError> {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut map = HashMap::with_capacity(ids.len());
        for id in ids {
            let state = engine
                .get_item_state(&id)
                .ok_or(EngineError::NotFound(id))?;
            map.insert(id, state.write_owned().await);
        }
        Ok(Self { map })
    }

    /// Like `lock`, but skips items that no longer exist — historical
    /// reservations may reference deleted inventory.
    pub(super) async fn lock_existing(engine: &Engine, ids: impl IntoIterator<Item = Ulid>) -> Self {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut map = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = engine.get_item_state(&id) {
                map.insert(id, state.write_owned().await);
            }
        }
        Self { map }
    }

    /// Replay-only variant — the engine is sole owner during replay, so
    /// try_write always succeeds instantly. Never blocks inside an async
    /// context.
    fn lock_uncontended(engine: &Engine, ids: impl IntoIterator<Item = Ulid>) -> Self {
        let mut map = HashMap::new();
        for id in ids {
            if let Some(state) = engine.get_item_state(&id) {
                let guard = state
                    .try_write_owned()
                    .expect("replay: uncontended write");
                map.insert(id, guard);
            }
        }
        Self { map }
    }

    pub(super) fn get(&self, id: Ulid) -> Option<&ItemState> {
        self.map.get(&id).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, id: Ulid) -> Option<&mut ItemState> {
        self.map.get_mut(&id).map(|g| &mut **g)
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) items: DashMap<Ulid, SharedItemState>,
    pub(super) categories: DashMap<Ulid, Category>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) maintenance: DashMap<Ulid, Maintenance>,
    pub(super) profiles: DashMap<Ulid, Profile>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            items: DashMap::new(),
            categories: DashMap::new(),
            reservations: DashMap::new(),
            maintenance: DashMap::new(),
            profiles: DashMap::new(),
            wal_tx,
            notify,
        };

        for event in &events {
            let ids = engine.event_item_ids(event);
            let mut guards = ItemGuards::lock_uncontended(&engine, ids);
            engine.apply_event(event, &mut guards);
        }

        Ok(engine)
    }

    pub(super) fn get_item_state(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub(super) fn authorize(&self, principal: &Principal, action: Action) -> Result<(), EngineError> {
        if policy::authorize(principal, &action) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(action.label()))
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append + apply + notify in one call. The caller holds the write
    /// locks for every item the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        guards: &mut ItemGuards,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(event, guards);
        for item_id in self.event_item_ids(event) {
            self.notify.send(item_id, event);
        }
        Ok(())
    }

    /// Items whose per-item conflict state an event touches. Status-change
    /// events resolve through their aggregate to find them.
    fn event_item_ids(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::ItemRegistered { id, .. }
            | Event::ItemUpdated { id, .. }
            | Event::ItemAvailabilityChanged { id, .. }
            | Event::ItemDeleted { id } => vec![*id],
            Event::ReservationBooked { lines, .. } => {
                lines.iter().map(|l| l.item_id).collect()
            }
            Event::ReservationStatusChanged { id, .. } => self
                .reservations
                .get(id)
                .map(|r| r.value().lines.iter().map(|l| l.item_id).collect())
                .unwrap_or_default(),
            Event::MaintenanceScheduled { item_id, .. } => vec![*item_id],
            Event::MaintenanceStatusChanged { id, .. } => self
                .maintenance
                .get(id)
                .map(|m| vec![m.value().item_id])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Apply an event to engine state. Used by both the live mutation paths
    /// and WAL replay, so the two can never drift apart.
    fn apply_event(&self, event: &Event, guards: &mut ItemGuards) {
        match event {
            Event::CategoryCreated {
                id,
                name,
                description,
                created_at,
                updated_at,
            } => {
                self.categories.insert(
                    *id,
                    Category {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                        created_at: *created_at,
                        updated_at: *updated_at,
                    },
                );
            }
            Event::CategoryUpdated {
                id,
                name,
                description,
                at,
            } => {
                if let Some(mut cat) = self.categories.get_mut(id) {
                    cat.name = name.clone();
                    cat.description = description.clone();
                    cat.updated_at = *at;
                }
            }
            Event::CategoryDeleted { id } => {
                self.categories.remove(id);
            }
            Event::ItemRegistered {
                id,
                name,
                description,
                category_id,
                daily_rate,
                condition,
                is_available,
                last_maintained,
                created_at,
                updated_at,
            } => {
                let item = Item {
                    id: *id,
                    name: name.clone(),
                    description: description.clone(),
                    category_id: *category_id,
                    daily_rate: *daily_rate,
                    condition: condition.clone(),
                    is_available: *is_available,
                    last_maintained: *last_maintained,
                    created_at: *created_at,
                    updated_at: *updated_at,
                };
                self.items
                    .insert(*id, Arc::new(RwLock::new(ItemState::new(item))));
            }
            Event::ItemUpdated {
                id,
                name,
                description,
                category_id,
                daily_rate,
                condition,
                at,
            } => {
                if let Some(state) = guards.get_mut(*id) {
                    state.item.name = name.clone();
                    state.item.description = description.clone();
                    state.item.category_id = *category_id;
                    state.item.daily_rate = *daily_rate;
                    state.item.condition = condition.clone();
                    state.item.updated_at = *at;
                }
            }
            Event::ItemAvailabilityChanged { id, available, at } => {
                if let Some(state) = guards.get_mut(*id) {
                    state.item.is_available = *available;
                    state.item.updated_at = *at;
                }
            }
            Event::ItemDeleted { id } => {
                self.items.remove(id);
                self.notify.remove(id);
            }
            Event::ProfileProvisioned {
                user_id,
                username,
                role,
                created_at,
            } => {
                self.profiles.insert(
                    *user_id,
                    Profile {
                        user_id: *user_id,
                        username: username.clone(),
                        role: *role,
                        created_at: *created_at,
                    },
                );
            }
            Event::RoleChanged { user_id, role } => {
                if let Some(mut profile) = self.profiles.get_mut(user_id) {
                    profile.role = *role;
                }
            }
            Event::ProfileDeleted { user_id } => {
                self.profiles.remove(user_id);
            }
            Event::ReservationBooked {
                id,
                customer,
                range,
                status,
                total_cost,
                lines,
                created_at,
                updated_at,
            } => {
                // Only live bookings claim calendar space.
                if *status == ReservationStatus::Active {
                    for line in lines {
                        if let Some(state) = guards.get_mut(line.item_id) {
                            state.insert_booking(BookedRange {
                                reservation_id: *id,
                                range: *range,
                            });
                        }
                    }
                }
                self.reservations.insert(
                    *id,
                    Reservation {
                        id: *id,
                        customer: *customer,
                        range: *range,
                        status: *status,
                        total_cost: *total_cost,
                        lines: lines.clone(),
                        created_at: *created_at,
                        updated_at: *updated_at,
                    },
                );
            }
            Event::ReservationStatusChanged { id, status, at } => {
                let line_items: Vec<Ulid> = match self.reservations.get_mut(id) {
                    Some(mut r) => {
                        r.status = *status;
                        r.updated_at = *at;
                        r.lines.iter().map(|l| l.item_id).collect()
                    }
                    None => Vec::new(),
                };
                match status {
                    ReservationStatus::Cancelled => {
                        for item_id in line_items {
                            if let Some(state) = guards.get_mut(item_id) {
                                state.remove_booking(*id);
                            }
                        }
                    }
                    // Return processing — the one path that restores the
                    // availability flag.
                    ReservationStatus::Completed => {
                        for item_id in line_items {
                            if let Some(state) = guards.get_mut(item_id) {
                                state.remove_booking(*id);
                                state.item.is_available = true;
                                state.item.updated_at = *at;
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::MaintenanceScheduled {
                id,
                item_id,
                staff,
                date,
                description,
                created_at,
                updated_at,
            } => {
                self.maintenance.insert(
                    *id,
                    Maintenance {
                        id: *id,
                        item_id: *item_id,
                        staff: *staff,
                        date: *date,
                        description: description.clone(),
                        status: MaintenanceStatus::Scheduled,
                        created_at: *created_at,
                        updated_at: *updated_at,
                    },
                );
                if let Some(state) = guards.get_mut(*item_id) {
                    state.insert_window(MaintenanceWindow {
                        maintenance_id: *id,
                        day: date.date_naive(),
                    });
                }
            }
            Event::MaintenanceStatusChanged { id, status, at } => {
                let item_id = match self.maintenance.get_mut(id) {
                    Some(mut m) => {
                        m.status = *status;
                        m.updated_at = *at;
                        Some(m.item_id)
                    }
                    None => None,
                };
                if status.is_terminal()
                    && let Some(item_id) = item_id
                    && let Some(state) = guards.get_mut(item_id)
                {
                    state.remove_window(*id);
                    if *status == MaintenanceStatus::Completed {
                        state.item.last_maintained = Some(*at);
                        state.item.updated_at = *at;
                    }
                }
            }
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut categories: Vec<Category> =
            self.categories.iter().map(|e| e.value().clone()).collect();
        categories.sort_by_key(|c| c.id);
        for c in categories {
            events.push(Event::CategoryCreated {
                id: c.id,
                name: c.name,
                description: c.description,
                created_at: c.created_at,
                updated_at: c.updated_at,
            });
        }

        let mut profiles: Vec<Profile> =
            self.profiles.iter().map(|e| e.value().clone()).collect();
        profiles.sort_by_key(|p| p.user_id);
        for p in profiles {
            events.push(Event::ProfileProvisioned {
                user_id: p.user_id,
                username: p.username,
                role: p.role,
                created_at: p.created_at,
            });
        }

        // Items before the aggregates that claim their calendar space.
        let states: Vec<SharedItemState> =
            self.items.iter().map(|e| e.value().clone()).collect();
        let mut items = Vec::with_capacity(states.len());
        for state in &states {
            items.push(state.read().await.item.clone());
        }
        items.sort_by_key(|i| i.id);
        for i in items {
            events.push(Event::ItemRegistered {
                id: i.id,
                name: i.name,
                description: i.description,
                category_id: i.category_id,
                daily_rate: i.daily_rate,
                condition: i.condition,
                is_available: i.is_available,
                last_maintained: i.last_maintained,
                created_at: i.created_at,
                updated_at: i.updated_at,
            });
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        for r in reservations {
            events.push(Event::ReservationBooked {
                id: r.id,
                customer: r.customer,
                range: r.range,
                status: r.status,
                total_cost: r.total_cost,
                lines: r.lines,
                created_at: r.created_at,
                updated_at: r.updated_at,
            });
        }

        let mut maintenance: Vec<Maintenance> =
            self.maintenance.iter().map(|e| e.value().clone()).collect();
        maintenance.sort_by_key(|m| m.id);
        for m in maintenance {
            events.push(Event::MaintenanceScheduled {
                id: m.id,
                item_id: m.item_id,
                staff: m.staff,
                date: m.date,
                description: m.description,
                created_at: m.created_at,
                updated_at: m.created_at,
            });
            if m.status != MaintenanceStatus::Scheduled {
                events.push(Event::MaintenanceStatusChanged {
                    id: m.id,
                    status: m.status,
                    at: m.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
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
