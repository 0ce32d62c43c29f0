mod error;
mod lifecycle;
mod queries;
mod validate;
#[cfg(test)]
mod tests;

pub use error::{EngineError, Entity, Rejection};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::calendar::{hours_between, Calendar};
use crate::clock::Clock;
use crate::model::*;
use crate::store::{Store, StoreError};

/// One engine behind one lock: every SQL statement holds it for the whole
/// sweep → validate → persist sequence.
pub type SharedEngine = Arc<Mutex<Engine>>;

/// Booking rules over a persisted snapshot.
///
/// The live snapshot is kept in memory. Mutations are applied to a working
/// copy, the copy is saved in full, and only then does it replace the live
/// snapshot; a failed save therefore leaves nothing half-applied.
pub struct Engine {
    snapshot: Snapshot,
    store: Box<dyn Store>,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
}

impl Engine {
    /// Load the snapshot from `store`, seeding the default labs when the
    /// medium is empty. Opening over existing data leaves it untouched.
    pub fn open(
        mut store: Box<dyn Store>,
        clock: Arc<dyn Clock>,
        calendar: Calendar,
    ) -> Result<Self, EngineError> {
        let snapshot = match store.load()? {
            Some(snapshot) => {
                if let Some((kind, id)) = snapshot.inverted_span() {
                    return Err(StoreError::Invalid(format!("{kind} {id} ends before it starts")).into());
                }
                info!(
                    "loaded snapshot: {} labs, {} reservations, {} blocks, last id {}",
                    snapshot.labs.len(),
                    snapshot.reservations.len(),
                    snapshot.blocks.len(),
                    snapshot.last_id
                );
                snapshot
            }
            None => {
                let snapshot = Snapshot::seeded();
                store.save(&snapshot)?;
                info!("initialized empty store with {} seed labs", snapshot.labs.len());
                snapshot
            }
        };
        Ok(Self {
            snapshot,
            store,
            clock,
            calendar,
        })
    }

    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Read-only view of the live state.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Apply `f` to a copy of the snapshot, persist the copy, then adopt it.
    pub(super) fn commit<T>(&mut self, f: impl FnOnce(&mut Snapshot) -> T) -> Result<T, EngineError> {
        let mut working = self.snapshot.clone();
        let out = f(&mut working);

        let save_start = Instant::now();
        let saved = self.store.save(&working);
        metrics::histogram!(crate::observability::STORE_SAVE_DURATION_SECONDS)
            .record(save_start.elapsed().as_secs_f64());
        if let Err(e) = saved {
            metrics::counter!(crate::observability::STORE_ERRORS_TOTAL).increment(1);
            warn!("snapshot save failed, mutation discarded: {e}");
            return Err(e.into());
        }

        self.snapshot = working;
        Ok(out)
    }

    /// Flip stale pending reservations to `expired`, persisting right away if
    /// anything changed. Runs ahead of every status-dependent operation.
    pub(super) fn sweep(&mut self, now: Timestamp) -> Result<usize, EngineError> {
        let expired = validate::collect_expired(&self.snapshot, now);
        if expired.is_empty() {
            return Ok(0);
        }
        self.commit(|snap| {
            for id in &expired {
                if let Some(r) = snap.reservation_mut(*id) {
                    r.status = ReservationStatus::Expired;
                }
            }
        })?;
        for id in &expired {
            if let Some(r) = self.snapshot.reservation(*id) {
                info!(
                    "expired reservation {id} after {}h pending",
                    hours_between(now, r.created_at)
                );
            }
        }
        metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL)
            .increment(expired.len() as u64);
        Ok(expired.len())
    }

    pub(super) fn find_reservation(&self, id: Id) -> Result<&Reservation, EngineError> {
        self.snapshot
            .reservation(id)
            .ok_or(EngineError::NotFound(Entity::Reservation, id))
    }
}
