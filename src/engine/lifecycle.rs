use tracing::{debug, info};

use crate::calendar::days_between;
use crate::model::*;

use super::validate::{check_block, check_cancel_notice, check_denial_reason, check_reservation};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Validate and store a new `pending` reservation.
    pub fn create_reservation(&mut self, input: NewReservation) -> Result<Reservation, EngineError> {
        let now = self.now();
        self.sweep(now)?;

        let checked = check_reservation(&self.snapshot, &input, now, &self.calendar)
            .inspect_err(|e| record_rejection("create", e))?;

        let reservation = self.commit(|snap| {
            let r = Reservation {
                id: snap.next_id(),
                lab_id: checked.lab_id,
                requester_name: input.requester_name.trim().to_string(),
                phone: input.phone.clone(),
                start_time: checked.span.start,
                end_time: checked.span.end,
                duration_minutes: checked.duration_minutes,
                course: non_blank(input.course),
                section: non_blank(input.section),
                note: non_blank(input.note),
                status: ReservationStatus::Pending,
                created_at: now,
                denial_reason: None,
            };
            snap.reservations.push(r.clone());
            r
        })?;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} requested on lab {} for {} ({} min, starts in {} days)",
            reservation.id,
            reservation.lab_id,
            reservation.start_time,
            reservation.duration_minutes,
            days_between(reservation.start_time, now)
        );
        Ok(reservation)
    }

    pub fn approve_reservation(&mut self, id: Id) -> Result<Reservation, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        let current = self.find_reservation(id)?;
        if current.status != ReservationStatus::Pending {
            return Err(invalid_state(current, "approve"));
        }
        self.set_status(id, ReservationStatus::Approved, None)
    }

    pub fn deny_reservation(&mut self, id: Id, reason: &str) -> Result<Reservation, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        let current = self.find_reservation(id)?;
        if current.status != ReservationStatus::Pending {
            return Err(invalid_state(current, "deny"));
        }
        let reason = check_denial_reason(reason)
            .map_err(EngineError::from)
            .inspect_err(|e| record_rejection("deny", e))?;
        self.set_status(id, ReservationStatus::Denied, Some(reason))
    }

    /// Pending or approved reservations can be cancelled with enough notice.
    pub fn cancel_reservation(&mut self, id: Id) -> Result<Reservation, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        let current = self.find_reservation(id)?;
        if !current.status.is_active() {
            return Err(invalid_state(current, "cancel"));
        }
        check_cancel_notice(current.start_time, now)
            .map_err(EngineError::from)
            .inspect_err(|e| record_rejection("cancel", e))?;
        self.set_status(id, ReservationStatus::Cancelled, None)
    }

    pub fn add_block(&mut self, input: NewBlock) -> Result<Block, EngineError> {
        let now = self.now();
        self.sweep(now)?;

        let (lab_id, span) =
            check_block(&self.snapshot, &input).inspect_err(|e| record_rejection("add_block", e))?;

        let block = self.commit(|snap| {
            let b = Block {
                id: snap.next_id(),
                lab_id,
                start_time: span.start,
                end_time: span.end,
                reason: input.reason.trim().to_string(),
            };
            snap.blocks.push(b.clone());
            b
        })?;

        info!(
            "block {} added on lab {}: {} .. {} ({})",
            block.id, block.lab_id, block.start_time, block.end_time, block.reason
        );
        Ok(block)
    }

    /// Unconditional once the block exists.
    pub fn remove_block(&mut self, id: Id) -> Result<Block, EngineError> {
        let pos = self
            .snapshot
            .blocks
            .iter()
            .position(|b| b.id == id)
            .ok_or(EngineError::NotFound(Entity::Block, id))?;
        let removed = self.commit(|snap| snap.blocks.remove(pos))?;
        info!("block {id} removed from lab {}", removed.lab_id);
        Ok(removed)
    }

    /// Drop everything and go back to the seeded labs. Ids restart too.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.commit(|snap| *snap = Snapshot::seeded())?;
        info!("store reset to seed state");
        Ok(())
    }

    fn set_status(
        &mut self,
        id: Id,
        status: ReservationStatus,
        denial_reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let updated = self.commit(|snap| {
            snap.reservation_mut(id).map(|r| {
                r.status = status;
                r.denial_reason = denial_reason;
                r.clone()
            })
        })?;
        let updated = updated.ok_or(EngineError::NotFound(Entity::Reservation, id))?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => status.as_str())
            .increment(1);
        info!("reservation {id} is now {status}");
        Ok(updated)
    }
}

fn invalid_state(r: &Reservation, action: &'static str) -> EngineError {
    EngineError::InvalidState {
        id: r.id,
        status: r.status,
        action,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn record_rejection(op: &'static str, e: &EngineError) {
    if let EngineError::Validation(r) = e {
        metrics::counter!(
            crate::observability::REJECTIONS_TOTAL,
            "op" => op,
            "rule" => r.label()
        )
        .increment(1);
    }
    debug!("{op} rejected: {e}");
}
