use chrono::{Duration, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::validate::slot_state;
use super::{Engine, EngineError, Entity};

impl Engine {
    pub fn list_labs(&self) -> Vec<Lab> {
        self.snapshot.labs.clone()
    }

    pub fn get_lab(&self, id: Id) -> Result<Lab, EngineError> {
        self.snapshot
            .lab(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Lab, id))
    }

    /// Reservations matching every set field of `filter`, in creation order.
    pub fn list_reservations(
        &mut self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        Ok(self
            .snapshot
            .reservations
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    pub fn get_reservation(&mut self, id: Id) -> Result<Reservation, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        self.find_reservation(id).cloned()
    }

    pub fn list_blocks(&self, lab_id: Option<Id>) -> Vec<Block> {
        self.snapshot
            .blocks
            .iter()
            .filter(|b| lab_id.is_none_or(|id| id == b.lab_id))
            .cloned()
            .collect()
    }

    /// Half-hour grid for one lab-local day, 08:00 through the 21:30 slot.
    /// Weekends have no slots.
    pub fn day_slots(&mut self, lab_id: Id, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let now = self.now();
        self.sweep(now)?;
        if self.snapshot.lab(lab_id).is_none() {
            return Err(EngineError::NotFound(Entity::Lab, lab_id));
        }

        let Some(noon) = self.calendar.at(date, 12, 0) else {
            return Ok(Vec::new());
        };
        if !self.calendar.is_business_day(noon) {
            return Ok(Vec::new());
        }

        let slot_len = Duration::minutes(i64::from(SLOT_MINUTES));
        let slots = (SLOT_DAY_START_HOUR..SLOT_DAY_END_HOUR)
            .flat_map(|hour| (0..60).step_by(SLOT_MINUTES as usize).map(move |minute| (hour, minute)))
            .filter_map(|(hour, minute)| self.calendar.at(date, hour, minute))
            .map(|start| Slot {
                start,
                end: start + slot_len,
                state: slot_state(&self.snapshot, lab_id, start),
            })
            .collect();
        Ok(slots)
    }
}
