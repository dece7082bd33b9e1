use chrono::NaiveDate;

use crate::model::*;

use super::conflict::validate_range;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_day(&self, property_id: PropertyId, date: NaiveDate) -> Option<CalendarDay> {
        let cal = self.get_calendar(property_id)?;
        let guard = cal.read().await;
        guard.get(&date).cloned()
    }

    /// Every night of `range` in order. Nights never written come back open.
    pub async fn days_in_range(
        &self,
        property_id: PropertyId,
        range: DateRange,
    ) -> Result<Vec<CalendarDay>, EngineError> {
        validate_range(&range)?;
        let Some(cal) = self.get_calendar(property_id) else {
            return Ok(range
                .iter()
                .map(|date| CalendarDay::open(property_id, date))
                .collect());
        };
        let guard = cal.read().await;
        Ok(range
            .iter()
            .map(|date| {
                guard
                    .get(&date)
                    .cloned()
                    .unwrap_or_else(|| CalendarDay::open(property_id, date))
            })
            .collect())
    }

    /// True when no night of `range` is blocked.
    pub async fn is_available(
        &self,
        property_id: PropertyId,
        range: DateRange,
    ) -> Result<bool, EngineError> {
        validate_range(&range)?;
        let Some(cal) = self.get_calendar(property_id) else {
            return Ok(true);
        };
        let guard = cal.read().await;
        Ok(!guard.in_range(&range).any(CalendarDay::is_blocked))
    }
}
