use chrono::NaiveDate;
use tracing::{debug, info};

use crate::model::*;

use super::conflict::{
    check_no_conflict, check_org, is_identical_block, validate_price, validate_range,
    validate_reason, validate_source,
};
use super::{Engine, EngineError};

/// What a mutation did to its range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationSummary {
    /// Nights rewritten.
    pub written: usize,
    /// Nights left untouched (already in the requested state, or held by another source).
    pub skipped: usize,
}

impl MutationSummary {
    pub fn is_noop(&self) -> bool {
        self.written == 0
    }
}

fn record_mutation(op: &'static str, result: &Result<MutationSummary, EngineError>) {
    let status = match result {
        Ok(s) if s.is_noop() => "noop",
        Ok(_) => "ok",
        Err(EngineError::Conflict { .. }) => "conflict",
        Err(EngineError::LockTimeout { .. }) => "lock_timeout",
        Err(_) => "error",
    };
    metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => op, "status" => status)
        .increment(1);
}

impl Engine {
    /// Mark `range` unavailable on behalf of `source`.
    ///
    /// All-or-nothing: if any night is held by a different source the call
    /// fails with [`EngineError::Conflict`] and writes nothing. Re-blocking
    /// nights the same source already holds with the same reason is a no-op.
    pub async fn block(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        reason_code: Option<&str>,
        reason_text: Option<&str>,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        validate_range(&range)?;
        validate_source(source)?;
        validate_reason(reason_code, reason_text)?;

        let token = self.lock_property(property_id).await?;
        let result = self
            .block_locked(property_id, range, org_id, reason_code, reason_text, source)
            .await;
        self.unlock_property(token).await;

        record_mutation("block", &result);
        result
    }

    async fn block_locked(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        reason_code: Option<&str>,
        reason_text: Option<&str>,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        let _shared = self.compaction.read().await;
        let cal = self.calendar_or_default(property_id);
        let mut guard = cal.write().await;
        check_org(&guard, org_id)?;

        if let Err(e) = check_no_conflict(&guard, &range, source) {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            info!(property_id, %range, source, "block rejected: {e}");
            return Err(e);
        }
        if is_identical_block(&guard, &range, source, reason_code, reason_text) {
            debug!(property_id, %range, source, "identical block already present");
            return Ok(MutationSummary {
                written: 0,
                skipped: range.nights() as usize,
            });
        }

        let now = now_ms();
        let days: Vec<CalendarDay> = range
            .iter()
            .map(|date| {
                let mut day = existing_or_open(&guard, property_id, date);
                day.availability = Availability::Blocked;
                day.block_source = Some(source.to_string());
                day.reason_code = reason_code.map(str::to_string);
                day.reason_text = reason_text.map(str::to_string);
                day.updated_by = source.to_string();
                day.updated_at = now;
                day
            })
            .collect();
        let written = days.len();

        self.persist_and_apply(
            &mut guard,
            LedgerEvent::DaysWritten {
                property_id,
                org_id,
                days,
            },
        )
        .await?;
        drop(guard);

        self.signal_change(property_id, org_id, range, source);
        Ok(MutationSummary { written, skipped: 0 })
    }

    /// Reopen the nights of `range` held by `source`.
    ///
    /// Nights already open are a no-op; nights held by another source are
    /// left blocked and counted as skipped.
    pub async fn unblock(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        validate_range(&range)?;
        validate_source(source)?;

        let token = self.lock_property(property_id).await?;
        let result = self.unblock_locked(property_id, range, org_id, source).await;
        self.unlock_property(token).await;

        record_mutation("unblock", &result);
        result
    }

    async fn unblock_locked(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        let _shared = self.compaction.read().await;
        let cal = self.calendar_or_default(property_id);
        let mut guard = cal.write().await;
        check_org(&guard, org_id)?;

        let now = now_ms();
        let mut skipped = 0usize;
        let mut days = Vec::new();
        for day in guard.in_range(&range) {
            if !day.is_blocked() {
                continue;
            }
            if day.block_source.as_deref() != Some(source) {
                skipped += 1;
                continue;
            }
            let mut day = day.clone();
            day.availability = Availability::Open;
            day.block_source = None;
            day.reason_code = None;
            day.reason_text = None;
            day.updated_by = source.to_string();
            day.updated_at = now;
            days.push(day);
        }

        if skipped > 0 {
            info!(property_id, %range, source, skipped, "unblock left nights held by other sources");
        }
        if days.is_empty() {
            return Ok(MutationSummary { written: 0, skipped });
        }

        let written = days.len();
        self.persist_and_apply(
            &mut guard,
            LedgerEvent::DaysWritten {
                property_id,
                org_id,
                days,
            },
        )
        .await?;
        drop(guard);

        self.signal_change(property_id, org_id, range, source);
        Ok(MutationSummary { written, skipped })
    }

    /// Set the nightly price for every night of `range`. Availability is untouched.
    pub async fn update_price(
        &self,
        property_id: PropertyId,
        range: DateRange,
        price: Price,
        org_id: OrgId,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        validate_range(&range)?;
        validate_source(source)?;
        validate_price(&price)?;

        let token = self.lock_property(property_id).await?;
        let result = self
            .rewrite_locked(property_id, range, org_id, source, |day| {
                if day.price.as_ref() == Some(&price) {
                    return false;
                }
                day.price = Some(price.clone());
                true
            })
            .await;
        self.unlock_property(token).await;

        record_mutation("update_price", &result);
        result
    }

    /// Set min/max stay restrictions for every night of `range`.
    pub async fn update_restrictions(
        &self,
        property_id: PropertyId,
        range: DateRange,
        min_stay: Option<u32>,
        max_stay: Option<u32>,
        org_id: OrgId,
        source: &str,
    ) -> Result<MutationSummary, EngineError> {
        validate_range(&range)?;
        validate_source(source)?;
        if let (Some(min), Some(max)) = (min_stay, max_stay)
            && min > max
        {
            return Err(EngineError::Validation(format!(
                "min stay {min} exceeds max stay {max}"
            )));
        }

        let token = self.lock_property(property_id).await?;
        let result = self
            .rewrite_locked(property_id, range, org_id, source, |day| {
                if day.min_stay == min_stay && day.max_stay == max_stay {
                    return false;
                }
                day.min_stay = min_stay;
                day.max_stay = max_stay;
                true
            })
            .await;
        self.unlock_property(token).await;

        record_mutation("update_restrictions", &result);
        result
    }

    /// Apply `edit` to every night of the range; `edit` returns whether it changed the night.
    async fn rewrite_locked<F>(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        source: &str,
        mut edit: F,
    ) -> Result<MutationSummary, EngineError>
    where
        F: FnMut(&mut CalendarDay) -> bool,
    {
        let _shared = self.compaction.read().await;
        let cal = self.calendar_or_default(property_id);
        let mut guard = cal.write().await;
        check_org(&guard, org_id)?;

        let now = now_ms();
        let mut skipped = 0usize;
        let mut days = Vec::new();
        for date in range.iter() {
            let mut day = existing_or_open(&guard, property_id, date);
            if !edit(&mut day) {
                skipped += 1;
                continue;
            }
            day.updated_by = source.to_string();
            day.updated_at = now;
            days.push(day);
        }
        if days.is_empty() {
            return Ok(MutationSummary { written: 0, skipped });
        }

        let written = days.len();
        self.persist_and_apply(
            &mut guard,
            LedgerEvent::DaysWritten {
                property_id,
                org_id,
                days,
            },
        )
        .await?;
        drop(guard);

        self.signal_change(property_id, org_id, range, source);
        Ok(MutationSummary { written, skipped })
    }

    fn signal_change(&self, property_id: PropertyId, org_id: OrgId, range: DateRange, source: &str) {
        self.notify.send(&CalendarChanged {
            property_id,
            org_id,
            range,
            source: source.to_string(),
        });
    }
}

fn existing_or_open(cal: &PropertyCalendar, property_id: PropertyId, date: NaiveDate) -> CalendarDay {
    cal.get(&date)
        .cloned()
        .unwrap_or_else(|| CalendarDay::open(property_id, date))
}
