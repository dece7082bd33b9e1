use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.from >= range.to {
        return Err(EngineError::Validation(format!(
            "range {range} is empty or inverted"
        )));
    }
    if range.nights() > MAX_RANGE_NIGHTS {
        return Err(EngineError::Validation(format!(
            "range {range} spans more than {MAX_RANGE_NIGHTS} nights"
        )));
    }
    Ok(())
}

pub(crate) fn validate_source(source: &str) -> Result<(), EngineError> {
    if source.trim().is_empty() {
        return Err(EngineError::Validation("source label is empty".into()));
    }
    if source.len() > MAX_SOURCE_LABEL_LEN {
        return Err(EngineError::Validation("source label too long".into()));
    }
    Ok(())
}

pub(crate) fn validate_reason(code: Option<&str>, text: Option<&str>) -> Result<(), EngineError> {
    let too_long = |s: Option<&str>| s.is_some_and(|s| s.len() > MAX_REASON_LEN);
    if too_long(code) || too_long(text) {
        return Err(EngineError::Validation("reason too long".into()));
    }
    Ok(())
}

pub(crate) fn validate_price(price: &Price) -> Result<(), EngineError> {
    if price.amount_minor < 0 {
        return Err(EngineError::Validation("price must not be negative".into()));
    }
    if price.currency.len() != 3 || !price.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(EngineError::Validation(format!(
            "currency {:?} is not an ISO 4217 code",
            price.currency
        )));
    }
    Ok(())
}

/// A property belongs to the organization of its first write.
pub(crate) fn check_org(cal: &PropertyCalendar, org_id: OrgId) -> Result<(), EngineError> {
    match cal.org_id {
        Some(owner) if owner != org_id => Err(EngineError::Validation(format!(
            "property {} belongs to org {owner}, not {org_id}",
            cal.property_id
        ))),
        _ => Ok(()),
    }
}

/// Fail if any night in `range` is blocked by a source other than `source`.
pub(crate) fn check_no_conflict(
    cal: &PropertyCalendar,
    range: &DateRange,
    source: &str,
) -> Result<(), EngineError> {
    let mut holder: Option<&str> = None;
    let mut dates = Vec::new();
    for day in cal.in_range(range) {
        if !day.is_blocked() {
            continue;
        }
        let held_by = day.block_source.as_deref().unwrap_or("UNKNOWN");
        if held_by != source {
            holder.get_or_insert(held_by);
            dates.push(day.date);
        }
    }
    match holder {
        Some(holder) => Err(EngineError::Conflict {
            property_id: cal.property_id,
            holder: holder.to_string(),
            dates,
        }),
        None => Ok(()),
    }
}

/// True when every night of `range` is already blocked by `source` with the same reason.
pub(crate) fn is_identical_block(
    cal: &PropertyCalendar,
    range: &DateRange,
    source: &str,
    reason_code: Option<&str>,
    reason_text: Option<&str>,
) -> bool {
    range.iter().all(|date| {
        cal.get(&date).is_some_and(|day| {
            day.is_blocked()
                && day.block_source.as_deref() == Some(source)
                && day.reason_code.as_deref() == reason_code
                && day.reason_text.as_deref() == reason_text
        })
    })
}
