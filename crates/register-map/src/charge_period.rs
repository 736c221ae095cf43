use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use value_codec::encode_time;

use crate::MapError;

/// First register of the two `[enable, start, end]` charge period blocks.
pub const CHARGE_PERIOD_ADDRESS: u16 = 41_001;
pub const MAX_CHARGE_PERIODS: usize = 2;

/// A daily window during which the battery may charge. A period whose start
/// equals its end is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargePeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub enable_charge_from_grid: bool,
}

impl ChargePeriod {
    pub fn disabled() -> Self {
        Self {
            start: NaiveTime::default(),
            end: NaiveTime::default(),
            enable_charge_from_grid: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.start != self.end
    }
}

/// Encodes up to two periods into the contiguous register block starting at
/// [`CHARGE_PERIOD_ADDRESS`]. Missing periods are written as disabled.
pub fn charge_period_words(periods: &[ChargePeriod]) -> Result<(u16, Vec<u16>), MapError> {
    if periods.len() > MAX_CHARGE_PERIODS {
        return Err(MapError::TooManyChargePeriods {
            max: MAX_CHARGE_PERIODS,
            actual: periods.len(),
        });
    }

    let mut words = Vec::with_capacity(MAX_CHARGE_PERIODS * 3);
    for index in 0..MAX_CHARGE_PERIODS {
        let period = periods.get(index).copied().unwrap_or_else(ChargePeriod::disabled);
        validate(index, &period)?;
        words.push(u16::from(period.enable_charge_from_grid));
        words.push(encode_time(&period.start));
        words.push(encode_time(&period.end));
    }

    Ok((CHARGE_PERIOD_ADDRESS, words))
}

fn validate(index: usize, period: &ChargePeriod) -> Result<(), MapError> {
    let invalid = |reason| MapError::InvalidChargePeriod { index, reason };
    let whole_minutes = |time: &NaiveTime| time.second() == 0 && time.nanosecond() == 0;
    if !whole_minutes(&period.start) || !whole_minutes(&period.end) {
        return Err(invalid("times must be whole minutes"));
    }
    if period.start > period.end {
        return Err(invalid("start must not be after end"));
    }
    if !period.is_enabled() && period.enable_charge_from_grid {
        return Err(invalid("a disabled period cannot charge from grid"));
    }
    Ok(())
}
