use chrono::{FixedOffset, Local, Offset, Utc};
use thiserror::Error;

use crate::model::{DAY_MS, HOUR_MS, MINUTE_MS, Ms};

pub const MAX_RESERVATION_HOURS: &str = "MAX_RESERVATION_HOURS";
pub const MIN_ADVANCE_BOOKING_MINUTES: &str = "MIN_ADVANCE_BOOKING_MINUTES";
pub const BUFFER_TIME_MINUTES: &str = "BUFFER_TIME_MINUTES";
pub const BUSINESS_HOURS_START: &str = "BUSINESS_HOURS_START";
pub const BUSINESS_HOURS_END: &str = "BUSINESS_HOURS_END";
pub const MAX_ADVANCE_BOOKING_DAYS: &str = "MAX_ADVANCE_BOOKING_DAYS";
pub const ENFORCE_BUSINESS_HOURS: &str = "ENFORCE_BUSINESS_HOURS";
pub const UTC_OFFSET_MINUTES: &str = "UTC_OFFSET_MINUTES";
pub const BUFFER_AVAILABILITY_SLOTS: &str = "BUFFER_AVAILABILITY_SLOTS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("business hours start ({start}) must be before end ({end})")]
    BusinessHoursInverted { start: u32, end: u32 },
    #[error("business hours end ({0}) must be at most 24")]
    BusinessHoursOutOfRange(u32),
    #[error("maximum reservation duration must be at least one hour")]
    ZeroDuration,
    #[error("utc offset of {0} minutes is out of range")]
    BadOffset(i32),
}

/// Scheduling thresholds. Handed to the engine at construction; validation
/// never reads the environment itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    pub max_duration_hours: u32,
    pub min_advance_minutes: u32,
    pub buffer_minutes: u32,
    pub business_start: u32,
    pub business_end: u32,
    /// 0 = unlimited.
    pub max_advance_days: u32,
    pub enforce_business_hours: bool,
    /// Offset used to read wall-clock hours.
    pub utc_offset: FixedOffset,
    /// Shrink reported free slots by the buffer next to each reservation.
    pub buffer_slots: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_duration_hours: 8,
            min_advance_minutes: 15,
            buffer_minutes: 15,
            business_start: 8,
            business_end: 20,
            max_advance_days: 90,
            enforce_business_hours: true,
            utc_offset: Utc.fix(),
            buffer_slots: false,
        }
    }
}

impl SchedulingConfig {
    /// Read thresholds from the process environment. Missing offsets fall
    /// back to the host's local offset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let int = |key: &str, default: u32| -> u32 {
            match lookup(key) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, default, "unparseable setting, using default");
                    default
                }),
            }
        };

        let utc_offset = match lookup(UTC_OFFSET_MINUTES).map(|raw| raw.trim().parse::<i32>()) {
            Some(Ok(minutes)) => minutes
                .checked_mul(60)
                .and_then(FixedOffset::east_opt)
                .ok_or(ConfigError::BadOffset(minutes))?,
            Some(Err(_)) | None => Local::now().offset().fix(),
        };

        let config = Self {
            max_duration_hours: int(MAX_RESERVATION_HOURS, defaults.max_duration_hours),
            min_advance_minutes: int(MIN_ADVANCE_BOOKING_MINUTES, defaults.min_advance_minutes),
            buffer_minutes: int(BUFFER_TIME_MINUTES, defaults.buffer_minutes),
            business_start: int(BUSINESS_HOURS_START, defaults.business_start),
            business_end: int(BUSINESS_HOURS_END, defaults.business_end),
            max_advance_days: int(MAX_ADVANCE_BOOKING_DAYS, defaults.max_advance_days),
            // Anything but the literal "false" keeps enforcement on.
            enforce_business_hours: lookup(ENFORCE_BUSINESS_HOURS).as_deref() != Some("false"),
            utc_offset,
            buffer_slots: lookup(BUFFER_AVAILABILITY_SLOTS).as_deref() == Some("true"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.business_end > 24 {
            return Err(ConfigError::BusinessHoursOutOfRange(self.business_end));
        }
        if self.business_start >= self.business_end {
            return Err(ConfigError::BusinessHoursInverted {
                start: self.business_start,
                end: self.business_end,
            });
        }
        if self.max_duration_hours == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(())
    }

    pub fn buffer_ms(&self) -> Ms {
        Ms::from(self.buffer_minutes) * MINUTE_MS
    }

    pub fn min_advance_ms(&self) -> Ms {
        Ms::from(self.min_advance_minutes) * MINUTE_MS
    }

    pub fn max_duration_ms(&self) -> Ms {
        Ms::from(self.max_duration_hours) * HOUR_MS
    }

    /// `None` when the horizon is unlimited.
    pub fn max_advance_ms(&self) -> Option<Ms> {
        (self.max_advance_days > 0).then(|| Ms::from(self.max_advance_days) * DAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = SchedulingConfig::from_lookup(lookup_from(&[(UTC_OFFSET_MINUTES, "0")])).unwrap();
        assert_eq!(config, SchedulingConfig::default());
        assert_eq!(config.buffer_ms(), 15 * MINUTE_MS);
        assert_eq!(config.max_duration_ms(), 8 * HOUR_MS);
        assert_eq!(config.max_advance_ms(), Some(90 * DAY_MS));
    }

    #[test]
    fn reads_overrides() {
        let config = SchedulingConfig::from_lookup(lookup_from(&[
            (MAX_RESERVATION_HOURS, "4"),
            (MIN_ADVANCE_BOOKING_MINUTES, "30"),
            (BUFFER_TIME_MINUTES, "5"),
            (BUSINESS_HOURS_START, "7"),
            (BUSINESS_HOURS_END, "22"),
            (MAX_ADVANCE_BOOKING_DAYS, "0"),
            (UTC_OFFSET_MINUTES, "120"),
            (BUFFER_AVAILABILITY_SLOTS, "true"),
        ]))
        .unwrap();
        assert_eq!(config.max_duration_hours, 4);
        assert_eq!(config.min_advance_minutes, 30);
        assert_eq!(config.buffer_minutes, 5);
        assert_eq!(config.business_start, 7);
        assert_eq!(config.business_end, 22);
        assert_eq!(config.max_advance_ms(), None);
        assert_eq!(config.utc_offset.local_minus_utc(), 7200);
        assert!(config.buffer_slots);
    }

    #[test]
    fn enforcement_only_disabled_by_literal_false() {
        for (raw, expected) in [("false", false), ("FALSE", true), ("0", true), ("no", true), ("true", true)] {
            let config = SchedulingConfig::from_lookup(lookup_from(&[
                (ENFORCE_BUSINESS_HOURS, raw),
                (UTC_OFFSET_MINUTES, "0"),
            ]))
            .unwrap();
            assert_eq!(config.enforce_business_hours, expected, "value {raw:?}");
        }
    }

    #[test]
    fn garbage_integer_falls_back_to_default() {
        let config = SchedulingConfig::from_lookup(lookup_from(&[
            (BUFFER_TIME_MINUTES, "ten"),
            (UTC_OFFSET_MINUTES, "0"),
        ]))
        .unwrap();
        assert_eq!(config.buffer_minutes, 15);
    }

    #[test]
    fn inverted_business_hours_rejected() {
        let err = SchedulingConfig::from_lookup(lookup_from(&[
            (BUSINESS_HOURS_START, "18"),
            (BUSINESS_HOURS_END, "9"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::BusinessHoursInverted { start: 18, end: 9 });
    }

    #[test]
    fn business_end_past_midnight_rejected() {
        let err = SchedulingConfig::from_lookup(lookup_from(&[(BUSINESS_HOURS_END, "25")])).unwrap_err();
        assert_eq!(err, ConfigError::BusinessHoursOutOfRange(25));
    }

    #[test]
    fn offset_out_of_range_rejected() {
        for minutes in [i32::MAX, i32::MIN, 24 * 60] {
            let raw = minutes.to_string();
            let err = SchedulingConfig::from_lookup(lookup_from(&[(UTC_OFFSET_MINUTES, raw.as_str())])).unwrap_err();
            assert_eq!(err, ConfigError::BadOffset(minutes));
        }
        let config = SchedulingConfig::from_lookup(lookup_from(&[(UTC_OFFSET_MINUTES, "-300")])).unwrap();
        assert_eq!(config.utc_offset.local_minus_utc(), -300 * 60);
    }
}
