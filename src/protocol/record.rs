//! Glucose record decoding.
//!
//! The meter reports readings as 16-byte bit-packed blocks. Only the
//! first six bytes carry encoded fields; the remainder is padding on
//! the wire.

use chrono::{DateTime, FixedOffset, TimeZone};

/// Size of one record block on the wire.
pub const RECORD_SIZE: usize = 16;

/// Meal-relative timing annotation on a glucose reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MealMarker {
    /// Reading taken before a meal (0).
    BeforeMeal = 0,
    /// Reading taken after a meal (1).
    AfterMeal = 1,
    /// Reading not associated with a meal (2).
    #[default]
    NoMeal = 2,
    /// Night-time reading (3).
    MoonMeal = 3,
    /// Reading taken at bedtime (4).
    BedtimeMeal = 4,
    /// Reading taken around exercise (5).
    SportMeal = 5,
    /// Reading taken on waking up (6).
    WakeupMeal = 6,
    /// Marker code outside the meter's enumeration.
    Unknown = 7,
}

impl MealMarker {
    /// Create from the raw 3-bit marker code.
    ///
    /// Codes 7 and above are not defined by the meter and map to
    /// [`MealMarker::Unknown`].
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::BeforeMeal,
            1 => Self::AfterMeal,
            2 => Self::NoMeal,
            3 => Self::MoonMeal,
            4 => Self::BedtimeMeal,
            5 => Self::SportMeal,
            6 => Self::WakeupMeal,
            _ => Self::Unknown,
        }
    }

    /// Human-readable label; blank for [`MealMarker::Unknown`].
    pub fn label(&self) -> &'static str {
        match self {
            Self::BeforeMeal => "Before Meal",
            Self::AfterMeal => "After Meal",
            Self::NoMeal => "No Meal",
            Self::MoonMeal => "Moon Meal",
            Self::BedtimeMeal => "BedTime Meal",
            Self::SportMeal => "Sport Meal",
            Self::WakeupMeal => "Wakeup Meal",
            Self::Unknown => "",
        }
    }
}

impl std::fmt::Display for MealMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Timezone annotation on a glucose reading.
///
/// The meter encodes the timezone as a 0-24 code around a midpoint of
/// 12: code 12 is UTC, lower codes are east of UTC, higher codes are
/// west. The hour offset is `12 - code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimezoneOffset {
    code: u8,
}

impl TimezoneOffset {
    /// Code of the UTC midpoint.
    pub const UTC_CODE: u8 = 12;

    /// Create from the raw wire code.
    pub fn from_raw(code: u8) -> Self {
        Self { code }
    }

    /// The raw wire code.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Signed hour offset from UTC.
    pub fn hours(&self) -> i8 {
        Self::UTC_CODE as i8 - self.code as i8
    }
}

impl std::fmt::Display for TimezoneOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hours = self.hours();
        if hours >= 0 {
            write!(f, "+{}", hours)
        } else {
            write!(f, "-{}", -hours)
        }
    }
}

impl Default for TimezoneOffset {
    fn default() -> Self {
        Self::from_raw(Self::UTC_CODE)
    }
}

/// One decoded blood-glucose reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlucoseRecord {
    /// Absolute calendar year.
    pub year: u16,
    /// Month of year (1-12 for well-formed input).
    pub month: u8,
    /// Day of month (1-31 for well-formed input).
    pub day: u8,
    /// Hour of day (0-23 for well-formed input).
    pub hour: u8,
    /// Minute of hour (0-59 for well-formed input).
    pub minute: u8,
    /// Glucose value in device units.
    pub glucose_value: u16,
    /// Timezone the reading was taken in.
    pub timezone: TimezoneOffset,
    /// Meal-relative timing annotation.
    pub meal_marker: MealMarker,
}

impl GlucoseRecord {
    /// Number of leading record bytes that carry encoded fields.
    pub const ENCODED_FIELD_BYTES: usize = 6;

    /// Decode a 16-byte record block.
    ///
    /// Decoding is pure bit-masking and always succeeds; feeding an
    /// malformed block yields a record with possibly nonsensical
    /// field values rather than an error. Callers that need validated
    /// calendar fields can use [`GlucoseRecord::timestamp`].
    pub fn decode(block: &[u8; RECORD_SIZE]) -> Self {
        let year = (u16::from(block[3] & 0x7F)) + 2000;
        let month = ((block[1] & 0xC0) >> 4) + ((block[0] & 0xC0) >> 6) + 1;
        let day = (block[0] & 0x1F) + 1;
        let hour = block[1] & 0x1F;
        let minute = block[2] & 0x3F;
        let glucose_value = (u16::from(block[4] & 0x03) << 8) + u16::from(block[5]);
        let timezone_code =
            ((block[1] & 0x20) >> 5) + ((block[2] & 0xC0) >> 5) + ((block[4] & 0xC0) >> 3);
        let marker_code = (block[4] & 0x38) >> 3;

        Self {
            year,
            month,
            day,
            hour,
            minute,
            glucose_value,
            timezone: TimezoneOffset::from_raw(timezone_code),
            meal_marker: MealMarker::from_raw(marker_code),
        }
    }

    /// Build a timestamp from the record's calendar fields and
    /// timezone.
    ///
    /// Returns `None` when the decoded fields do not form a real
    /// calendar date or time (possible for malformed wire input).
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(i32::from(self.timezone.hours()) * 3600)?;
        offset
            .with_ymd_and_hms(
                i32::from(self.year),
                u32::from(self.month),
                u32::from(self.day),
                u32::from(self.hour),
                u32::from(self.minute),
                0,
            )
            .single()
    }
}

impl std::fmt::Display for GlucoseRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Glucose:{} ({}/{}/{} {}:{:02} GMT {})",
            self.meal_marker,
            self.glucose_value,
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.timezone
        )
    }
}
