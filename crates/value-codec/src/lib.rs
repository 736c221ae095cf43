use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;
use tracing::trace;
use types::{RegisterType, Value};

/// Bit number to flag name.
pub type BitTable = &'static [(u8, &'static str)];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataType {
    U16,
    I16,
    /// Two registers, high word first.
    U32,
    I32,
    /// `[year, month << 8 | day]`.
    U32Date,
    /// `hour << 8 | minute`.
    TimeOfDay,
    /// Three registers of BCD bytes: `[yy, MM] [dd, hh] [mm, ss]`, year offset from 2000.
    DateTime,
    Bitfield(BitTable),
    /// One character per register.
    Ascii(u16),
}

impl DataType {
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 | DataType::TimeOfDay | DataType::Bitfield(_) => 1,
            DataType::U32 | DataType::I32 | DataType::U32Date => 2,
            DataType::DateTime => 3,
            DataType::Ascii(len) => *len,
        }
    }
}

/// Check applied to a decoded value before it is published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validation {
    Range(f64, f64),
    Min(f64),
    Max(f64),
    /// Packed `hour << 8 | minute` must be a real time of day.
    Time,
}

impl Validation {
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Validation::Time, Value::Time(_)) => true,
            (Validation::Time, Value::Integer(raw)) => {
                (0..=0xFFFF).contains(raw) && (raw >> 8) < 24 && (raw & 0xFF) < 60
            }
            (Validation::Time, _) => false,
            (validation, value) => match value.as_f64() {
                Some(v) => match validation {
                    Validation::Range(min, max) => v >= *min && v <= *max,
                    Validation::Min(min) => v >= *min,
                    Validation::Max(max) => v <= *max,
                    Validation::Time => false,
                },
                None => false,
            },
        }
    }
}

/// A named value at a concrete register address.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    pub name: &'static str,
    pub address: u16,
    pub register_type: RegisterType,
    pub data_type: DataType,
    pub scale: f64,
    pub unit: Option<&'static str>,
    pub validation: Option<Validation>,
    pub writable: bool,
}

impl RegisterEntry {
    pub fn new(name: &'static str, address: u16, register_type: RegisterType, data_type: DataType) -> Self {
        Self {
            name,
            address,
            register_type,
            data_type,
            scale: 1.0,
            unit: None,
            validation: None,
            writable: false,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_validation(mut self, validation: Validation) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn register_count(&self) -> u16 {
        self.data_type.register_count()
    }

    /// Last register address covered by this entry.
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.register_count()) - 1
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected {expected} registers, got {actual}")]
    Length { expected: u16, actual: usize },
    #[error("invalid date/time: {0}")]
    InvalidDateTime(String),
    #[error("invalid time of day 0x{0:04x}")]
    InvalidTime(u16),
    #[error("value {value} for {name} failed validation")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("value {0} cannot be represented at this register's scale")]
    Precision(String),
    #[error("value {0} does not fit the register width")]
    OutOfRange(String),
    #[error("expected a {0} value")]
    TypeMismatch(&'static str),
    #[error("unknown flag {0}")]
    UnknownFlag(String),
    #[error("{0} values cannot be written")]
    Unsupported(&'static str),
}

/// Converts raw register words into a typed value.
///
/// Scaling is applied for the integer types; the entry's validation, if any,
/// runs last so an implausible reading is reported instead of published.
pub fn decode(raw: &[u16], entry: &RegisterEntry) -> Result<Value, DecodeError> {
    let expected = entry.register_count();
    if raw.len() != usize::from(expected) {
        return Err(DecodeError::Length {
            expected,
            actual: raw.len(),
        });
    }

    let value = match entry.data_type {
        DataType::U16 => scaled(i64::from(raw[0]), entry.scale),
        DataType::I16 => scaled(i64::from(raw[0] as i16), entry.scale),
        DataType::U32 => scaled(i64::from(join_u32(raw[0], raw[1])), entry.scale),
        DataType::I32 => scaled(i64::from(join_u32(raw[0], raw[1]) as i32), entry.scale),
        DataType::U32Date => {
            let year = i32::from(raw[0]);
            let (month, day) = split_bytes(raw[1]);
            NaiveDate::from_ymd_opt(year, u32::from(month), u32::from(day))
                .map(Value::Date)
                .ok_or_else(|| {
                    DecodeError::InvalidDateTime(format!("{year:04}-{month:02}-{day:02}"))
                })?
        }
        DataType::TimeOfDay => Value::Time(decode_time(raw[0])?),
        DataType::DateTime => Value::DateTime(decode_date_time(raw)?),
        DataType::Bitfield(table) => Value::Flags(decode_flags(raw[0], table)),
        DataType::Ascii(_) => Value::Text(decode_ascii(raw)),
    };

    if let Some(validation) = entry.validation {
        if !validation.check(&value) {
            trace!(name = entry.name, value = %value, "value rejected by validation");
            return Err(DecodeError::Invalid {
                name: entry.name,
                value: value.to_string(),
            });
        }
    }

    Ok(value)
}

/// Inverse of [`decode`].
///
/// Numeric values are descaled and rejected when the nearest register value
/// would not decode back to exactly the same value.
pub fn encode(value: &Value, entry: &RegisterEntry) -> Result<Vec<u16>, EncodeError> {
    match entry.data_type {
        DataType::U16 | DataType::I16 | DataType::U32 | DataType::I32 => {
            let raw = descale(value, entry)?;
            Ok(match entry.data_type {
                DataType::U16 => vec![raw as u16],
                DataType::I16 => vec![(raw as i16) as u16],
                DataType::U32 => split_u32(raw as u32),
                _ => split_u32((raw as i32) as u32),
            })
        }
        DataType::TimeOfDay => match value {
            Value::Time(time) if time.second() == 0 && time.nanosecond() == 0 => {
                Ok(vec![encode_time(time)])
            }
            Value::Time(time) => Err(EncodeError::Precision(time.to_string())),
            _ => Err(EncodeError::TypeMismatch("time")),
        },
        DataType::U32Date => match value {
            Value::Date(date) => {
                let year = u16::try_from(date.year())
                    .map_err(|_| EncodeError::OutOfRange(date.to_string()))?;
                Ok(vec![year, join_bytes(date.month() as u8, date.day() as u8)])
            }
            _ => Err(EncodeError::TypeMismatch("date")),
        },
        DataType::DateTime => match value {
            Value::DateTime(stamp) => encode_date_time(stamp),
            _ => Err(EncodeError::TypeMismatch("date-time")),
        },
        DataType::Bitfield(table) => match value {
            Value::Flags(names) => encode_flags(names, table).map(|word| vec![word]),
            _ => Err(EncodeError::TypeMismatch("flags")),
        },
        DataType::Ascii(_) => Err(EncodeError::Unsupported("text")),
    }
}

fn scaled(raw: i64, scale: f64) -> Value {
    if scale == 1.0 {
        Value::Integer(raw)
    } else {
        Value::Float(apply_scale(raw, scale))
    }
}

/// Decimal scales such as 0.1 are applied as a division by 10 so the result is
/// the closest double to the intended decimal.
fn apply_scale(raw: i64, scale: f64) -> f64 {
    match divisor(scale) {
        Some(divisor) => raw as f64 / divisor,
        None => raw as f64 * scale,
    }
}

fn divisor(scale: f64) -> Option<f64> {
    if scale <= 0.0 || scale >= 1.0 {
        return None;
    }
    let inverse = 1.0 / scale;
    let rounded = inverse.round();
    if (inverse - rounded).abs() < 1e-9 {
        Some(rounded)
    } else {
        None
    }
}

fn descale(value: &Value, entry: &RegisterEntry) -> Result<i64, EncodeError> {
    let (min, max) = match entry.data_type {
        DataType::U16 => (0, i64::from(u16::MAX)),
        DataType::I16 => (i64::from(i16::MIN), i64::from(i16::MAX)),
        DataType::U32 => (0, i64::from(u32::MAX)),
        _ => (i64::from(i32::MIN), i64::from(i32::MAX)),
    };

    let raw = match value {
        Value::Integer(v) if entry.scale == 1.0 => *v,
        Value::Integer(_) | Value::Float(_) => {
            let target = value.as_f64().unwrap_or(f64::NAN);
            if !target.is_finite() {
                return Err(EncodeError::Precision(value.to_string()));
            }
            let candidate = match divisor(entry.scale) {
                Some(divisor) => (target * divisor).round(),
                None => (target / entry.scale).round(),
            };
            if candidate < min as f64 || candidate > max as f64 {
                return Err(EncodeError::OutOfRange(value.to_string()));
            }
            let candidate = candidate as i64;
            if apply_scale(candidate, entry.scale) != target {
                return Err(EncodeError::Precision(value.to_string()));
            }
            candidate
        }
        _ => return Err(EncodeError::TypeMismatch("numeric")),
    };

    if raw < min || raw > max {
        return Err(EncodeError::OutOfRange(value.to_string()));
    }
    Ok(raw)
}

fn join_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

fn split_u32(value: u32) -> Vec<u16> {
    vec![(value >> 16) as u16, value as u16]
}

fn split_bytes(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, word as u8)
}

fn join_bytes(high: u8, low: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

pub fn decode_time(word: u16) -> Result<NaiveTime, DecodeError> {
    let (hour, minute) = split_bytes(word);
    NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)
        .ok_or(DecodeError::InvalidTime(word))
}

pub fn encode_time(time: &NaiveTime) -> u16 {
    join_bytes(time.hour() as u8, time.minute() as u8)
}

fn from_bcd(byte: u8) -> Option<u32> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    if high > 9 || low > 9 {
        return None;
    }
    Some(u32::from(high) * 10 + u32::from(low))
}

fn to_bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

fn decode_date_time(raw: &[u16]) -> Result<NaiveDateTime, DecodeError> {
    let bytes = raw
        .iter()
        .flat_map(|word| {
            let (high, low) = split_bytes(*word);
            [high, low]
        })
        .collect::<Vec<_>>();
    let invalid = || {
        DecodeError::InvalidDateTime(
            raw.iter()
                .map(|word| format!("{word:04x}"))
                .collect::<Vec<_>>()
                .join(" "),
        )
    };

    let mut fields = [0u32; 6];
    for (field, byte) in fields.iter_mut().zip(bytes.iter()) {
        *field = from_bcd(*byte).ok_or_else(invalid)?;
    }
    let [year, month, day, hour, minute, second] = fields;
    if month == 0 || month > 12 || hour > 23 || minute > 59 || second > 59 {
        return Err(invalid());
    }

    NaiveDate::from_ymd_opt(2000 + year as i32, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or_else(invalid)
}

fn encode_date_time(stamp: &NaiveDateTime) -> Result<Vec<u16>, EncodeError> {
    let year = stamp.year() - 2000;
    if !(0..100).contains(&year) {
        return Err(EncodeError::OutOfRange(stamp.to_string()));
    }
    if stamp.nanosecond() != 0 {
        return Err(EncodeError::Precision(stamp.to_string()));
    }
    Ok(vec![
        join_bytes(to_bcd(year as u32), to_bcd(stamp.month())),
        join_bytes(to_bcd(stamp.day()), to_bcd(stamp.hour())),
        join_bytes(to_bcd(stamp.minute()), to_bcd(stamp.second())),
    ])
}

fn decode_flags(word: u16, table: BitTable) -> Vec<String> {
    (0u8..16)
        .filter(|bit| word & (1 << bit) != 0)
        .map(|bit| {
            table
                .iter()
                .find(|(candidate, _)| *candidate == bit)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_else(|| format!("bit{bit}"))
        })
        .collect()
}

fn encode_flags(names: &[String], table: BitTable) -> Result<u16, EncodeError> {
    names.iter().try_fold(0u16, |word, name| {
        let bit = table
            .iter()
            .find(|(_, candidate)| *candidate == name.as_str())
            .map(|(bit, _)| *bit)
            .or_else(|| {
                name.strip_prefix("bit")
                    .and_then(|digits| digits.parse::<u8>().ok())
                    .filter(|bit| *bit < 16)
            })
            .ok_or_else(|| EncodeError::UnknownFlag(name.clone()))?;
        Ok(word | (1 << bit))
    })
}

/// Text stored one character per register in the low byte, trimmed of
/// padding spaces and NULs.
pub fn decode_ascii(raw: &[u16]) -> String {
    raw.iter()
        .map(|word| char::from((word & 0xFF) as u8))
        .collect::<String>()
        .trim_matches(|ch: char| ch.is_whitespace() || ch == '\0')
        .to_string()
}
