//! SQL value types and their value-preserving mapping onto BSON.
//!
//! Values are read from SQL Server into [`SqlValue`] and rendered into BSON
//! only when a record is written to the target. The mapping never changes a
//! value's meaning; where BSON has no exact equivalent (decimals, times of
//! day) the canonical text form is stored instead.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Timelike};
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson};
use rust_decimal::Decimal;
use uuid::Uuid;

/// SQL value read from the source, owned so rows can cross task boundaries.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value (bit).
    Bool(bool),

    /// 16-bit signed integer (tinyint, smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real).
    F32(f32),

    /// 64-bit floating point (float).
    F64(f64),

    /// Text data (char, varchar, nchar, nvarchar, text, xml).
    String(String),

    /// Binary data (binary, varbinary, image).
    Bytes(Vec<u8>),

    /// uniqueidentifier.
    Uuid(Uuid),

    /// decimal, numeric, money.
    Decimal(Decimal),

    /// datetime, datetime2, smalldatetime. `datetime` and `smalldatetime`
    /// arrive truncated to whole milliseconds.
    DateTime(NaiveDateTime),

    /// datetimeoffset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// date.
    Date(NaiveDate),

    /// time.
    Time(NaiveTime),
}

impl SqlValue {
    /// Render this value as BSON.
    ///
    /// `uniqueidentifier` values become strings: BSON binary subtype 4 is
    /// reserved for surrogate identifiers allocated during replication.
    ///
    /// BSON dates hold UTC milliseconds. A `datetime2` with sub-millisecond
    /// digits and every `datetimeoffset` are written as ISO-8601 text so no
    /// precision or offset is lost.
    pub fn to_bson(&self) -> Bson {
        match self {
            SqlValue::Null => Bson::Null,
            SqlValue::Bool(v) => Bson::Boolean(*v),
            SqlValue::I16(v) => Bson::Int32(i32::from(*v)),
            SqlValue::I32(v) => Bson::Int32(*v),
            SqlValue::I64(v) => Bson::Int64(*v),
            SqlValue::F32(v) => Bson::Double(f64::from(*v)),
            SqlValue::F64(v) => Bson::Double(*v),
            SqlValue::String(v) => Bson::String(v.clone()),
            SqlValue::Bytes(v) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: v.clone(),
            }),
            SqlValue::Uuid(v) => Bson::String(v.hyphenated().to_string()),
            SqlValue::Decimal(v) => Bson::String(v.to_string()),
            SqlValue::DateTime(v) if v.nanosecond() % 1_000_000 == 0 => {
                Bson::DateTime(mongodb::bson::DateTime::from_millis(v.and_utc().timestamp_millis()))
            }
            SqlValue::DateTime(v) => Bson::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::DateTimeOffset(v) => {
                Bson::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
            SqlValue::Date(v) => {
                let midnight = v.and_time(NaiveTime::MIN);
                Bson::DateTime(mongodb::bson::DateTime::from_millis(
                    midnight.and_utc().timestamp_millis(),
                ))
            }
            SqlValue::Time(v) => Bson::String(v.format("%H:%M:%S%.f").to_string()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}
