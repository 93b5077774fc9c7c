//! Type-directed conversion of raw rows into typed rows.
//!
//! Every column is converted independently. A cell that cannot be converted
//! to its column's extract type becomes [`Cell::Null`] and the rest of the
//! row is still processed, so one malformed value never stops a run.

use chrono::{Datelike, NaiveTime, Timelike};
use tracing::trace;

use super::{Cell, ExtractType, RawRow, RawValue, SchemaRef, TypedRow};

const NANOS_PER_FRAC: u32 = 100_000;
const NANOS_PER_SECOND: i128 = 1_000_000_000;
const NANOS_PER_DAY: i128 = 86_400 * NANOS_PER_SECOND;
/// Longest duration the extract stores: i64 microseconds.
const MAX_DURATION_NANOS: i128 = i64::MAX as i128 * 1_000;

/// Converts raw rows against a fixed schema.
#[derive(Debug)]
pub struct RowCoercer {
    schema: SchemaRef,
    cells_nulled: u64,
}

impl RowCoercer {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            cells_nulled: 0,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Number of non-null source cells that could not be converted so far.
    ///
    /// Null source values are not counted: they map to null by definition.
    pub fn cells_nulled(&self) -> u64 {
        self.cells_nulled
    }

    /// Convert `raw` into a row with exactly one cell per schema column.
    ///
    /// Missing trailing cells become null and surplus cells are dropped;
    /// both count as failed conversions.
    pub fn coerce(&mut self, raw: RawRow) -> TypedRow {
        let width = self.schema.len();
        let surplus = raw.len().saturating_sub(width);
        let mut values = raw.into_iter();
        let mut cells = Vec::with_capacity(width);

        for (index, column) in self.schema.columns().iter().enumerate() {
            let cell = match values.next() {
                Some(RawValue::Null) => Cell::Null,
                Some(value) => match coerce_value(column.extract_type(), &value) {
                    Some(cell) => cell,
                    None => {
                        trace!(
                            column = index,
                            target = column.extract_type().as_str(),
                            "Cell could not be converted, storing null: {:?}",
                            value
                        );
                        self.cells_nulled += 1;
                        Cell::Null
                    }
                },
                None => {
                    self.cells_nulled += 1;
                    Cell::Null
                }
            };
            cells.push(cell);
        }

        if surplus > 0 {
            trace!(surplus, "Dropping cells beyond schema width");
            self.cells_nulled += surplus as u64;
        }

        TypedRow::from_cells(cells)
    }
}

/// Convert one non-null value to `target`, or `None` when it does not fit.
pub fn coerce_value(target: ExtractType, value: &RawValue) -> Option<Cell> {
    match target {
        ExtractType::Integer => to_integer(value).map(Cell::Integer),
        ExtractType::Double => to_double(value).map(Cell::Double),
        ExtractType::Boolean => match value {
            RawValue::Boolean(b) => Some(Cell::Boolean(*b)),
            _ => None,
        },
        ExtractType::Date => to_date(value),
        ExtractType::DateTime => to_datetime(value),
        ExtractType::Duration => to_duration(value),
        ExtractType::CharString => match value {
            RawValue::Text(s) => Some(Cell::CharString(s.clone())),
            RawValue::Bytes(b) => String::from_utf8(b.clone()).ok().map(Cell::CharString),
            _ => None,
        },
        ExtractType::UnicodeString => render_text(value).map(Cell::UnicodeString),
    }
}

fn to_integer(value: &RawValue) -> Option<i64> {
    match value {
        RawValue::Integer(i) => Some(*i),
        RawValue::UnsignedInteger(u) => i64::try_from(*u).ok(),
        _ => None,
    }
}

fn to_double(value: &RawValue) -> Option<f64> {
    match value {
        RawValue::Float(f) => Some(*f),
        RawValue::Integer(i) => Some(*i as f64),
        RawValue::UnsignedInteger(u) => Some(*u as f64),
        RawValue::Decimal(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_date(value: &RawValue) -> Option<Cell> {
    let date = match value {
        RawValue::Date(d) => *d,
        RawValue::Timestamp(ts) => ts.date(),
        _ => return None,
    };
    Some(Cell::Date {
        year: date.year(),
        month: date.month(),
        day: date.day(),
    })
}

fn to_datetime(value: &RawValue) -> Option<Cell> {
    let RawValue::Timestamp(ts) = value else {
        return None;
    };
    Some(Cell::DateTime {
        year: ts.year(),
        month: ts.month(),
        day: ts.day(),
        hour: ts.hour(),
        minute: ts.minute(),
        second: ts.second(),
        frac: frac_of(ts.nanosecond()),
    })
}

fn to_duration(value: &RawValue) -> Option<Cell> {
    match value {
        RawValue::Interval {
            months: 0,
            days,
            nanos,
        } => {
            let total = i128::from(*days) * NANOS_PER_DAY + i128::from(*nanos);
            if !(0..=MAX_DURATION_NANOS).contains(&total) {
                return None;
            }
            let days = i64::try_from(total / NANOS_PER_DAY).ok()?;
            let rest = (total % NANOS_PER_DAY) as i64;
            let seconds = rest / NANOS_PER_SECOND as i64;
            Some(Cell::Duration {
                days,
                hour: (seconds / 3600) as u32,
                minute: (seconds / 60 % 60) as u32,
                second: (seconds % 60) as u32,
                frac: frac_of((rest % NANOS_PER_SECOND as i64) as u32),
            })
        }
        RawValue::Time(t) => Some(time_as_duration(t)),
        _ => None,
    }
}

fn time_as_duration(t: &NaiveTime) -> Cell {
    Cell::Duration {
        days: 0,
        hour: t.hour(),
        minute: t.minute(),
        second: t.second(),
        frac: frac_of(t.nanosecond()),
    }
}

/// Leap-second nanoseconds (>= 1e9) clamp to the last fractional unit.
fn frac_of(nanos: u32) -> u32 {
    (nanos / NANOS_PER_FRAC).min(9_999)
}

fn render_text(value: &RawValue) -> Option<String> {
    match value {
        RawValue::Null => None,
        RawValue::Text(s) => Some(s.clone()),
        RawValue::Boolean(b) => Some(b.to_string()),
        RawValue::Integer(i) => Some(i.to_string()),
        RawValue::UnsignedInteger(u) => Some(u.to_string()),
        RawValue::Float(f) => Some(f.to_string()),
        RawValue::Decimal(s) => Some(s.clone()),
        RawValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
        RawValue::Date(d) => Some(d.to_string()),
        RawValue::Timestamp(ts) => Some(ts.to_string()),
        RawValue::Time(t) => Some(t.to_string()),
        RawValue::Interval {
            months,
            days,
            nanos,
        } => Some(format!("{} months {} days {} ns", months, days, nanos)),
    }
}
