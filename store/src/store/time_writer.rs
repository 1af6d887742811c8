//! How times are written into SQL.
//!
//! Both writers resolve "now" and offsets against the engine clock, so the
//! same data and the same clock give the same answers. They differ only in
//! storage: [`NativeTimeWriter`] keeps SQLite date text
//! (`YYYY-MM-DD HH:MM:SS.ffffff`), [`MicrosTimeWriter`] keeps integer
//! microseconds since the epoch.

use super::query::QueryBuilder;
use super::query::text;
use crate::clock::Clock;
use crate::factory::TimeEncoding;
use crate::types::TimeOrOffset;
use crate::types::clamp_time;
use chrono::DateTime;
use chrono::Utc;
use rusqlite::types::Value;

pub trait TimeWriter: Send + Sync + std::fmt::Debug {
    /// Column type used for time columns in the schema.
    fn column_type(&self) -> &'static str;
    fn now(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock);
    fn time_or_offset(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock, too: &TimeOrOffset);
    fn time_arg(&self, t: DateTime<Utc>) -> Value;
}

pub fn writer_for(encoding: TimeEncoding) -> Box<dyn TimeWriter> {
    match encoding {
        TimeEncoding::Native => Box::new(NativeTimeWriter),
        TimeEncoding::Micros => Box::new(MicrosTimeWriter),
    }
}

const NATIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Fixed-width text that SQLite's date functions understand and that sorts
/// like the time it encodes. Times outside four-digit years are clamped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTimeWriter;

impl TimeWriter for NativeTimeWriter {
    fn column_type(&self) -> &'static str {
        "TEXT"
    }

    fn now(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock) {
        qb.add_time(clock.now());
    }

    fn time_or_offset(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock, too: &TimeOrOffset) {
        qb.add_time(too.resolve(clock.now()));
    }

    fn time_arg(&self, t: DateTime<Utc>) -> Value {
        text(clamp_time(t).format(NATIVE_FORMAT).to_string())
    }
}

/// Integer microseconds since the epoch, clamped like the native text.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrosTimeWriter;

impl TimeWriter for MicrosTimeWriter {
    fn column_type(&self) -> &'static str {
        "INTEGER"
    }

    fn now(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock) {
        qb.add_time(clock.now());
    }

    fn time_or_offset(&self, qb: &mut QueryBuilder<'_>, clock: &dyn Clock, too: &TimeOrOffset) {
        qb.add_time(too.resolve(clock.now()));
    }

    fn time_arg(&self, t: DateTime<Utc>) -> Value {
        Value::Integer(clamp_time(t).timestamp_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::max_time;
    use pretty_assertions::assert_eq;

    #[test]
    fn native_text_keeps_microseconds() {
        let t = DateTime::from_timestamp(1_700_000_000, 5_250_000).unwrap();
        assert_eq!(NativeTimeWriter.time_arg(t), text("2023-11-14 22:13:20.005250"));
        assert_eq!(MicrosTimeWriter.time_arg(t), Value::Integer(1_700_000_000_005_250));
    }

    #[test]
    fn native_text_sorts_like_time() {
        let w = NativeTimeWriter;
        let times = [
            DateTime::from_timestamp(1_700_000_000, 200_000).unwrap(),
            DateTime::from_timestamp(1_700_000_000, 500_000).unwrap(),
            DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            DateTime::<Utc>::MAX_UTC,
        ];
        let encoded: Vec<String> = times
            .iter()
            .map(|t| match w.time_arg(*t) {
                Value::Text(s) => s,
                other => panic!("native times are text, got {other:?}"),
            })
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(sorted, encoded);
        assert_eq!(encoded[3], "9999-12-31 23:59:59.999999");
        assert_eq!(w.time_arg(DateTime::<Utc>::MAX_UTC), w.time_arg(max_time()));
    }
}
