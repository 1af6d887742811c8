use super::time_writer::TimeWriter;
use crate::clock::Clock;
use crate::error::Result;
use crate::types::TimeOrOffset;
use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::Row;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use tracing::trace;

/// Accumulates SQL fragments and positional arguments. Time values go
/// through the engine's [`TimeWriter`], so the same query text works for
/// every time encoding.
pub struct QueryBuilder<'a> {
    parts: Vec<String>,
    args: Vec<Value>,
    writer: &'a dyn TimeWriter,
    clock: &'a dyn Clock,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(writer: &'a dyn TimeWriter, clock: &'a dyn Clock) -> Self {
        Self {
            parts: Vec::new(),
            args: Vec::new(),
            writer,
            clock,
        }
    }

    pub fn build<I>(&mut self, sql: &str, args: I) -> &mut Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.parts.push(sql.to_string());
        self.args.extend(args);
        self
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.parts.push(sql.to_string());
        self
    }

    /// The store's current time.
    pub fn now(&mut self) -> &mut Self {
        let (writer, clock) = (self.writer, self.clock);
        writer.now(self, clock);
        self
    }

    pub fn time_or_offset(&mut self, too: &TimeOrOffset) -> &mut Self {
        let (writer, clock) = (self.writer, self.clock);
        writer.time_or_offset(self, clock, too);
        self
    }

    /// A literal time, bound as a parameter.
    pub fn add_time(&mut self, t: DateTime<Utc>) -> &mut Self {
        let arg = self.time_arg(t);
        self.build("?", [arg])
    }

    pub fn time_arg(&self, t: DateTime<Utc>) -> Value {
        self.writer.time_arg(t)
    }

    /// Query text with whitespace runs collapsed.
    pub fn sql(&self) -> String {
        self.parts
            .iter()
            .flat_map(|p| p.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        let sql = self.sql();
        trace!(%sql, "execute");
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.execute(params_from_iter(self.args.iter()))?)
    }

    pub fn query_rows<T, F>(&self, conn: &Connection, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T>,
    {
        let sql = self.sql();
        trace!(%sql, "query");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(self.args.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(f(row)?);
        }
        Ok(out)
    }
}

pub(crate) fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::store::time_writer::MicrosTimeWriter;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_text_and_args_in_order() {
        let clock = FakeClock::new(DateTime::from_timestamp(100, 0).unwrap());
        let writer = MicrosTimeWriter;
        let mut qb = QueryBuilder::new(&writer, &clock);
        qb.build("SELECT * FROM t\n   WHERE a=?", [text("x")])
            .push("AND b <=")
            .now();
        assert_eq!(qb.sql(), "SELECT * FROM t WHERE a=? AND b <= ?");
        assert_eq!(
            qb.args(),
            &[text("x"), Value::Integer(100_000_000)][..]
        );
    }
}
