//! Decoding persisted columns back into domain values.
//!
//! Identifiers are stored as hex text; times are either integer
//! microseconds or `YYYY-MM-DD HH:MM:SS.SSS` text, depending on the time
//! writer that wrote them. Anything that does not decode is an error.

use crate::error::Result;
use crate::error::StoreError;
use crate::types::Body;
use crate::types::Category;
use crate::types::DeviceId;
use crate::types::MsgId;
use crate::types::MsgKind;
use crate::types::Uid;
use crate::values::ValueFactory;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use rusqlite::Row;
use rusqlite::types::ValueRef;

const TEXT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub(crate) fn hex_enc(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn decode_hex(field: &'static str, s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| StoreError::decode(field, format!("{e}: {s:?}")))
}

fn opt_hex(row: &Row<'_>, idx: usize, field: &'static str) -> Result<Option<Vec<u8>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| decode_hex(field, &s)).transpose()
}

fn req<T>(v: Option<T>, field: &'static str) -> Result<T> {
    v.ok_or_else(|| StoreError::decode(field, "unexpected NULL"))
}

pub(crate) fn time_from_value(field: &'static str, v: ValueRef<'_>) -> Result<Option<DateTime<Utc>>> {
    match v {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(micros) => DateTime::from_timestamp_micros(micros)
            .map(Some)
            .ok_or_else(|| StoreError::decode(field, format!("out of range: {micros}"))),
        ValueRef::Text(raw) => {
            let s = std::str::from_utf8(raw).map_err(|e| StoreError::decode(field, e.to_string()))?;
            NaiveDateTime::parse_from_str(s, TEXT_TIME_FORMAT)
                .map(|t| Some(t.and_utc()))
                .map_err(|e| StoreError::decode(field, format!("{e}: {s:?}")))
        }
        ValueRef::Real(_) | ValueRef::Blob(_) => {
            Err(StoreError::decode(field, "unsupported column type"))
        }
    }
}

/// Typed column access for one result row.
pub(crate) struct Scanner<'a, 'stmt> {
    row: &'a Row<'stmt>,
    values: &'a dyn ValueFactory,
}

impl<'a, 'stmt> Scanner<'a, 'stmt> {
    pub(crate) fn new(row: &'a Row<'stmt>, values: &'a dyn ValueFactory) -> Self {
        Self { row, values }
    }

    pub(crate) fn uid(&self, idx: usize) -> Result<Uid> {
        let bytes = req(opt_hex(self.row, idx, "uid")?, "uid")?;
        self.values.make_uid(&bytes)
    }

    pub(crate) fn msg_id(&self, idx: usize) -> Result<MsgId> {
        req(self.opt_msg_id(idx)?, "msgid")
    }

    pub(crate) fn opt_msg_id(&self, idx: usize) -> Result<Option<MsgId>> {
        opt_hex(self.row, idx, "msgid")?
            .map(|b| self.values.make_msg_id(&b))
            .transpose()
    }

    pub(crate) fn opt_device_id(&self, idx: usize) -> Result<Option<DeviceId>> {
        opt_hex(self.row, idx, "devid")?
            .map(|b| self.values.make_device_id(&b))
            .transpose()
    }

    pub(crate) fn opt_category(&self, idx: usize) -> Result<Option<Category>> {
        let s: Option<String> = self.row.get(idx)?;
        s.map(|s| self.values.make_category(&s)).transpose()
    }

    pub(crate) fn category(&self, idx: usize) -> Result<Category> {
        req(self.opt_category(idx)?, "category")
    }

    pub(crate) fn body(&self, idx: usize) -> Result<Body> {
        let b: Option<Vec<u8>> = self.row.get(idx)?;
        self.values.make_body(&b.unwrap_or_default())
    }

    pub(crate) fn opt_time(&self, idx: usize, field: &'static str) -> Result<Option<DateTime<Utc>>> {
        time_from_value(field, self.row.get_ref(idx)?)
    }

    pub(crate) fn time(&self, idx: usize, field: &'static str) -> Result<DateTime<Utc>> {
        req(self.opt_time(idx, field)?, field)
    }

    pub(crate) fn kind(&self, idx: usize) -> Result<MsgKind> {
        let v: i64 = self.row.get(idx)?;
        MsgKind::from_i64(v)
            .ok_or_else(|| StoreError::decode("mtype", format!("unrecognized msg type {v}")))
    }

    pub(crate) fn seqno(&self, idx: usize) -> Result<u32> {
        let v: i64 = self.row.get(idx)?;
        u32::try_from(v).map_err(|_| StoreError::decode("seqno", format!("out of range: {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_time_encodings() {
        let t = DateTime::from_timestamp(1_700_000_000, 5_000_000).unwrap();
        assert_eq!(
            time_from_value("ctime", ValueRef::Integer(t.timestamp_micros())).unwrap(),
            Some(t)
        );
        assert_eq!(
            time_from_value("ctime", ValueRef::Text(b"2023-11-14 22:13:20.005")).unwrap(),
            Some(t)
        );
        assert_eq!(time_from_value("ctime", ValueRef::Null).unwrap(), None);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(time_from_value("ctime", ValueRef::Text(b"yesterday")).is_err());
        assert!(decode_hex("uid", "zz").is_err());
    }
}
