//! Durable engine over SQLite.
//!
//! Each message lands in one transaction: message metadata, item and
//! reminder rows for a creation, audit rows plus item dtime updates for a
//! dismissal. Items are never deleted; dismissal only sets `dtime`.
//!
//! Reminder claims run in an immediate (write-locked) transaction and stamp
//! `lock_time` with a compare-and-set, so two pollers never lease the same
//! row, even from different connections or processes.

use super::StateMachine;
use super::DEFAULT_LEASE_SECS;
use super::MAX_REMINDERS;
use super::clamp_reminder_limit;
use super::query::QueryBuilder;
use super::query::text;
use super::scan::Scanner;
use super::scan::hex_enc;
use super::scan::time_from_value;
use super::schema::DISMISSALS_BY_ID;
use super::schema::DISMISSALS_BY_TIME;
use super::schema::ITEMS;
use super::schema::MESSAGES;
use super::schema::REMINDERS;
use super::schema::create_statements;
use super::schema::drop_statements;
use super::time_writer::TimeWriter;
use super::validate;
use crate::clock::Clock;
use crate::error::Result;
use crate::error::StoreError;
use crate::types::Category;
use crate::types::DeviceId;
use crate::types::Dismissal;
use crate::types::InBandMessage;
use crate::types::Item;
use crate::types::Metadata;
use crate::types::MsgId;
use crate::types::MsgKind;
use crate::types::MsgRange;
use crate::types::Payload;
use crate::types::Reminder;
use crate::types::ReminderId;
use crate::types::ReminderSet;
use crate::types::State;
use crate::types::TimeOrOffset;
use crate::types::Uid;
use crate::values::ValueFactory;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::InterruptHandle;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tracing::debug;

const SET_EARLIEST_DTIME: &str = "dtime = CASE WHEN dtime IS NULL OR dtime > ? THEN ? ELSE dtime END";

#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Age after which an undeleted reminder lease may be claimed again.
    pub lease_duration: Duration,
    /// How long a statement waits on another writer before failing.
    pub busy_timeout: std::time::Duration,
    /// Ceiling on one reminder claim, itself capped at [`MAX_REMINDERS`].
    pub max_reminders: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECS),
            busy_timeout: std::time::Duration::from_secs(5),
            max_reminders: MAX_REMINDERS,
        }
    }
}

pub struct SqlEngine {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    values: Arc<dyn ValueFactory>,
    writer: Box<dyn TimeWriter>,
    clock: Arc<dyn Clock>,
    config: SqlConfig,
}

impl SqlEngine {
    /// Wrap an open connection and make sure the schema exists.
    pub fn new(
        conn: Connection,
        values: Arc<dyn ValueFactory>,
        writer: Box<dyn TimeWriter>,
        clock: Arc<dyn Clock>,
        config: SqlConfig,
    ) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout)?;
        let interrupt = conn.get_interrupt_handle();
        let engine = Self {
            conn: Mutex::new(conn),
            interrupt,
            values,
            writer,
            clock,
            config,
        };
        engine.create_schema()?;
        Ok(engine)
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        values: Arc<dyn ValueFactory>,
        writer: Box<dyn TimeWriter>,
        clock: Arc<dyn Clock>,
        config: SqlConfig,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::new(conn, values, writer, clock, config)
    }

    pub fn open_in_memory(
        values: Arc<dyn ValueFactory>,
        writer: Box<dyn TimeWriter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::new(
            Connection::open_in_memory()?,
            values,
            writer,
            clock,
            SqlConfig::default(),
        )
    }

    /// Abort whatever statement this engine is running. Safe to call from
    /// another thread; the interrupted call fails with
    /// [`StoreError::Cancelled`] and its transaction rolls back.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    pub fn values(&self) -> &dyn ValueFactory {
        self.values.as_ref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn qb(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self.writer.as_ref(), self.clock.as_ref())
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        for stmt in create_statements(self.writer.column_type()) {
            conn.execute_batch(&stmt)?;
        }
        Ok(())
    }

    fn time_or_now(qb: &mut QueryBuilder<'_>, t: Option<&TimeOrOffset>) {
        match t {
            Some(t) => qb.time_or_offset(t),
            None => qb.now(),
        };
    }

    /// Insert the message row and read back its authoritative ctime.
    /// The flag is false when the msgid was already stored.
    fn consume_metadata(
        &self,
        tx: &Transaction<'_>,
        msg: &InBandMessage,
    ) -> Result<(DateTime<Utc>, bool)> {
        let md = &msg.metadata;
        let uid = hex_enc(md.uid.as_bytes());
        let mid = hex_enc(md.msg_id.as_bytes());
        let devid = md
            .device_id
            .as_ref()
            .map_or(Value::Null, |d| text(hex_enc(d.as_bytes())));

        let mut qb = self.qb();
        qb.build(
            &format!("INSERT INTO {MESSAGES}(uid, msgid, mtype, devid, ctime) VALUES(?, ?, ?, ?,"),
            [
                text(uid.clone()),
                text(mid.clone()),
                Value::Integer(msg.kind().as_i64()),
                devid,
            ],
        );
        match md.ctime {
            Some(t) => qb.add_time(t),
            None => qb.now(),
        };
        qb.push(") ON CONFLICT(uid, msgid) DO NOTHING");
        let inserted = qb.execute(tx)? == 1;

        let mut read = self.qb();
        read.build(
            &format!("SELECT ctime FROM {MESSAGES} WHERE uid=? AND msgid=?"),
            [text(uid), text(mid)],
        );
        let ctime = read
            .query_rows(tx, |row| time_from_value("ctime", row.get_ref(0)?))?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| StoreError::decode("ctime", "message row has no ctime"))?;
        Ok((ctime, inserted))
    }

    fn consume_creation(&self, tx: &Transaction<'_>, md: &Metadata, item: &Item) -> Result<()> {
        let uid = hex_enc(md.uid.as_bytes());
        let mid = hex_enc(md.msg_id.as_bytes());

        let mut qb = self.qb();
        qb.build(
            &format!("INSERT INTO {ITEMS}(uid, msgid, category, body, dtime) VALUES(?, ?, ?, ?,"),
            [
                text(uid.clone()),
                text(mid.clone()),
                text(item.category.as_str()),
                Value::Blob(item.body.as_bytes().to_vec()),
            ],
        );
        match &item.dtime {
            Some(dtime) => qb.time_or_offset(dtime),
            None => qb.push("NULL"),
        };
        qb.push(")");
        qb.execute(tx)?;

        for (seqno, rtime) in item.remind_times.iter().enumerate() {
            let Some(rtime) = rtime else {
                continue;
            };
            let mut qb = self.qb();
            qb.build(
                &format!("INSERT INTO {REMINDERS}(uid, msgid, seqno, rtime) VALUES(?, ?, ?,"),
                [text(uid.clone()), text(mid.clone()), Value::Integer(seqno as i64)],
            );
            qb.time_or_offset(rtime).push(")");
            qb.execute(tx)?;
        }
        Ok(())
    }

    fn consume_msg_ids_to_dismiss(
        &self,
        tx: &Transaction<'_>,
        md: &Metadata,
        targets: &[MsgId],
        ctime: DateTime<Utc>,
    ) -> Result<()> {
        let uid = hex_enc(md.uid.as_bytes());
        let mid = hex_enc(md.msg_id.as_bytes());
        for target in targets {
            let target = hex_enc(target.as_bytes());
            let mut ins = self.qb();
            ins.build(
                &format!("INSERT OR IGNORE INTO {DISMISSALS_BY_ID}(uid, msgid, dmsgid) VALUES(?, ?, ?)"),
                [text(uid.clone()), text(mid.clone()), text(target.clone())],
            );
            ins.execute(tx)?;

            let mut upd = self.qb();
            let dtime = upd.time_arg(ctime);
            upd.build(
                &format!("UPDATE {ITEMS} SET {SET_EARLIEST_DTIME} WHERE uid=? AND msgid=?"),
                [dtime.clone(), dtime, text(uid.clone()), text(target)],
            );
            upd.execute(tx)?;
        }
        Ok(())
    }

    fn consume_ranges_to_dismiss(
        &self,
        tx: &Transaction<'_>,
        md: &Metadata,
        ranges: &[MsgRange],
        ctime: DateTime<Utc>,
    ) -> Result<()> {
        let uid = hex_enc(md.uid.as_bytes());
        let mid = hex_enc(md.msg_id.as_bytes());
        for range in ranges {
            let mut ins = self.qb();
            ins.build(
                &format!(
                    "INSERT OR IGNORE INTO {DISMISSALS_BY_TIME}(uid, msgid, category, dtime) VALUES(?, ?, ?,"
                ),
                [
                    text(uid.clone()),
                    text(mid.clone()),
                    text(range.category.as_str()),
                ],
            );
            ins.time_or_offset(&range.end_time).push(") RETURNING dtime");
            // Reuse the stored end time so the audit row and the update agree.
            let Some(end) = ins
                .query_rows(tx, |row| Ok(row.get::<_, Value>(0)?))?
                .into_iter()
                .next()
            else {
                continue;
            };

            let mut upd = self.qb();
            let dtime = upd.time_arg(ctime);
            upd.build(
                &format!(
                    "UPDATE {ITEMS} SET {SET_EARLIEST_DTIME}
                     WHERE uid=? AND category=? AND msgid IN
                        (SELECT msgid FROM {MESSAGES} WHERE uid=? AND ctime <= ?)"
                ),
                [
                    dtime.clone(),
                    dtime,
                    text(uid.clone()),
                    text(range.category.as_str()),
                    text(uid.clone()),
                    end,
                ],
            );
            upd.execute(tx)?;
        }
        Ok(())
    }

    fn items(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
        prefix: Option<&Category>,
    ) -> Result<State> {
        let mut qb = self.qb();
        qb.build(
            &format!(
                "SELECT i.msgid, m.devid, i.category, i.dtime, i.body, m.ctime
                 FROM {ITEMS} AS i
                 INNER JOIN {MESSAGES} AS m ON (i.uid=m.uid AND i.msgid=m.msgid)
                 WHERE i.uid=? AND (i.dtime IS NULL OR i.dtime >"
            ),
            [text(hex_enc(uid.as_bytes()))],
        );
        Self::time_or_now(&mut qb, t.as_ref());
        qb.push(") AND m.ctime <=");
        Self::time_or_now(&mut qb, t.as_ref());
        if let Some(d) = device {
            // A NULL devid addresses every device.
            qb.build(
                "AND (m.devid=? OR m.devid IS NULL)",
                [text(hex_enc(d.as_bytes()))],
            );
        }
        if let Some(p) = prefix {
            // substr keeps the match case-sensitive and free of LIKE wildcards.
            qb.build(
                "AND substr(i.category, 1, ?) = ?",
                [
                    Value::Integer(p.as_str().chars().count() as i64),
                    text(p.as_str()),
                ],
            );
        }
        qb.push("ORDER BY m.ctime ASC, m.rowid ASC");

        let conn = self.conn()?;
        let items = qb.query_rows(&conn, |row| {
            let s = Scanner::new(row, self.values.as_ref());
            Ok(Item {
                metadata: Metadata {
                    uid: uid.clone(),
                    msg_id: s.msg_id(0)?,
                    device_id: s.opt_device_id(1)?,
                    ctime: Some(s.time(5, "ctime")?),
                },
                category: s.category(2)?,
                body: s.body(4)?,
                dtime: s.opt_time(3, "dtime")?.map(TimeOrOffset::Time),
                remind_times: Vec::new(),
            })
        })?;
        Ok(State::new(items))
    }

    fn row_to_replay(&self, uid: &Uid, row: &Row<'_>) -> Result<ReplayRow> {
        let s = Scanner::new(row, self.values.as_ref());
        let metadata = Metadata {
            uid: uid.clone(),
            msg_id: s.msg_id(0)?,
            device_id: s.opt_device_id(1)?,
            ctime: Some(s.time(2, "ctime")?),
        };
        let creation = match s.opt_category(4)? {
            Some(category) => Some(Item {
                metadata: metadata.clone(),
                category,
                body: s.body(5)?,
                dtime: s.opt_time(6, "dtime")?.map(TimeOrOffset::Time),
                remind_times: Vec::new(),
            }),
            None => None,
        };
        let range = match (s.opt_category(7)?, s.opt_time(8, "range dtime")?) {
            (Some(category), Some(end)) => Some(MsgRange {
                category,
                end_time: TimeOrOffset::Time(end),
            }),
            _ => None,
        };
        Ok(ReplayRow {
            kind: s.kind(3)?,
            metadata,
            creation,
            range,
            dismissed: s.opt_msg_id(9)?,
        })
    }

    fn row_to_reminder(&self, row: &Row<'_>) -> Result<Reminder> {
        let s = Scanner::new(row, self.values.as_ref());
        let metadata = Metadata {
            uid: s.uid(0)?,
            msg_id: s.msg_id(1)?,
            device_id: s.opt_device_id(2)?,
            ctime: Some(s.time(6, "ctime")?),
        };
        Ok(Reminder {
            item: Item {
                metadata,
                category: s.category(3)?,
                body: s.body(5)?,
                dtime: s.opt_time(4, "dtime")?.map(TimeOrOffset::Time),
                remind_times: Vec::new(),
            },
            seqno: s.seqno(8)?,
            rtime: s.time(7, "rtime")?,
            lock_time: None,
        })
    }
}

/// One joined row of the replay query.
struct ReplayRow {
    metadata: Metadata,
    kind: MsgKind,
    creation: Option<Item>,
    range: Option<MsgRange>,
    dismissed: Option<MsgId>,
}

/// A message reassembled from its joined rows.
struct Replay {
    metadata: Metadata,
    kind: MsgKind,
    creation: Option<Item>,
    dismissal: Dismissal,
}

impl Replay {
    fn merge(&mut self, row: ReplayRow) {
        if self.creation.is_none() {
            self.creation = row.creation;
        }
        if let Some(range) = row.range
            && !self.dismissal.ranges.contains(&range)
        {
            self.dismissal.ranges.push(range);
        }
        if let Some(id) = row.dismissed
            && !self.dismissal.msg_ids.contains(&id)
        {
            self.dismissal.msg_ids.push(id);
        }
    }

    /// `None` for a creation whose item was filtered out as dismissed.
    fn into_message(self) -> Option<InBandMessage> {
        let dismissal = (!self.dismissal.is_empty()).then_some(self.dismissal);
        let payload = match (self.kind, self.creation, dismissal) {
            (MsgKind::Sync, _, _) => Payload::Sync,
            (MsgKind::Update, Some(item), Some(d)) => Payload::CreationAndDismissal(item, d),
            (MsgKind::Update, Some(item), None) => Payload::Creation(item),
            (MsgKind::Update, None, Some(d)) => Payload::Dismissal(d),
            (MsgKind::Update, None, None) => return None,
        };
        Some(InBandMessage {
            metadata: self.metadata,
            payload,
        })
    }
}

impl StateMachine for SqlEngine {
    fn consume_message(&self, msg: &InBandMessage) -> Result<DateTime<Utc>> {
        validate(msg)?;
        let md = &msg.metadata;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (ctime, inserted) = self.consume_metadata(&tx, msg)?;
        if !inserted {
            debug!(msgid = %md.msg_id, "duplicate message ignored");
            return Ok(ctime);
        }
        if let Some(item) = msg.creation_item() {
            self.consume_creation(&tx, md, item)?;
        }
        if let Some(dismissal) = msg.dismissal_part() {
            self.consume_msg_ids_to_dismiss(&tx, md, &dismissal.msg_ids, ctime)?;
            self.consume_ranges_to_dismiss(&tx, md, &dismissal.ranges, ctime)?;
        }
        tx.commit()?;

        debug!(uid = %md.uid, msgid = %md.msg_id, kind = ?msg.kind(), "consumed message");
        Ok(ctime)
    }

    fn state(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
    ) -> Result<State> {
        self.items(uid, device, t, None)
    }

    fn state_by_category_prefix(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
        prefix: &Category,
    ) -> Result<State> {
        self.items(uid, device, t, Some(prefix))
    }

    fn in_band_messages_since(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<InBandMessage>> {
        let mut qb = self.qb();
        qb.push(&format!(
            "SELECT m.msgid, m.devid, m.ctime, m.mtype,
                    i.category, i.body, i.dtime,
                    dt.category, dt.dtime,
                    di.dmsgid
             FROM {MESSAGES} AS m
             LEFT JOIN {ITEMS} AS i
                ON (m.uid=i.uid AND m.msgid=i.msgid AND (i.dtime IS NULL OR i.dtime >"
        ));
        qb.now();
        qb.build(
            &format!(
                "))
                 LEFT JOIN {DISMISSALS_BY_TIME} AS dt ON (m.uid=dt.uid AND m.msgid=dt.msgid)
                 LEFT JOIN {DISMISSALS_BY_ID} AS di ON (m.uid=di.uid AND m.msgid=di.msgid)
                 WHERE m.uid=?"
            ),
            [text(hex_enc(uid.as_bytes()))],
        );
        if let Some(d) = device {
            qb.build(
                "AND (m.devid=? OR m.devid IS NULL)",
                [text(hex_enc(d.as_bytes()))],
            );
        }
        qb.push("AND m.ctime >=").add_time(since);
        qb.push("ORDER BY m.ctime ASC, m.rowid ASC, dt.rowid ASC, di.rowid ASC");

        let rows = {
            let conn = self.conn()?;
            qb.query_rows(&conn, |row| self.row_to_replay(uid, row))?
        };

        let mut replays: Vec<Replay> = Vec::new();
        let mut index: HashMap<MsgId, usize> = HashMap::new();
        for row in rows {
            let idx = *index.entry(row.metadata.msg_id.clone()).or_insert_with(|| {
                replays.push(Replay {
                    metadata: row.metadata.clone(),
                    kind: row.kind,
                    creation: None,
                    dismissal: Dismissal::default(),
                });
                replays.len() - 1
            });
            if let Some(replay) = replays.get_mut(idx) {
                replay.merge(row);
            }
        }
        Ok(replays.into_iter().filter_map(Replay::into_message).collect())
    }

    fn latest_ctime(&self, uid: &Uid, device: Option<&DeviceId>) -> Result<Option<DateTime<Utc>>> {
        let mut qb = self.qb();
        qb.build(
            &format!("SELECT MAX(ctime) FROM {MESSAGES} WHERE uid=?"),
            [text(hex_enc(uid.as_bytes()))],
        );
        if let Some(d) = device {
            qb.build(
                "AND (devid=? OR devid IS NULL)",
                [text(hex_enc(d.as_bytes()))],
            );
        }
        let conn = self.conn()?;
        Ok(qb
            .query_rows(&conn, |row| time_from_value("ctime", row.get_ref(0)?))?
            .into_iter()
            .next()
            .flatten())
    }

    fn reminders(&self, max: usize) -> Result<ReminderSet> {
        let limit = clamp_reminder_limit(max).min(clamp_reminder_limit(self.config.max_reminders));
        let lease_expired = TimeOrOffset::Offset(-self.config.lease_duration);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut qb = self.qb();
        qb.push(&format!(
            "SELECT i.uid, i.msgid, m.devid, i.category, i.dtime, i.body, m.ctime, r.rtime, r.seqno
             FROM {REMINDERS} AS r
             INNER JOIN {ITEMS} AS i ON (r.uid=i.uid AND r.msgid=i.msgid)
             INNER JOIN {MESSAGES} AS m ON (r.uid=m.uid AND r.msgid=m.msgid)
             WHERE (i.dtime IS NULL OR i.dtime >"
        ));
        qb.now().push(") AND r.rtime <=").now();
        qb.push("AND (r.lock_time IS NULL OR r.lock_time <=")
            .time_or_offset(&lease_expired)
            .build(
                ") ORDER BY r.rtime DESC, r.rowid ASC LIMIT ?",
                [Value::Integer(limit as i64)],
            );
        let candidates = qb.query_rows(&tx, |row| self.row_to_reminder(row))?;
        let more_ready = candidates.len() == limit;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut reminder in candidates {
            let id = reminder.id();
            let mut upd = self.qb();
            upd.push(&format!("UPDATE {REMINDERS} SET lock_time =")).now();
            upd.build(
                "WHERE uid=? AND msgid=? AND seqno=? AND (lock_time IS NULL OR lock_time <=",
                [
                    text(hex_enc(id.uid.as_bytes())),
                    text(hex_enc(id.msg_id.as_bytes())),
                    Value::Integer(i64::from(id.seqno)),
                ],
            );
            upd.time_or_offset(&lease_expired).push(") RETURNING lock_time");
            let locked = upd
                .query_rows(&tx, |row| time_from_value("lock_time", row.get_ref(0)?))?
                .into_iter()
                .next();
            // Someone else took it between the select and the update.
            let Some(lock_time) = locked else {
                continue;
            };
            reminder.lock_time = lock_time;
            claimed.push(reminder);
        }
        tx.commit()?;

        debug!(claimed = claimed.len(), limit, "leased reminders");
        Ok(ReminderSet {
            reminders: claimed,
            more_ready,
        })
    }

    fn delete_reminder(&self, id: &ReminderId) -> Result<()> {
        let mut qb = self.qb();
        qb.build(
            &format!("DELETE FROM {REMINDERS} WHERE uid=? AND msgid=? AND seqno=?"),
            [
                text(hex_enc(id.uid.as_bytes())),
                text(hex_enc(id.msg_id.as_bytes())),
                Value::Integer(i64::from(id.seqno)),
            ],
        );
        let conn = self.conn()?;
        qb.execute(&conn)?;
        Ok(())
    }

    fn init_state(&self, _state: &State) -> Result<()> {
        Err(StoreError::NonEphemeralInit)
    }

    fn clear(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for stmt in drop_statements()
            .into_iter()
            .chain(create_statements(self.writer.column_type()))
        {
            tx.execute_batch(&stmt)?;
        }
        tx.commit()?;
        debug!("cleared durable state");
        Ok(())
    }

    fn is_ephemeral(&self) -> bool {
        false
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}
