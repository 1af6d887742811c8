//! Ephemeral reference engine.
//!
//! One map per engine, keyed by uid, behind a single mutex: every operation
//! on the store is serialized. Queries are linear scans over a user's items
//! and message log. Reminder leasing is a durable-engine feature; here it is
//! a no-op.

use super::StateMachine;
use super::validate;
use crate::clock::Clock;
use crate::dismissal::device_matches;
use crate::dismissal::dismissed_at;
use crate::dismissal::earliest;
use crate::dismissal::visible_at;
use crate::error::Result;
use crate::error::StoreError;
use crate::types::Category;
use crate::types::DeviceId;
use crate::types::Dismissal;
use crate::types::InBandMessage;
use crate::types::Item;
use crate::types::Metadata;
use crate::types::MsgId;
use crate::types::MsgRange;
use crate::types::Payload;
use crate::types::ReminderId;
use crate::types::ReminderSet;
use crate::types::State;
use crate::types::TimeOrOffset;
use crate::types::Uid;
use crate::types::clamp_time;
use chrono::DateTime;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tracing::debug;

#[derive(Debug)]
struct LoggedMessage {
    message: InBandMessage,
    /// Index into `UserRecord::items` of the item this message created.
    created: Option<usize>,
}

#[derive(Debug, Default)]
struct UserRecord {
    items: Vec<Item>,
    log: Vec<LoggedMessage>,
}

impl UserRecord {
    fn logged(&self, msg_id: &MsgId) -> Option<&LoggedMessage> {
        self.log.iter().find(|l| l.message.msg_id() == msg_id)
    }

    /// Insert unless an item with the same msgid exists; returns its index.
    fn add_item(&mut self, item: Item) -> usize {
        if let Some(idx) = self.items.iter().position(|i| i.msg_id() == item.msg_id()) {
            return idx;
        }
        self.items.push(item);
        self.items.len() - 1
    }

    fn set_dtime(item: &mut Item, dtime: DateTime<Utc>) {
        let existing = item.dtime.and_then(|d| d.as_time());
        item.dtime = Some(TimeOrOffset::Time(earliest(existing, dtime)));
    }

    fn dismiss(&mut self, dismissal: &Dismissal, ctime: DateTime<Utc>) {
        for target in &dismissal.msg_ids {
            for item in self.items.iter_mut().filter(|i| i.msg_id() == target) {
                Self::set_dtime(item, ctime);
            }
        }
        for range in &dismissal.ranges {
            // Range end times are resolved before the message is logged.
            let Some(end) = range.end_time.as_time() else {
                continue;
            };
            for item in self.items.iter_mut().filter(|i| {
                i.category == range.category && i.ctime().is_some_and(|c| c <= end)
            }) {
                Self::set_dtime(item, ctime);
            }
        }
    }
}

#[derive(Debug)]
pub struct MemEngine {
    users: Mutex<HashMap<Uid, UserRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn users(&self) -> Result<MutexGuard<'_, HashMap<Uid, UserRecord>>> {
        self.users.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Pin every time in `msg` to an absolute value so the log replays the
    /// same way regardless of when it is read.
    fn resolve(msg: &InBandMessage, now: DateTime<Utc>) -> InBandMessage {
        let metadata = Metadata {
            ctime: Some(clamp_time(msg.metadata.ctime.unwrap_or(now))),
            ..msg.metadata.clone()
        };
        let resolve_item = |item: &Item| Item {
            metadata: metadata.clone(),
            category: item.category.clone(),
            body: item.body.clone(),
            dtime: item.dtime.map(|d| TimeOrOffset::Time(clamp_time(d.resolve(now)))),
            remind_times: Vec::new(),
        };
        let resolve_dismissal = |d: &Dismissal| {
            let mut msg_ids: Vec<MsgId> = Vec::with_capacity(d.msg_ids.len());
            for id in &d.msg_ids {
                if !msg_ids.contains(id) {
                    msg_ids.push(id.clone());
                }
            }
            let mut ranges: Vec<MsgRange> = Vec::with_capacity(d.ranges.len());
            for r in &d.ranges {
                let resolved = MsgRange {
                    category: r.category.clone(),
                    end_time: TimeOrOffset::Time(clamp_time(r.end_time.resolve(now))),
                };
                if !ranges.contains(&resolved) {
                    ranges.push(resolved);
                }
            }
            Dismissal { msg_ids, ranges }
        };
        let payload = match &msg.payload {
            Payload::Creation(item) => Payload::Creation(resolve_item(item)),
            Payload::Dismissal(d) => Payload::Dismissal(resolve_dismissal(d)),
            Payload::CreationAndDismissal(item, d) => {
                Payload::CreationAndDismissal(resolve_item(item), resolve_dismissal(d))
            }
            Payload::Sync => Payload::Sync,
        };
        InBandMessage { metadata, payload }
    }

    fn items(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
        prefix: Option<&Category>,
    ) -> Result<State> {
        let now = self.clock.now();
        let t = t.map_or(now, |t| t.resolve(now));
        let users = self.users()?;
        let Some(user) = users.get(uid) else {
            return Ok(State::default());
        };
        let mut items: Vec<Item> = user
            .items
            .iter()
            .filter(|i| visible_at(i, device, t, now))
            .filter(|i| prefix.is_none_or(|p| i.category.has_prefix(p)))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.ctime());
        Ok(State::new(items))
    }
}

impl StateMachine for MemEngine {
    fn consume_message(&self, msg: &InBandMessage) -> Result<DateTime<Utc>> {
        validate(msg)?;
        let now = self.clock.now();
        let mut users = self.users()?;
        let user = users.entry(msg.metadata.uid.clone()).or_default();

        if let Some(existing) = user.logged(msg.msg_id()) {
            debug!(msgid = %msg.msg_id(), "duplicate message ignored");
            return Ok(existing.message.ctime().unwrap_or(now));
        }

        let message = Self::resolve(msg, now);
        let ctime = message.ctime().unwrap_or(now);
        let created = message.creation_item().cloned().map(|item| user.add_item(item));
        if let Some(dismissal) = message.dismissal_part() {
            user.dismiss(dismissal, ctime);
        }
        debug!(
            uid = %message.metadata.uid,
            msgid = %message.msg_id(),
            kind = ?message.kind(),
            "consumed message"
        );
        user.log.push(LoggedMessage { message, created });
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
        let now = self.clock.now();
        let users = self.users()?;
        let Some(user) = users.get(uid) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for logged in &user.log {
            let msg = &logged.message;
            if msg.ctime().is_none_or(|c| c < since)
                || !device_matches(msg.metadata.device_id.as_ref(), device)
            {
                continue;
            }
            let current = logged.created.and_then(|idx| user.items.get(idx));
            let payload = match (&msg.payload, current) {
                (Payload::Creation(_), Some(item)) if dismissed_at(item, now, now) => continue,
                (Payload::CreationAndDismissal(_, d), Some(item)) if dismissed_at(item, now, now) => {
                    Payload::Dismissal(d.clone())
                }
                (Payload::Creation(_), Some(item)) => Payload::Creation(item.clone()),
                (Payload::CreationAndDismissal(_, d), Some(item)) => {
                    Payload::CreationAndDismissal(item.clone(), d.clone())
                }
                (payload, _) => payload.clone(),
            };
            out.push(InBandMessage {
                metadata: msg.metadata.clone(),
                payload,
            });
        }
        out.sort_by_key(InBandMessage::ctime);
        Ok(out)
    }

    fn latest_ctime(&self, uid: &Uid, device: Option<&DeviceId>) -> Result<Option<DateTime<Utc>>> {
        let users = self.users()?;
        Ok(users.get(uid).and_then(|user| {
            user.log
                .iter()
                .filter(|l| device_matches(l.message.metadata.device_id.as_ref(), device))
                .filter_map(|l| l.message.ctime())
                .max()
        }))
    }

    fn reminders(&self, _max: usize) -> Result<ReminderSet> {
        Ok(ReminderSet::default())
    }

    fn delete_reminder(&self, _id: &ReminderId) -> Result<()> {
        Ok(())
    }

    fn init_state(&self, state: &State) -> Result<()> {
        let now = self.clock.now();
        let mut users = self.users()?;
        users.clear();
        for item in state.items() {
            let message = Self::resolve(&InBandMessage::creation(item.clone()), now);
            let user = users.entry(item.metadata.uid.clone()).or_default();
            if user.logged(message.msg_id()).is_some() {
                continue;
            }
            let created = message.creation_item().cloned().map(|i| user.add_item(i));
            user.log.push(LoggedMessage { message, created });
        }
        debug!(items = state.len(), "initialized ephemeral state");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.users()?.clear();
        debug!("cleared ephemeral state");
        Ok(())
    }

    fn is_ephemeral(&self) -> bool {
        true
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}
