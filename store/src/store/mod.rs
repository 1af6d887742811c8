use crate::clock::Clock;
use crate::error::Result;
use crate::error::StoreError;
use crate::types::Category;
use crate::types::DeviceId;
use crate::types::InBandMessage;
use crate::types::ReminderId;
use crate::types::ReminderSet;
use crate::types::State;
use crate::types::TimeOrOffset;
use crate::types::Uid;
use chrono::DateTime;
use chrono::Utc;
use std::sync::Arc;

/// Upper bound on one reminder claim; `0` also means this.
pub const MAX_REMINDERS: usize = 1000;

/// How long a claimed reminder stays leased before another poller may take it.
pub const DEFAULT_LEASE_SECS: i64 = 10 * 60;

/// The contract both engines implement identically.
pub trait StateMachine: Send + Sync {
    /// Apply a message's creation, then its dismissal, all or nothing.
    /// Returns the stored ctime. A repeated msgid is a no-op that returns
    /// the ctime stored the first time.
    fn consume_message(&self, msg: &InBandMessage) -> Result<DateTime<Utc>>;

    /// Items visible to `uid` on `device` at `t` (default: now).
    fn state(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
    ) -> Result<State>;

    fn state_by_category_prefix(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        t: Option<TimeOrOffset>,
        prefix: &Category,
    ) -> Result<State>;

    /// Message log with `ctime >= since`, ascending. Creations whose item is
    /// already dismissed are left out; the dismissing messages are not.
    fn in_band_messages_since(
        &self,
        uid: &Uid,
        device: Option<&DeviceId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<InBandMessage>>;

    fn latest_ctime(&self, uid: &Uid, device: Option<&DeviceId>) -> Result<Option<DateTime<Utc>>>;

    /// Lease up to `max` due reminders.
    fn reminders(&self, max: usize) -> Result<ReminderSet>;

    fn delete_reminder(&self, id: &ReminderId) -> Result<()>;

    /// Bulk load. Durable engines refuse with [`StoreError::NonEphemeralInit`].
    fn init_state(&self, state: &State) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn is_ephemeral(&self) -> bool;

    fn clock(&self) -> Arc<dyn Clock>;
}

/// Checks done before any mutation.
pub(crate) fn validate(msg: &InBandMessage) -> Result<()> {
    let md = &msg.metadata;
    if md.msg_id.is_empty() {
        return Err(StoreError::Validation("nil MsgID".to_string()));
    }
    if md.uid.is_empty() {
        return Err(StoreError::Validation("nil UID".to_string()));
    }
    if let Some(item) = msg.creation_item()
        && (item.metadata.uid != md.uid || item.metadata.msg_id != md.msg_id)
    {
        return Err(StoreError::Validation(
            "creation metadata does not match message".to_string(),
        ));
    }
    if msg.dismissal_part().is_some_and(|d| d.is_empty()) {
        return Err(StoreError::Validation(
            "dismissal has nothing to dismiss".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn clamp_reminder_limit(max: usize) -> usize {
    if max == 0 || max > MAX_REMINDERS {
        MAX_REMINDERS
    } else {
        max
    }
}

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod query;
#[cfg(feature = "sqlite")]
mod scan;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlite")]
pub mod time_writer;
