use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Opaque byte values. Equality is byte-exact; the serialized form is hex.
macro_rules! byte_value {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Vec<u8>);

        impl $name {
            /// Wrap raw bytes as-is. Use a [`crate::ValueFactory`] when the
            /// bytes come from outside and need validating.
            pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                hex::decode(&s).map(Self).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_value!(
    /// User the state belongs to.
    Uid
);
byte_value!(
    /// Message identifier; the idempotency key for creation.
    MsgId
);
byte_value!(DeviceId);
byte_value!(
    /// Payload the store never looks into.
    Body
);

/// Item category. Matching is lexical: exact for range dismissals, raw
/// string prefix for prefix queries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &Category) -> bool {
        self.0.starts_with(prefix.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An absolute time, or an offset resolved against the store's clock when
/// the value is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOrOffset {
    Time(DateTime<Utc>),
    Offset(#[serde(with = "offset_micros")] Duration),
}

impl TimeOrOffset {
    /// Offsets that land outside [`min_time`]..=[`max_time`] saturate.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeOrOffset::Time(t) => *t,
            TimeOrOffset::Offset(d) => match now.checked_add_signed(*d) {
                Some(t) => clamp_time(t),
                None if *d < Duration::zero() => min_time(),
                None => max_time(),
            },
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            TimeOrOffset::Time(t) => Some(*t),
            TimeOrOffset::Offset(_) => None,
        }
    }
}

/// Earliest storable time, 0001-01-01T00:00:00Z.
pub fn min_time() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(-62_135_596_800_000_000).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Latest storable time, 9999-12-31T23:59:59.999999Z. Four-digit years keep
/// text timestamps ordered the same way as the times they encode.
pub fn max_time() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(253_402_300_799_999_999).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn clamp_time(t: DateTime<Utc>) -> DateTime<Utc> {
    t.clamp(min_time(), max_time())
}

impl From<DateTime<Utc>> for TimeOrOffset {
    fn from(t: DateTime<Utc>) -> Self {
        TimeOrOffset::Time(t)
    }
}

impl From<Duration> for TimeOrOffset {
    fn from(d: Duration) -> Self {
        TimeOrOffset::Offset(d)
    }
}

mod offset_micros {
    use chrono::Duration;
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_microseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::microseconds(i64::deserialize(d)?))
    }
}

/// Message kind as persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Update,
    Sync,
}

impl MsgKind {
    pub fn as_i64(self) -> i64 {
        match self {
            MsgKind::Update => 1,
            MsgKind::Sync => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(MsgKind::Update),
            2 => Some(MsgKind::Sync),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub uid: Uid,
    pub msg_id: MsgId,
    /// `None` addresses every device of the user.
    pub device_id: Option<DeviceId>,
    /// `None` on input means "now"; stored and returned values always carry one.
    pub ctime: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(uid: Uid, msg_id: MsgId) -> Self {
        Self {
            uid,
            msg_id,
            device_id: None,
            ctime: None,
        }
    }

    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_ctime(mut self, ctime: DateTime<Utc>) -> Self {
        self.ctime = Some(ctime);
        self
    }
}

/// A unit of pending notification state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub metadata: Metadata,
    pub category: Category,
    pub body: Body,
    /// Dismissal time. On creation this is the item's self-declared expiry.
    pub dtime: Option<TimeOrOffset>,
    /// Reminder schedule; the index is the reminder's seqno and `None`
    /// slots are skipped. Query results leave this empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remind_times: Vec<Option<TimeOrOffset>>,
}

impl Item {
    pub fn new(metadata: Metadata, category: Category, body: Body) -> Self {
        Self {
            metadata,
            category,
            body,
            dtime: None,
            remind_times: Vec::new(),
        }
    }

    pub fn with_dtime(mut self, dtime: impl Into<TimeOrOffset>) -> Self {
        self.dtime = Some(dtime.into());
        self
    }

    pub fn with_remind_times(mut self, remind_times: Vec<Option<TimeOrOffset>>) -> Self {
        self.remind_times = remind_times;
        self
    }

    pub fn msg_id(&self) -> &MsgId {
        &self.metadata.msg_id
    }

    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.metadata.ctime
    }
}

/// Dismisses every item of exactly `category` created at or before `end_time`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRange {
    pub category: Category,
    pub end_time: TimeOrOffset,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dismissal {
    #[serde(default)]
    pub msg_ids: Vec<MsgId>,
    #[serde(default)]
    pub ranges: Vec<MsgRange>,
}

impl Dismissal {
    pub fn by_ids(msg_ids: Vec<MsgId>) -> Self {
        Self {
            msg_ids,
            ranges: Vec::new(),
        }
    }

    pub fn by_range(category: Category, end_time: impl Into<TimeOrOffset>) -> Self {
        Self {
            msg_ids: Vec::new(),
            ranges: vec![MsgRange {
                category,
                end_time: end_time.into(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msg_ids.is_empty() && self.ranges.is_empty()
    }
}

/// What a message does. An update always creates, dismisses, or both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Creation(Item),
    Dismissal(Dismissal),
    CreationAndDismissal(Item, Dismissal),
    Sync,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InBandMessage {
    pub metadata: Metadata,
    pub payload: Payload,
}

impl InBandMessage {
    /// Creation message carrying the item's own metadata.
    pub fn creation(item: Item) -> Self {
        Self {
            metadata: item.metadata.clone(),
            payload: Payload::Creation(item),
        }
    }

    pub fn dismissal(metadata: Metadata, dismissal: Dismissal) -> Self {
        Self {
            metadata,
            payload: Payload::Dismissal(dismissal),
        }
    }

    pub fn creation_and_dismissal(item: Item, dismissal: Dismissal) -> Self {
        Self {
            metadata: item.metadata.clone(),
            payload: Payload::CreationAndDismissal(item, dismissal),
        }
    }

    pub fn sync(metadata: Metadata) -> Self {
        Self {
            metadata,
            payload: Payload::Sync,
        }
    }

    pub fn kind(&self) -> MsgKind {
        match self.payload {
            Payload::Sync => MsgKind::Sync,
            _ => MsgKind::Update,
        }
    }

    pub fn creation_item(&self) -> Option<&Item> {
        match &self.payload {
            Payload::Creation(item) | Payload::CreationAndDismissal(item, _) => Some(item),
            Payload::Dismissal(_) | Payload::Sync => None,
        }
    }

    pub fn dismissal_part(&self) -> Option<&Dismissal> {
        match &self.payload {
            Payload::Dismissal(d) | Payload::CreationAndDismissal(_, d) => Some(d),
            Payload::Creation(_) | Payload::Sync => None,
        }
    }

    pub fn msg_id(&self) -> &MsgId {
        &self.metadata.msg_id
    }

    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.metadata.ctime
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderId {
    pub uid: Uid,
    pub msg_id: MsgId,
    pub seqno: u32,
}

/// "Re-deliver notice of `item` at `rtime`."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub item: Item,
    pub seqno: u32,
    pub rtime: DateTime<Utc>,
    /// Set while a poller holds the lease.
    pub lock_time: Option<DateTime<Utc>>,
}

impl Reminder {
    pub fn id(&self) -> ReminderId {
        ReminderId {
            uid: self.item.metadata.uid.clone(),
            msg_id: self.item.metadata.msg_id.clone(),
            seqno: self.seqno,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSet {
    pub reminders: Vec<Reminder>,
    /// The claim hit its batch limit; more reminders may be due.
    pub more_ready: bool,
}

/// Items visible to one (uid, device, time) query, in ascending ctime order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    items: Vec<Item>,
}

impl State {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Item> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get_item(&self, msg_id: &MsgId) -> Option<&Item> {
        self.items.iter().find(|i| i.msg_id() == msg_id)
    }

    pub fn items_with_category_prefix(&self, prefix: &Category) -> Vec<&Item> {
        self.items
            .iter()
            .filter(|i| i.category.has_prefix(prefix))
            .collect()
    }
}
