//! Relational layout. Identifier columns hold lowercase hex; time columns use
//! whatever type the engine's time writer asks for.

pub const MESSAGES: &str = "notify_messages";
pub const ITEMS: &str = "notify_items";
pub const DISMISSALS_BY_ID: &str = "notify_dismissals_by_id";
pub const DISMISSALS_BY_TIME: &str = "notify_dismissals_by_time";
pub const REMINDERS: &str = "notify_reminders";

/// Statements creating every table and index; safe to re-run.
pub fn create_statements(time_type: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {MESSAGES} (
                uid TEXT NOT NULL,
                msgid TEXT NOT NULL,
                mtype INTEGER NOT NULL,
                devid TEXT,
                ctime {time_type} NOT NULL,
                PRIMARY KEY (uid, msgid)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{MESSAGES}_ctime ON {MESSAGES}(uid, ctime)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {ITEMS} (
                uid TEXT NOT NULL,
                msgid TEXT NOT NULL,
                category TEXT NOT NULL,
                body BLOB NOT NULL,
                dtime {time_type},
                PRIMARY KEY (uid, msgid)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{ITEMS}_category ON {ITEMS}(uid, category)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {DISMISSALS_BY_ID} (
                uid TEXT NOT NULL,
                msgid TEXT NOT NULL,
                dmsgid TEXT NOT NULL,
                PRIMARY KEY (uid, msgid, dmsgid)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {DISMISSALS_BY_TIME} (
                uid TEXT NOT NULL,
                msgid TEXT NOT NULL,
                category TEXT NOT NULL,
                dtime {time_type} NOT NULL,
                PRIMARY KEY (uid, msgid, category, dtime)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {REMINDERS} (
                uid TEXT NOT NULL,
                msgid TEXT NOT NULL,
                seqno INTEGER NOT NULL,
                rtime {time_type} NOT NULL,
                lock_time {time_type},
                PRIMARY KEY (uid, msgid, seqno)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{REMINDERS}_rtime ON {REMINDERS}(rtime)"),
    ]
}

pub fn drop_statements() -> Vec<String> {
    [
        REMINDERS,
        DISMISSALS_BY_TIME,
        DISMISSALS_BY_ID,
        ITEMS,
        MESSAGES,
    ]
    .iter()
    .map(|t| format!("DROP TABLE IF EXISTS {t}"))
    .collect()
}
