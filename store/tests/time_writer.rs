#![cfg(feature = "sqlite")]

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use notify_store::factory::TimeEncoding;
use notify_store::store::time_writer::writer_for;
use notify_store::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn uid() -> Uid {
    Uid::from_bytes(b"user".to_vec())
}

fn mid(n: u8) -> MsgId {
    MsgId::from_bytes(vec![n; 8])
}

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn micros(us: i64) -> DateTime<Utc> {
    base() + Duration::microseconds(us)
}

fn create(n: u8, ctime: Option<DateTime<Utc>>, category: &str, dtime: Option<TimeOrOffset>) -> InBandMessage {
    let mut metadata = Metadata::new(uid(), mid(n));
    metadata.ctime = ctime;
    let mut item = Item::new(metadata, Category::new(category), Body::from_bytes(vec![n]));
    item.dtime = dtime;
    InBandMessage::creation(item)
}

fn engines(clock: &Arc<FakeClock>) -> Vec<(&'static str, Box<dyn StateMachine>)> {
    let sql = |encoding: TimeEncoding| -> Box<dyn StateMachine> {
        Box::new(
            SqlEngine::open_in_memory(
                Arc::new(OpaqueValues::new()),
                writer_for(encoding),
                clock.clone(),
            )
            .unwrap(),
        )
    };
    vec![
        ("native", sql(TimeEncoding::Native)),
        ("micros", sql(TimeEncoding::Micros)),
        (
            "memory",
            Box::new(MemEngine::new(clock.clone())) as Box<dyn StateMachine>,
        ),
    ]
}

type Views = (
    Vec<State>,
    State,
    Vec<InBandMessage>,
    Option<DateTime<Utc>>,
);

fn views(store: &dyn StateMachine) -> Views {
    let at = |us: i64| Some(TimeOrOffset::Time(micros(us)));
    let states = [None, at(200), at(500), at(5_000_000)]
        .into_iter()
        .map(|t| store.state(&uid(), None, t).unwrap())
        .collect();
    (
        states,
        store
            .state_by_category_prefix(&uid(), None, at(5_000_000), &Category::new("alerts/"))
            .unwrap(),
        store.in_band_messages_since(&uid(), None, micros(0)).unwrap(),
        store.latest_ctime(&uid(), None).unwrap(),
    )
}

fn ids(state: &State) -> Vec<MsgId> {
    state.items().iter().map(|i| i.msg_id().clone()).collect()
}

/// Every encoding, and the memory engine, give identical answers for the
/// same history read through the same clock.
#[test]
fn encodings_agree_to_the_microsecond() {
    let clock = Arc::new(FakeClock::new(micros(2_000_300)));
    let history = vec![
        create(1, Some(micros(500)), "alerts", None),
        create(2, None, "alerts/db", Some(TimeOrOffset::Offset(Duration::hours(1)))),
        create(3, Some(micros(1_000_000)), "alerts", Some(TimeOrOffset::Offset(Duration::minutes(-1)))),
        create(4, Some(micros(3_000_000)), "news", None),
        create(
            8,
            Some(micros(4_000_000)),
            "far",
            Some(TimeOrOffset::Offset(Duration::days(3_650_000))),
        ),
        InBandMessage::dismissal(
            Metadata::new(uid(), mid(5)).with_ctime(micros(10_000_000)),
            Dismissal::by_range(Category::new("alerts"), TimeOrOffset::Offset(Duration::zero())),
        ),
        InBandMessage::dismissal(
            Metadata::new(uid(), mid(6)).with_ctime(micros(20_000_000)),
            Dismissal::by_ids(vec![mid(4)]),
        ),
        InBandMessage::sync(Metadata::new(uid(), mid(7)).with_ctime(micros(30_000_000))),
    ];

    let engines = engines(&clock);
    for (name, store) in &engines {
        clock.set(micros(2_000_300));
        let ctimes: Vec<DateTime<Utc>> = history
            .iter()
            .map(|msg| store.consume_message(msg).unwrap())
            .collect();
        assert_eq!(ctimes[0], micros(500), "{name}");
        assert_eq!(ctimes[1], micros(2_000_300), "{name}");
    }

    clock.set(micros(100_000_000));
    let all: Vec<(&str, Views)> = engines
        .iter()
        .map(|(name, store)| (*name, views(store.as_ref())))
        .collect();

    let (_, expected) = &all[0];
    let (states, prefixed, replay, latest) = expected;
    assert_eq!(ids(&states[0]), vec![mid(2), mid(8)]);
    assert_eq!(ids(&states[1]), Vec::<MsgId>::new());
    assert_eq!(ids(&states[2]), vec![mid(1)]);
    assert_eq!(ids(&states[3]), vec![mid(1), mid(2), mid(4), mid(8)]);
    assert_eq!(
        states[0].get_item(&mid(8)).unwrap().dtime,
        Some(TimeOrOffset::Time(max_time()))
    );
    assert_eq!(states[2].get_item(&mid(1)).unwrap().ctime(), Some(micros(500)));
    assert_eq!(ids(prefixed), vec![mid(2)]);
    assert_eq!(
        replay.iter().map(|m| m.msg_id().clone()).collect::<Vec<_>>(),
        vec![mid(2), mid(8), mid(5), mid(6), mid(7)]
    );
    assert_eq!(*latest, Some(micros(30_000_000)));

    for (name, got) in &all[1..] {
        assert_eq!(got, expected, "{name} disagrees with native");
    }
}

#[test]
fn native_encoding_follows_the_injected_clock() {
    let long_ago = DateTime::from_timestamp(1_000_000_000, 123_456_000).unwrap();
    let clock = Arc::new(FakeClock::new(long_ago));
    let store = SqlEngine::open_in_memory(
        Arc::new(OpaqueValues::new()),
        writer_for(TimeEncoding::Native),
        clock.clone(),
    )
    .unwrap();

    let ctime = store
        .consume_message(&create(1, None, "c", Some(TimeOrOffset::Offset(Duration::seconds(10)))))
        .unwrap();
    assert_eq!(ctime, long_ago);

    assert_eq!(store.state(&uid(), None, None).unwrap().len(), 1);
    clock.advance(Duration::seconds(10));
    assert!(store.state(&uid(), None, None).unwrap().is_empty());
}
