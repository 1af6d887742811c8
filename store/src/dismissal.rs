//! Time and dismissal rules shared by both engines.

use crate::types::DeviceId;
use crate::types::InBandMessage;
use crate::types::Item;
use crate::types::MsgId;
use chrono::DateTime;
use chrono::Utc;
use std::collections::HashMap;

/// A `None` query device matches everything; otherwise an item matches when
/// it addresses all devices or exactly the queried one.
pub fn device_matches(item_device: Option<&DeviceId>, query: Option<&DeviceId>) -> bool {
    match (query, item_device) {
        (None, _) | (Some(_), None) => true,
        (Some(q), Some(d)) => q == d,
    }
}

/// Whether `item` is dismissed as of `t`. An offset dtime is resolved
/// against `now`.
pub fn dismissed_at(item: &Item, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    item.dtime.is_some_and(|d| d.resolve(now) <= t)
}

/// Visible iff `ctime <= t`, not dismissed at `t`, and addressed to `device`.
pub fn visible_at(
    item: &Item,
    device: Option<&DeviceId>,
    t: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let created = item.ctime().is_some_and(|c| c <= t);
    created
        && !dismissed_at(item, t, now)
        && device_matches(item.metadata.device_id.as_ref(), device)
}

/// DTime only ever moves earlier.
pub fn earliest(existing: Option<DateTime<Utc>>, new: DateTime<Utc>) -> DateTime<Utc> {
    match existing {
        Some(e) if e <= new => e,
        _ => new,
    }
}

/// Drop messages that dismiss, by id, something created after `cutoff`.
///
/// `known` holds the locally known messages by id. A target missing from it
/// is assumed to predate the cutoff. Range dismissals carry their own bound
/// and never cause a drop.
pub fn filter_future_dismissals(
    msgs: Vec<InBandMessage>,
    known: &HashMap<MsgId, InBandMessage>,
    cutoff: DateTime<Utc>,
) -> Vec<InBandMessage> {
    msgs.into_iter()
        .filter(|msg| {
            let Some(dismissal) = msg.dismissal_part() else {
                return true;
            };
            dismissal.msg_ids.iter().all(|target| {
                known
                    .get(target)
                    .and_then(InBandMessage::ctime)
                    .is_none_or(|ctime| ctime <= cutoff)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Body;
    use crate::types::Category;
    use crate::types::Dismissal;
    use crate::types::Metadata;
    use crate::types::TimeOrOffset;
    use crate::types::Uid;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn md(id: u8, ctime: i64) -> Metadata {
        Metadata::new(Uid::from_bytes(vec![1; 4]), MsgId::from_bytes(vec![id; 4]))
            .with_ctime(at(ctime))
    }

    fn creation(id: u8, ctime: i64) -> InBandMessage {
        InBandMessage::creation(Item::new(
            md(id, ctime),
            Category::new("c"),
            Body::from_bytes(b"x".to_vec()),
        ))
    }

    fn dismiss(id: u8, ctime: i64, target: u8) -> InBandMessage {
        InBandMessage::dismissal(
            md(id, ctime),
            Dismissal::by_ids(vec![MsgId::from_bytes(vec![target; 4])]),
        )
    }

    fn known(msgs: &[InBandMessage]) -> HashMap<MsgId, InBandMessage> {
        msgs.iter().map(|m| (m.msg_id().clone(), m.clone())).collect()
    }

    #[test]
    fn drops_dismissal_of_item_created_after_cutoff() {
        let m1 = creation(1, 9);
        let m2 = dismiss(2, 10, 1);
        let out = filter_future_dismissals(vec![m2], &known(&[m1]), at(7));
        assert!(out.is_empty());
    }

    #[test]
    fn keeps_dismissal_of_item_created_before_cutoff() {
        let m1 = creation(1, 5);
        let m2 = dismiss(2, 10, 1);
        let out = filter_future_dismissals(vec![m2.clone()], &known(&[m1]), at(7));
        assert_eq!(out, vec![m2]);
    }

    #[test]
    fn keeps_dismissal_of_unknown_target_and_ranges() {
        let m2 = dismiss(2, 10, 9);
        let range = InBandMessage::dismissal(
            md(3, 11),
            Dismissal::by_range(Category::new("c"), at(100)),
        );
        let out = filter_future_dismissals(vec![m2.clone(), range.clone()], &HashMap::new(), at(0));
        assert_eq!(out, vec![m2, range]);
    }

    #[test]
    fn device_rule() {
        let d1 = DeviceId::from_bytes(vec![1]);
        let d2 = DeviceId::from_bytes(vec![2]);
        assert!(device_matches(None, Some(&d1)));
        assert!(device_matches(Some(&d1), None));
        assert!(device_matches(Some(&d1), Some(&d1)));
        assert!(!device_matches(Some(&d1), Some(&d2)));
    }

    #[test]
    fn visibility_window_is_half_open() {
        let item = Item::new(md(1, 10), Category::new("c"), Body::from_bytes(Vec::new()))
            .with_dtime(at(20));
        let now = at(100);
        assert!(!visible_at(&item, None, at(9), now));
        assert!(visible_at(&item, None, at(10), now));
        assert!(visible_at(&item, None, at(19), now));
        assert!(!visible_at(&item, None, at(20), now));
    }

    #[test]
    fn offset_dtime_resolves_against_now() {
        let item = Item::new(md(1, 0), Category::new("c"), Body::from_bytes(Vec::new()))
            .with_dtime(TimeOrOffset::Offset(Duration::seconds(30)));
        assert!(!dismissed_at(&item, at(29), at(0)));
        assert!(dismissed_at(&item, at(30), at(0)));
    }

    #[test]
    fn earliest_never_moves_later() {
        assert_eq!(earliest(None, at(5)), at(5));
        assert_eq!(earliest(Some(at(3)), at(5)), at(3));
        assert_eq!(earliest(Some(at(8)), at(5)), at(5));
    }
}
