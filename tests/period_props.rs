use banwatch::models::BanEvent;
use banwatch::period::{aggregate, bucket_counts, comparison_window, Granularity, Period};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn min_ts() -> i64 {
    DateTime::<Utc>::MIN_UTC.timestamp()
}

fn max_ts() -> i64 {
    DateTime::<Utc>::MAX_UTC.timestamp()
}

// Two years either side of the calendar edges
const EDGE: i64 = 2 * 366 * 86_400;

/// Anywhere chrono can represent, with the edges drawn often
fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    prop_oneof![
        2 => min_ts()..=max_ts(),
        1 => min_ts()..=min_ts() + EDGE,
        1 => max_ts() - EDGE..=max_ts(),
        2 => 631_152_000i64..4_102_444_800,
    ]
    .prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn granularity() -> impl Strategy<Value = Granularity> {
    prop::sample::select(Granularity::ALL.to_vec())
}

proptest! {
    #[test]
    fn period_contains_its_reference(g in granularity(), t in instant()) {
        match Period::containing(g, t) {
            Ok(p) => {
                prop_assert!(p.start <= t && t < p.end);
                prop_assert!(p.contains(t));
                prop_assert_eq!(Period::containing(g, p.start).unwrap(), p);
            }
            // Only a period reaching past the calendar edge may be missing
            Err(_) => prop_assert!(
                t.timestamp() - min_ts() < EDGE || max_ts() - t.timestamp() < EDGE
            ),
        }
    }

    #[test]
    fn neighbours_are_adjacent(g in granularity(), t in instant()) {
        let Ok(p) = Period::containing(g, t) else {
            return Ok(());
        };
        if let Some(prev) = p.previous() {
            prop_assert_eq!(prev.end, p.start);
            prop_assert_eq!(prev.next(), Some(p));
        }
        if let Some(next) = p.next() {
            prop_assert_eq!(next.start, p.end);
            prop_assert_eq!(next.previous(), Some(p));
        }
    }

    #[test]
    fn buckets_tile_the_period(g in granularity(), t in instant()) {
        let Ok(p) = Period::containing(g, t) else {
            return Ok(());
        };
        let buckets = p.buckets();
        prop_assert!(!buckets.is_empty());
        prop_assert_eq!(buckets[0].0, p.start);
        prop_assert_eq!(buckets[buckets.len() - 1].1, p.end);
        for pair in buckets.windows(2) {
            prop_assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn aggregate_counts_each_event_once(
        g in granularity(),
        reference in instant(),
        offsets in prop::collection::vec(-40_000_000i64..40_000_000, 0..60),
    ) {
        let events: Vec<BanEvent> = offsets
            .iter()
            .filter_map(|o| reference.checked_add_signed(Duration::seconds(*o)))
            .map(|ts| BanEvent::new(ts, "192.0.2.1".parse().unwrap(), "sshd"))
            .collect();

        let Ok((current, previous)) = comparison_window(g, reference) else {
            prop_assert!(aggregate(&events, g, reference).is_err());
            return Ok(());
        };
        let stats = aggregate(&events, g, reference).unwrap();
        prop_assert_eq!(stats.previous_period(), previous);

        let expected_current = events.iter().filter(|e| current.contains(e.timestamp)).count() as u64;
        let expected_previous = events.iter().filter(|e| previous.contains(e.timestamp)).count() as u64;
        prop_assert_eq!(stats.count, expected_current);
        prop_assert_eq!(stats.previous_count, expected_previous);

        let buckets = bucket_counts(events.iter().map(|e| e.timestamp), &current);
        prop_assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), expected_current);
    }
}

#[test]
fn empty_input_yields_zeros() {
    let reference = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
    for g in Granularity::ALL {
        let stats = aggregate(std::iter::empty::<&BanEvent>(), g, reference).unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.previous_count, 0);
        assert_eq!(stats.percent_change(), 0.0);
    }
}

#[test]
fn calendar_edges_are_errors_not_panics() {
    for t in [DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC] {
        for g in Granularity::ALL {
            assert!(aggregate(std::iter::empty::<&BanEvent>(), g, t).is_err(), "{g} at {t}");
        }
    }
}
