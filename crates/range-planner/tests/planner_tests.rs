use std::collections::BTreeSet;

use proptest::prelude::*;
use range_planner::{RangePlanner, ReadPlanRange};

fn set(addresses: &[u16]) -> BTreeSet<u16> {
    addresses.iter().copied().collect()
}

#[test]
fn splits_when_gap_exceeds_tolerance() {
    let planner = RangePlanner::new(10, 2);
    let plan = planner.plan(&set(&[0, 1, 2, 5, 20]));
    assert_eq!(
        plan,
        vec![
            ReadPlanRange::new(0, 3),
            ReadPlanRange::new(5, 1),
            ReadPlanRange::new(20, 1),
        ]
    );
}

#[test]
fn gap_equal_to_tolerance_is_read_across() {
    let planner = RangePlanner::new(10, 3);
    let plan = planner.plan(&set(&[0, 1, 2, 5, 20]));
    assert_eq!(plan, vec![ReadPlanRange::new(0, 6), ReadPlanRange::new(20, 1)]);
}

#[test]
fn span_limit_is_inclusive() {
    let planner = RangePlanner::new(4, 10);
    let plan = planner.plan(&set(&[10, 13, 14]));
    assert_eq!(plan, vec![ReadPlanRange::new(10, 4), ReadPlanRange::new(14, 1)]);
}

#[test]
fn single_and_empty_inputs() {
    let planner = RangePlanner::new(50, 5);
    assert!(planner.plan(&BTreeSet::new()).is_empty());
    assert_eq!(planner.plan(&set(&[31_000])), vec![ReadPlanRange::new(31_000, 1)]);
}

#[test]
fn full_map_does_not_overflow() {
    let planner = RangePlanner::new(u16::MAX, 1);
    let addresses = (0..=u16::MAX).collect::<BTreeSet<_>>();
    let plan = planner.plan(&addresses);
    assert_eq!(
        plan,
        vec![ReadPlanRange::new(0, u16::MAX), ReadPlanRange::new(u16::MAX, 1)]
    );
    assert_eq!(plan[1].end_address(), u32::from(u16::MAX));
}

#[test]
fn wide_entries_are_not_split() {
    let planner = RangePlanner::new(4, 1);
    // 100 is a two-register value; 102..104 a three-register one.
    let plan = planner.plan_spans([(100, 2), (102, 3), (105, 1)]);
    assert_eq!(plan, vec![ReadPlanRange::new(100, 2), ReadPlanRange::new(102, 4)]);
    assert!(plan[1].contains(102, 3));
}

#[test]
fn overlapping_spans_stay_in_one_range() {
    let planner = RangePlanner::new(4, 1);
    let plan = planner.plan_spans([(0, 3), (2, 4)]);
    assert_eq!(plan, vec![ReadPlanRange::new(0, 6)]);
    assert!(plan[0].contains(0, 3));
    assert!(plan[0].contains(2, 4));

    let plan = planner.plan_spans([(0, 2), (1, 2), (10, 1)]);
    assert_eq!(plan, vec![ReadPlanRange::new(0, 3), ReadPlanRange::new(10, 1)]);
}

#[test]
fn empty_range_covers_nothing() {
    let empty = ReadPlanRange {
        start_address: 0,
        count: 0,
    };
    assert_eq!(empty.end_address(), 0);
    assert!(!empty.contains(0, 1));
    assert_eq!(ReadPlanRange::new(7, 0).count, 1);
}

#[test]
fn forbidden_regions_are_not_read_across() {
    let planner = RangePlanner::new(100, 20).with_no_read_across([11_010..=11_012]);
    let plan = planner.plan(&set(&[11_000, 11_005, 11_020, 11_025]));
    assert_eq!(
        plan,
        vec![ReadPlanRange::new(11_000, 6), ReadPlanRange::new(11_020, 6)]
    );
}

proptest! {
    #[test]
    fn plan_is_sorted_disjoint_covering_and_bounded(
        addresses in proptest::collection::btree_set(any::<u16>(), 1..200),
        max_span in 1u16..200,
        max_gap in 0u16..50,
    ) {
        let planner = RangePlanner::new(max_span, max_gap);
        let plan = planner.plan(&addresses);

        for pair in plan.windows(2) {
            prop_assert!(pair[0].end_address() < u32::from(pair[1].start_address));
        }
        for range in &plan {
            prop_assert!(range.count >= 1);
            prop_assert!(range.count <= max_span);
        }
        for address in &addresses {
            let covering = plan.iter().filter(|range| range.contains(*address, 1)).count();
            prop_assert_eq!(covering, 1);
        }
    }

    #[test]
    fn every_span_is_read_by_exactly_one_range(
        spans in proptest::collection::vec((0u16..5_000, 1u16..8), 1..100),
        max_span in 1u16..64,
        max_gap in 0u16..20,
    ) {
        let planner = RangePlanner::new(max_span, max_gap);
        let plan = planner.plan_spans(spans.iter().copied());

        for pair in plan.windows(2) {
            prop_assert!(pair[0].end_address() < u32::from(pair[1].start_address));
        }
        for (address, width) in &spans {
            let covering = plan.iter().filter(|range| range.contains(*address, *width)).count();
            prop_assert_eq!(covering, 1);
        }
    }

    #[test]
    fn plan_is_deterministic(addresses in proptest::collection::btree_set(0u16..2_000, 0..100)) {
        let planner = RangePlanner::new(32, 4);
        prop_assert_eq!(planner.plan(&addresses), planner.plan(&addresses));
    }
}
