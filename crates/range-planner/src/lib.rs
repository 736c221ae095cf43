use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use tracing::debug;

/// One contiguous range read.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadPlanRange {
    pub start_address: u16,
    pub count: u16,
}

impl ReadPlanRange {
    /// A range always reads at least one register.
    pub fn new(start_address: u16, count: u16) -> Self {
        Self {
            start_address,
            count: count.max(1),
        }
    }

    /// Last address covered, computed wide so a range ending at 65535 is fine.
    /// An empty range reports its start address.
    pub fn end_address(&self) -> u32 {
        (u32::from(self.start_address) + u32::from(self.count)).saturating_sub(1)
    }

    pub fn contains(&self, address: u16, width: u16) -> bool {
        self.count > 0
            && address >= self.start_address
            && u32::from(address) + u32::from(width.max(1)) - 1 <= self.end_address()
    }
}

/// Batches register addresses into as few range reads as possible.
///
/// `max_gap` is the largest distance between the last address of a range and
/// the next requested address that is still read across; adjacent addresses
/// have a distance of 1 and the boundary is inclusive. `max_span` bounds the
/// number of registers in one read. Ranges never extend across a
/// `no_read_across` region, since some inverters reject reads touching them.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePlanner {
    pub max_span: u16,
    pub max_gap: u16,
    pub no_read_across: Vec<RangeInclusive<u16>>,
}

impl RangePlanner {
    pub fn new(max_span: u16, max_gap: u16) -> Self {
        Self {
            max_span: max_span.max(1),
            max_gap,
            no_read_across: Vec::new(),
        }
    }

    pub fn with_no_read_across(mut self, regions: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        self.no_read_across.extend(regions);
        self
    }

    /// Plans single-register addresses.
    pub fn plan(&self, addresses: &BTreeSet<u16>) -> Vec<ReadPlanRange> {
        self.plan_spans(addresses.iter().map(|address| (*address, 1)))
    }

    /// Plans `(address, width)` pairs; a multi-register span is never split
    /// across two ranges. Overlapping spans are read as one unit, so a unit
    /// wider than `max_span` gets a range of its own.
    pub fn plan_spans(&self, spans: impl IntoIterator<Item = (u16, u16)>) -> Vec<ReadPlanRange> {
        let mut spans = spans
            .into_iter()
            .map(|(address, width)| {
                let start = u32::from(address);
                let end = (start + u32::from(width.max(1)) - 1).min(u32::from(u16::MAX));
                (start, end)
            })
            .collect::<Vec<_>>();
        spans.sort_unstable();

        let max_span = u32::from(self.max_span.max(1));
        let max_gap = u32::from(self.max_gap);
        let mut ranges = Vec::new();
        let mut current: Option<(u32, u32)> = None;

        for (start, end) in coalesce(spans) {
            current = match current {
                None => Some((start, end)),
                Some((range_start, range_end)) => {
                    let gap_ok = start - range_end <= max_gap;
                    let span_ok = end - range_start + 1 <= max_span;
                    let crosses = self.crosses_forbidden(range_end, start);
                    if gap_ok && span_ok && !crosses {
                        Some((range_start, end))
                    } else {
                        ranges.push(to_range(range_start, range_end));
                        Some((start, end))
                    }
                }
            };
        }

        if let Some((range_start, range_end)) = current {
            ranges.push(to_range(range_start, range_end));
        }

        debug!(
            ranges = ranges.len(),
            max_span = self.max_span,
            max_gap = self.max_gap,
            "read plan computed"
        );
        ranges
    }

    /// True if reading the registers strictly between `from` and `to` would
    /// touch a forbidden region.
    fn crosses_forbidden(&self, from: u32, to: u32) -> bool {
        if to <= from + 1 {
            return false;
        }
        let (gap_start, gap_end) = (from + 1, to - 1);
        self.no_read_across.iter().any(|region| {
            u32::from(*region.start()) <= gap_end && u32::from(*region.end()) >= gap_start
        })
    }
}

/// Merges overlapping spans of a sorted list into disjoint units.
fn coalesce(spans: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    let mut units: Vec<(u32, u32)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match units.last_mut() {
            Some((_, unit_end)) if start <= *unit_end => *unit_end = (*unit_end).max(end),
            _ => units.push((start, end)),
        }
    }
    units
}

fn to_range(start: u32, end: u32) -> ReadPlanRange {
    ReadPlanRange {
        start_address: start as u16,
        count: (end - start + 1).min(u32::from(u16::MAX)) as u16,
    }
}
