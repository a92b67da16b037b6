//! Slot ranges and slot distribution helpers.
//!
//! All functions in this module are pure and side-effect free.

use super::SlotError;

/// Total number of hash slots in a Valkey cluster.
pub const TOTAL_SLOTS: u16 = 16384;

/// Highest valid slot number.
pub const MAX_SLOT: u16 = TOTAL_SLOTS - 1;

/// Validate a slot number.
pub fn check_slot(slot: u16) -> Result<u16, SlotError> {
    if slot > MAX_SLOT {
        Err(SlotError::OutOfRange(slot))
    } else {
        Ok(slot)
    }
}

/// A contiguous range of hash slots [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRange {
    /// Start of the slot range (inclusive).
    pub start: u16,
    /// End of the slot range (inclusive).
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range.
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end, "start ({}) must be <= end ({})", start, end);
        debug_assert!(end < TOTAL_SLOTS, "end ({}) must be < {}", end, TOTAL_SLOTS);
        Self { start, end }
    }

    /// Create a single-slot range.
    pub fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    /// Number of slots in this range.
    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Check if this range contains a specific slot.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Iterate over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    /// Parse `"0-5460"` or `"5461"`.
    ///
    /// Migration markers such as `[93->-<node-id>]` are not ranges and are
    /// rejected; see [`crate::client::types::SlotMarker`].
    pub fn parse(s: &str) -> Result<Self, SlotError> {
        let s = s.trim();
        let parse_one = |part: &str| -> Result<u16, SlotError> {
            let slot: u16 = part
                .parse()
                .map_err(|_| SlotError::InvalidRange(s.to_string()))?;
            check_slot(slot)
        };

        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_one(start)?, parse_one(end)?);
                if start > end {
                    return Err(SlotError::InvalidRange(s.to_string()));
                }
                Ok(SlotRange { start, end })
            }
            None => Ok(SlotRange::single(parse_one(s)?)),
        }
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Even slot split across `master_count` masters.
///
/// Remainder slots go to the first masters.
///
/// ```
/// use valkey_reshard::slots::{SlotRange, calculate_distribution};
///
/// let dist = calculate_distribution(3);
/// assert_eq!(dist[0], SlotRange::new(0, 5461));
/// assert_eq!(dist[2], SlotRange::new(10923, 16383));
/// ```
pub fn calculate_distribution(master_count: u16) -> Vec<SlotRange> {
    if master_count == 0 {
        return Vec::new();
    }

    let per_master = TOTAL_SLOTS / master_count;
    let remainder = TOTAL_SLOTS % master_count;

    let mut ranges = Vec::with_capacity(usize::from(master_count));
    let mut start: u16 = 0;
    for i in 0..master_count {
        let count = per_master + u16::from(i < remainder);
        if count == 0 {
            continue;
        }
        let end = start + count - 1;
        ranges.push(SlotRange::new(start, end));
        start = end.saturating_add(1);
    }
    ranges
}

/// Collapse a set of slots into sorted, maximal contiguous ranges.
pub fn compress_slots(slots: impl IntoIterator<Item = u16>) -> Vec<SlotRange> {
    let mut sorted: Vec<u16> = slots.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<SlotRange> = Vec::new();
    for slot in sorted {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == slot => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
    ranges
}
