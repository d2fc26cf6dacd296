use chrono::{NaiveDate, NaiveDateTime, Timelike};

/// Number of 3-hour buckets in a day.
pub const SLOTS_PER_DAY: u8 = 8;

/// Maps an hour of day (0..24) to its slot index (1..=8).
pub fn slot_index(hour: u32) -> u8 {
    debug_assert!(hour < 24);
    (hour / 3 + 1) as u8
}

/// One 3-hour bucket of a calendar day. Never persisted; recomputed from
/// capture timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub date: NaiveDate,
    pub index: u8,
}

impl Slot {
    pub fn new(date: NaiveDate, index: u8) -> Self {
        debug_assert!((1..=SLOTS_PER_DAY).contains(&index));
        Self { date, index }
    }

    pub fn containing(at: NaiveDateTime) -> Self {
        Self {
            date: at.date(),
            index: slot_index(at.hour()),
        }
    }

    /// First hour of day covered by this slot.
    pub fn first_hour(&self) -> u32 {
        u32::from(self.index - 1) * 3
    }

    pub fn covers_hour(&self, hour: u32) -> bool {
        slot_index(hour) == self.index
    }

    /// Date component formatted the way artifact names embed it.
    pub fn date_key(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.date_key(), self.index)
    }
}
