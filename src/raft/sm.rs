// SM -> State Machine that is replicated across the nodes.
//
// The whole replicated state is one signed 64 bit high-water mark.
// Every replica that applied the same prefix of the log holds the
// same value; nothing but the batch size of a command moves it.

use super::error::SnapshotError;

/// Length of an encoded snapshot: one little-endian `i64`.
pub const SNAPSHOT_LEN: usize = 8;

/// Value of a counter that has not issued any number yet.
pub const INITIAL_HIGH_WATER_MARK: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterStateMachine {
    high_water_mark: i64,
}

impl Default for CounterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStateMachine {
    pub fn new() -> Self {
        CounterStateMachine {
            high_water_mark: INITIAL_HIGH_WATER_MARK,
        }
    }

    pub fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }

    /// Allocates `batch_size` numbers and returns the new high-water mark.
    ///
    /// The allocated range is `[old + 1, old + batch_size]`. Must only be
    /// driven by the apply pipeline, one committed entry at a time; it does
    /// not validate the batch size.
    pub fn apply(&mut self, batch_size: i32) -> i64 {
        self.high_water_mark += i64::from(batch_size);
        self.high_water_mark
    }

    /// Whether `batch_size` more numbers fit below `i64::MAX`.
    pub fn can_allocate(&self, batch_size: i32) -> bool {
        self.high_water_mark
            .checked_add(i64::from(batch_size))
            .is_some()
    }

    pub fn save(&self) -> [u8; SNAPSHOT_LEN] {
        self.high_water_mark.to_le_bytes()
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let bytes: [u8; SNAPSHOT_LEN] = data
            .try_into()
            .map_err(|_| SnapshotError::CorruptSnapshot { len: data.len() })?;
        self.high_water_mark = i64::from_le_bytes(bytes);
        Ok(())
    }

    /// Decodes a snapshot into a fresh state machine.
    pub fn from_snapshot(data: &[u8]) -> Result<Self, SnapshotError> {
        let mut sm = Self::new();
        sm.restore(data)?;
        Ok(sm)
    }
}
