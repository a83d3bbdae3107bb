pub mod command;
pub mod store;

pub use command::{Command, CommandOutcome, IncrementCommand, JoinCommand};
pub use store::{LogEntry, LogStore, StoreError};
