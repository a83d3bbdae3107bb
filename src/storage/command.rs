// Commands carried by log entries.
//
// A command is pure data; applying it needs the state it mutates,
// which the apply pipeline passes in through `ApplyContext`.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::raft::sm::CounterStateMachine;

/// Log dispatch tag of [`IncrementCommand`].
pub const INCREMENT_COMMAND_NAME: &str = "getts";
/// Log dispatch tag of [`JoinCommand`].
pub const JOIN_COMMAND_NAME: &str = "raft:join";

/// "Allocate `num` more numbers."
///
/// Not idempotent: applying the same request twice consumes two ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementCommand {
    pub num: i32,
}

impl IncrementCommand {
    pub fn new(num: i32) -> IncrementCommand {
        IncrementCommand { num }
    }

    pub fn command_name(&self) -> &'static str {
        INCREMENT_COMMAND_NAME
    }

    pub fn apply(&self, counter: &mut CounterStateMachine) -> i64 {
        counter.apply(self.num)
    }
}

/// Membership join descriptor, also the body of `POST /join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCommand {
    pub name: String,
    #[serde(rename = "connectionString")]
    pub connection_string: String,
}

impl JoinCommand {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> JoinCommand {
        JoinCommand {
            name: name.into(),
            connection_string: connection_string.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Increment(IncrementCommand),
    Join(JoinCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// High-water mark after an increment.
    Timestamp(i64),
    Joined,
}

/// Everything a command may touch while being applied.
pub struct ApplyContext<'a> {
    pub counter: &'a mut CounterStateMachine,
    pub members: &'a mut BTreeMap<String, String>,
}

impl Command {
    pub fn command_name(&self) -> &'static str {
        match self {
            Command::Increment(cmd) => cmd.command_name(),
            Command::Join(_) => JOIN_COMMAND_NAME,
        }
    }

    pub fn apply(&self, ctx: &mut ApplyContext<'_>) -> CommandOutcome {
        match self {
            Command::Increment(cmd) => CommandOutcome::Timestamp(cmd.apply(ctx.counter)),
            Command::Join(cmd) => {
                ctx.members
                    .insert(cmd.name.clone(), cmd.connection_string.clone());
                CommandOutcome::Joined
            }
        }
    }
}
