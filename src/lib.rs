pub mod api;
pub mod client;
pub mod raft;
pub mod storage;
pub mod utils;
