//! Client library: the protocol peer for the transaction stream broker.

pub mod client;
pub mod state_machine;

pub use client::{ClientError, ListenHandle, StreamClient};
pub use state_machine::{SelfTest, SelfTestOutcome, SelfTestState};
