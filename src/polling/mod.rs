//! The polling engine: one worker task per polling group (Fixed or
//! Handshake mode), status publishing, and the coordinator the control
//! surface drives.

pub mod engine;
pub mod status;
pub mod worker;

pub use engine::{EngineError, PollingEngine, DEFAULT_MAX_POLLING_GROUPS};
pub use status::{GroupState, GroupStatus, StatusPublisher};
pub use worker::{poll_group_once, run_fixed, run_handshake, PollOutcome, TriggerHandle};
