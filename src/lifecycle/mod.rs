//! Worker lifecycle: termination notices and graceful draining.

pub mod drain;
pub mod notice;

pub use drain::{
    DrainController, DrainReport, DrainState, DrainTarget, DEFAULT_DRAIN_DEADLINE,
    DEFAULT_POLL_INTERVAL,
};
pub use notice::{
    HttpMetadataNotice, ManualNotice, NoticeError, TerminationNotice, TerminationSource,
};
