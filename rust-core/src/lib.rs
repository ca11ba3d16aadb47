// Deterministic state-transition kernel: drafts, a commit gate, a staged
// commit pipeline and a hash-chained ledger that replays bit-for-bit.

pub mod config;
pub mod constants;
pub mod error;
pub mod gate;
#[cfg(feature = "server")]
pub mod http;
pub mod kernel;
pub mod ledger;
pub mod pipeline;
pub mod replay;
pub mod state;
pub mod storage;
pub mod store;
pub mod transition;

// Bumped whenever canonical state bytes or the snapshot layout change.
pub const PROTOCOL_VERSION: u8 = 1;

pub use constants::Constants;
pub use error::KernelError;
pub use kernel::{Clock, FixedClock, Kernel, SystemClock};
pub use ledger::{CommitMarker, HashChainLedger};
pub use state::{Mode, Stability, State};
pub use transition::Event;

/*
Transition math never reads the wall clock or any randomness; marker
timestamps come from an injected `Clock` and are not part of the state hash.
*/
