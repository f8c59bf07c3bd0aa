//! duet-core: result model and event plumbing for duet.
//! Decodes socket messages and marker lines into one event type and merges
//! them into a per-run session. No async runtime, no terminal.

pub mod emitter;
pub mod error;
pub mod marker;
pub mod model;
pub mod router;
pub mod session;
pub mod wire;

pub use emitter::{DEFAULT_PORT, Emitter, EmitterConfig, marker_lines};
pub use error::{DecodeError, FatalRunError};
pub use marker::{MarkerParser, MarkerState};
pub use model::{DetailedDiff, Inputs, TestRecord, TestStatus, Verdict, normalize_id};
pub use router::EventRouter;
pub use session::{ChannelTrust, Progress, Registry, Session, SessionState, Tally};
pub use wire::{CompilePhase, ResultUpdate, SessionSummary, TestEvent, WireMessage};
