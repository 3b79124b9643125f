//! # Session Engine
//!
//! Turns a live, bursty audio stream into ordered transcript events.
//!
//! Data flow: transport → `Session` (dispatch) → `AudioBuffer` → `WorkQueue`
//! → `TranscriptionWorker` → output queue → `ResultSender` → transport.

pub mod events;      // Wire messages in both directions
pub mod lifecycle;   // Pure state machine
pub mod queue;       // Bounded drop-oldest work queue
pub mod registry;    // Live sessions by id
pub mod sender;      // Ordered delivery and the EventSink boundary
pub mod live;        // Session task group and teardown
pub mod stats;       // Counters and activity clocks
pub mod watchdog;    // Model-health and liveness monitors
pub mod worker;      // Single consumer of the work queue

pub use events::{SessionMeta, TranscriptEvent};
pub use lifecycle::SessionState;
pub use registry::{RegistryError, SessionRegistry};
pub use sender::EventSink;
pub use live::Session;
