//! Shared building blocks for the job queue.
//!
//! Identifiers, the queue-level error model and the clock abstraction used by
//! every component that needs "now".

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
