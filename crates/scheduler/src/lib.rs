//! Preview load scheduling
//!
//! Bounded-concurrency, two-lane task runner that paces the fetch and decode
//! of row thumbnails so a burst of list updates cannot stall the host's
//! rendering thread.
//!
//! Work is keyed by row: scheduling a key that is already queued replaces
//! its body rather than queuing it twice. Pumps are deferred to the host's
//! frame or idle callbacks when available, and fall back to a zero-delay
//! timer otherwise.
//!
//! # Example
//!
//! ```
//! use jobrow_scheduler::{LoadPriority, LoadRun, LoadScheduler};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let scheduler = LoadScheduler::with_defaults();
//!
//! // Rows that show nothing yet go in the high lane
//! let _load = scheduler.schedule(
//!     "job-42",
//!     || {
//!         LoadRun::pending(async {
//!             // fetch + decode the thumbnail
//!         })
//!     },
//!     LoadPriority::High,
//! );
//! # }
//! ```

pub mod cancel;
pub mod priority;
pub mod scheduler;
pub mod yield_point;

pub use cancel::{AbortController, AbortSignal};
pub use priority::{LoadPriority, LoadRun, LoadTask, TicketId};
pub use scheduler::{LoadScheduler, LoadSchedulerConfig, LoadStats, ScheduledLoad, MAX_IN_FLIGHT};
pub use yield_point::{
    FrameHost, HostCapabilities, IdleHost, PumpUrgency, Wake, YieldPoint, YieldStrategy,
};
