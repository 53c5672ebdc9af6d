//! Flow-control primitives shared by the protocol engines.
//!
//! [`Demand`] counts outstanding pull requests from a consumer, and
//! [`SequentialScheduler`] serializes a task body so it never runs
//! concurrently with itself, no matter how many threads ask for it.

mod demand;
mod scheduler;

pub use self::demand::Demand;
pub use self::scheduler::SequentialScheduler;
