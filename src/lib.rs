//! Service runtime substrate: a cooperative single-threaded scheduler, leases
//! built on its timers, actor mailbox dispatch, and eventual-consistency
//! replication of a two-level share over a lossy publish/subscribe bus.
//!
//! Everything scheduler-owned is `!Send` and lives on the thread that drives
//! [`Scheduler::run`](scheduler::Scheduler::run). Other threads talk to it
//! through a [`SchedulerHandle`](scheduler::SchedulerHandle).

pub mod actor;
pub mod bus;
pub mod clock;
pub mod config;
pub mod ec;
pub mod error;
pub mod lease;
pub mod protocol;
pub mod runtime;
pub mod scheduler;

pub use error::{Error, Result};
pub use runtime::Runtime;
