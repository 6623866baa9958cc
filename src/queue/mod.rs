//! Continuous task intake: the priority queue and the timed scheduler
//! that feeds it.

pub mod queue;
pub mod scheduler;

pub use queue::{QueueStats, TaskQueue};
pub use scheduler::{Schedule, ScheduledTask, TaskScheduler};
