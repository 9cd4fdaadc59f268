mod queue;
mod sweeper;

pub use queue::{QueueSupervisor, TaskHandler, TaskQueue};
pub use sweeper::{OverdueSweeper, SweepSettings};
