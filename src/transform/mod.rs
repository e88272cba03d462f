//! Scheduling and buffer analysis over the polyhedral model.

pub mod buffers;
pub mod scheduler;

pub use buffers::{compute_buffers, BufferInfo, STACK_BUDGET};
pub use scheduler::{
    initialize_nest, process_nest, schedule, LoopNode, Schedule, ScheduleMap,
};
