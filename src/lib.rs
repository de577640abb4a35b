pub mod config;
pub mod error;
pub mod listener;
pub mod node;
pub mod resource;
pub mod scheduler;
pub mod shutdown;
pub mod work_unit;

pub use error::{Result, SchedulerError};
pub use scheduler::{price_for_work, Assignment, TaskManager};
