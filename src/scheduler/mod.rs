pub mod admission;
pub mod job;
pub mod manager;
pub mod registry;
pub mod timeouts;

pub use admission::{Rejection, WorkOffer};
pub use job::{
    ComputerInfo, SubtaskState, SubtaskStatus, TaskHeader, TaskOwner, TaskState, TaskStatus,
};
pub use manager::{price_for_work, Assignment, TaskManager, TaskProgress};
pub use registry::{TaskEntry, TaskRegistry};
pub use timeouts::SweepReport;
