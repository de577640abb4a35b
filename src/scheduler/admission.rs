use thiserror::Error;

use crate::scheduler::registry::TaskRegistry;

/// A provider asking for work on a task.
#[derive(Debug, Clone)]
pub struct WorkOffer {
    pub node_id: String,
    pub node_name: String,
    pub task_id: String,
    pub performance: f64,
    /// Price per second the provider wants
    pub price: u64,
    pub max_resource_size_kb: u64,
    pub max_memory_size_kb: u64,
    pub num_cores: u32,
    pub address: String,
}

impl WorkOffer {
    pub fn new(node_id: impl Into<String>, task_id: impl Into<String>, price: u64) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: String::new(),
            task_id: task_id.into(),
            performance: 0.0,
            price,
            max_resource_size_kb: u64::MAX / 1024,
            max_memory_size_kb: u64::MAX / 1024,
            num_cores: 1,
            address: String::new(),
        }
    }

    pub fn with_limits(mut self, max_resource_size_kb: u64, max_memory_size_kb: u64) -> Self {
        self.max_resource_size_kb = max_resource_size_kb;
        self.max_memory_size_kb = max_memory_size_kb;
        self
    }

    pub fn with_node(mut self, node_name: impl Into<String>, address: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self.address = address.into();
        self
    }

    pub fn with_performance(mut self, performance: f64, num_cores: u32) -> Self {
        self.performance = performance;
        self.num_cores = num_cores;
        self
    }
}

/// Why an offer was refused. Callers only ever learn "unknown task" or
/// "no work"; the rest is for logs and tests.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("task is not known")]
    UnknownTask,
    #[error("offered price is above the task's max price")]
    PriceTooHigh,
    #[error("offer comes from the requester itself")]
    OwnOffer,
    #[error("task is not active")]
    Inactive,
    #[error("task has no unclaimed work")]
    NoWorkLeft,
    #[error("task is already computed")]
    AlreadyComputed,
    #[error("task resources exceed the node's limit")]
    ResourceTooLarge,
    #[error("task memory exceeds the node's limit")]
    MemoryTooLarge,
}

/// Run the ordered admission checks for `offer`. Reads only; the first
/// failing check decides the rejection.
pub fn check_offer(
    registry: &TaskRegistry,
    offer: &WorkOffer,
    own_key_id: &str,
) -> Result<(), Rejection> {
    let Some((entry, state)) = registry.entry(&offer.task_id) else {
        return Err(Rejection::UnknownTask);
    };
    let header = entry.header();

    if offer.price > header.max_price {
        return Err(Rejection::PriceTooHigh);
    }
    if offer.node_id == own_key_id {
        return Err(Rejection::OwnOffer);
    }
    if !state.status.is_active() {
        return Err(Rejection::Inactive);
    }
    if !entry.work_unit.needs_computation() {
        return Err(Rejection::NoWorkLeft);
    }
    if entry.work_unit.progress() >= 1.0 {
        return Err(Rejection::AlreadyComputed);
    }
    if header.resource_size > offer.max_resource_size_kb.saturating_mul(1024) {
        return Err(Rejection::ResourceTooLarge);
    }
    if header.estimated_memory > offer.max_memory_size_kb.saturating_mul(1024) {
        return Err(Rejection::MemoryTooLarge);
    }
    Ok(())
}
