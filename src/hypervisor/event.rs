//! Asynchronous hypervisor events.

use super::HvResult;

/// What the lifecycle engine consumes. Callbacks deliver only the uuid;
/// the engine re-reads domain state itself so a burst of events cannot
/// carry stale snapshots of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// Power-state transition (started, stopped, crashed, ...).
    Lifecycle { uuid: String },
    /// Persistent or transient definition changed.
    DefinitionChanged { uuid: String },
}

/// The cooperative poll loop the hypervisor library requires. One
/// dedicated thread calls [`run_once`](EventLoopHandle::run_once)
/// forever; registration must happen before the first iteration.
pub trait EventLoopHandle: Send + Sync {
    fn register(&self) -> HvResult<()>;

    /// One blocking poll iteration.
    fn run_once(&self) -> HvResult<()>;
}
