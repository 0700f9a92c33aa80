//! Child resource-manager contracts.
//!
//! The lifecycle controller creates one manager per resource class in a
//! fixed dependency order and destroys them in reverse. The managers
//! themselves live outside this crate; they see the device through a
//! [`ChildContext`] carrying the command channel and a read-only view of
//! the granted profile, and own no allocator state.

use crate::cmd::CommandChannel;
use crate::ddr::DdrAllocator;
use crate::error::Result;
use crate::profile::ResourceProfile;

/// Resource class of a child manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// Doorbell / user access region manager. Created first.
    Uar,
    /// Memory region and window manager.
    Memory,
    /// Completion queue manager.
    CompletionQueue,
    /// Queue pair manager.
    QueuePair,
    /// Shared receive queue manager. Only on devices that support SRQs.
    SharedReceiveQueue,
    /// Multicast group manager. Only when the plan has multicast groups.
    Multicast,
    /// Event queue manager. Created last, destroyed first; owns and
    /// drains all event queues.
    EventQueue,
}

impl ChildKind {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ChildKind::Uar => "uar",
            ChildKind::Memory => "mem",
            ChildKind::CompletionQueue => "cq",
            ChildKind::QueuePair => "qp",
            ChildKind::SharedReceiveQueue => "srq",
            ChildKind::Multicast => "mcg",
            ChildKind::EventQueue => "eq",
        }
    }
}

/// What a child manager sees of the device.
pub struct ChildContext<'a> {
    /// Command channel for firmware traffic.
    pub cmd: &'a dyn CommandChannel,
    /// The granted plan. Read-only; the slice relevant to the manager's
    /// kind is its budget.
    pub profile: &'a ResourceProfile,
    /// Capacity allocator, for occupancy queries. All DDR allocation and
    /// freeing stays with the controller.
    pub alloc: &'a DdrAllocator,
}

/// Occupancy snapshot of a child manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildUsage {
    /// Objects currently live.
    pub in_use: u32,
    /// Budgeted capacity from the profile.
    pub capacity: u32,
}

/// Contract every child resource manager satisfies.
pub trait ChildManager: Send {
    /// The manager's resource class.
    fn kind(&self) -> ChildKind;

    /// Occupancy snapshot.
    fn query(&self) -> ChildUsage;

    /// Drain and release everything the manager created. Called exactly
    /// once, in reverse creation order, before the device closes.
    ///
    /// # Errors
    /// Propagates the first command failure; the controller logs and
    /// continues tearing down.
    fn destroy(&mut self, ctx: &ChildContext<'_>) -> Result<()>;
}

/// Factory through which the controller instantiates child managers.
pub trait ChildFactory: Send + Sync {
    /// Create the manager for `kind`. Called with the device lock held,
    /// in dependency order.
    ///
    /// # Errors
    /// A failure aborts the open; managers created earlier are destroyed
    /// in reverse order.
    fn create(&self, kind: ChildKind, ctx: &ChildContext<'_>) -> Result<Box<dyn ChildManager>>;
}
