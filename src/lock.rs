//! Per-resource lock discipline.
//!
//! Every live resource instance is guarded by its own exclusive lock, held for
//! the duration of any mutating operation on that resource (create, bind,
//! record, submit, reset, map, destroy). The locks exist to make the API safe
//! to call concurrently; the driving workflow itself is sequential.
//!
//! # Lock ordering
//!
//! When an operation needs more than one lock at once, locks are acquired in
//! strictly ascending [`ResourceId`] order: first by [`ResourceKind`] (the
//! declaration order of the enum *is* the global kind order), then by index
//! within the kind. [`LockTable::with_locks`] enforces this by sorting the
//! requested ids before acquiring anything. The queue lock is last in the kind
//! order and is never nested inside a command-buffer lock.
//!
//! Mapping is a property of a whole allocation, not of one resource bound into
//! it, so map/unmap is serialized by a separate allocation-level mutex owned by
//! the class allocation (see [`crate::provision::ClassAllocation`]), not by
//! this table.
//!
//! # Lifecycle
//!
//! Each lock slot carries the instance's [`LifecycleState`]. Acquiring the lock
//! of a [`Destroyed`](LifecycleState::Destroyed) resource is a programming
//! fault and panics; it is not a recoverable runtime condition.

use std::sync::{Mutex, MutexGuard};

/// The kind of a lockable resource instance.
///
/// Declaration order defines the global kind-level lock order: when locks of
/// different kinds are held together, the lower kind is always acquired first.
/// In particular the command-pool lock precedes any command-buffer lock, and
/// the queue lock comes last of all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum ResourceKind {
    Instance,
    Device,
    Surface,
    Swapchain,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    Pipeline,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    RenderPass,
    Framebuffer,
    Sampler,
    Semaphore,
    Buffer,
    BufferView,
    Image,
    ImageView,
    CommandPool,
    CommandBuffer,
    Queue,
}

impl ResourceKind {
    pub const COUNT: usize = 22;

    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::Instance,
        ResourceKind::Device,
        ResourceKind::Surface,
        ResourceKind::Swapchain,
        ResourceKind::ShaderModule,
        ResourceKind::PipelineCache,
        ResourceKind::PipelineLayout,
        ResourceKind::Pipeline,
        ResourceKind::DescriptorSetLayout,
        ResourceKind::DescriptorPool,
        ResourceKind::DescriptorSet,
        ResourceKind::RenderPass,
        ResourceKind::Framebuffer,
        ResourceKind::Sampler,
        ResourceKind::Semaphore,
        ResourceKind::Buffer,
        ResourceKind::BufferView,
        ResourceKind::Image,
        ResourceKind::ImageView,
        ResourceKind::CommandPool,
        ResourceKind::CommandBuffer,
        ResourceKind::Queue,
    ];
}

/// Identifies one resource instance: a kind plus a dense index into that
/// kind's fixed-size lock vector.
///
/// The derived ordering (kind first, index second) is exactly the mandated
/// lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub index: usize,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub fn buffer(index: usize) -> Self {
        Self::new(ResourceKind::Buffer, index)
    }

    pub fn image(index: usize) -> Self {
        Self::new(ResourceKind::Image, index)
    }

    pub fn command_buffer(index: usize) -> Self {
        Self::new(ResourceKind::CommandBuffer, index)
    }

    pub fn queue(index: usize) -> Self {
        Self::new(ResourceKind::Queue, index)
    }
}

/// Where a resource instance is in its life.
///
/// ```text
/// Unallocated -> Created -> Bound -> Usable -> Destroyed
///                   |          |                   ^
///                   +----------+-------->>>--------+
/// ```
///
/// `Created` means the external object exists and its memory requirement is
/// known. `Bound` means its offset within the class allocation is fixed
/// forever. `Usable` resources may be recorded, bound to descriptor sets,
/// submitted, and reset repeatedly without further state changes. `Destroyed`
/// is terminal: the instance's lock may never be taken again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// No external object exists yet.
    Unallocated,
    /// External object created, requirement known, not yet placed.
    Created,
    /// Memory offset fixed by a consumed placement plan.
    Bound,
    /// In active use; record/submit/reset are repeatable here.
    Usable,
    /// Terminal. Further lock acquisition is a programming fault.
    Destroyed,
}

impl LifecycleState {
    /// Moves to `next`, panicking on any transition the lifecycle does not
    /// allow. Destruction is reachable from every live state.
    pub fn advance_to(&mut self, next: LifecycleState) {
        let legal = match (*self, next) {
            (LifecycleState::Unallocated, LifecycleState::Created) => true,
            (LifecycleState::Created, LifecycleState::Bound) => true,
            (LifecycleState::Bound, LifecycleState::Usable) => true,
            (_, LifecycleState::Destroyed) => *self != LifecycleState::Destroyed,
            _ => false,
        };
        assert!(legal, "illegal lifecycle transition {self:?} -> {next:?}");
        *self = next;
    }
}

/// Fixed capacity per [`ResourceKind`], set once at startup.
///
/// The lock table never grows: resource indices are dense integers into
/// pre-sized vectors, so there are no resize races to defend against. The
/// defaults mirror a workload with a handful of each kind and one lock for
/// every singleton object.
#[derive(Debug, Clone)]
pub struct LockCapacities {
    counts: [usize; ResourceKind::COUNT],
}

impl LockCapacities {
    /// Starts with one lock per kind (every kind treated as a singleton).
    pub fn ones() -> Self {
        Self {
            counts: [1; ResourceKind::COUNT],
        }
    }

    /// Sets the instance count for one kind.
    pub fn with(mut self, kind: ResourceKind, count: usize) -> Self {
        self.counts[kind as usize] = count;
        self
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.counts[kind as usize]
    }
}

impl Default for LockCapacities {
    fn default() -> Self {
        Self::ones()
            .with(ResourceKind::Buffer, 13)
            .with(ResourceKind::BufferView, 13)
            .with(ResourceKind::Image, 21)
            .with(ResourceKind::ImageView, 21)
            .with(ResourceKind::CommandBuffer, 5)
            .with(ResourceKind::Queue, 64)
            .with(ResourceKind::Pipeline, 2)
    }
}

/// The process-wide table of per-resource locks, one slot per instance.
///
/// Sized once at construction and torn down with its owner; not a global.
/// Thread it through explicitly via the owning context object.
pub struct LockTable {
    slots: [Vec<Mutex<LifecycleState>>; ResourceKind::COUNT],
}

impl LockTable {
    pub fn new(capacities: &LockCapacities) -> Self {
        let slots = std::array::from_fn(|kind| {
            (0..capacities.counts[kind])
                .map(|_| Mutex::new(LifecycleState::Unallocated))
                .collect()
        });
        Self { slots }
    }

    /// Number of lock slots for a kind.
    pub fn capacity(&self, kind: ResourceKind) -> usize {
        self.slots[kind as usize].len()
    }

    fn slot(&self, id: ResourceId) -> &Mutex<LifecycleState> {
        &self.slots[id.kind as usize][id.index]
    }

    fn acquire(&self, id: ResourceId) -> MutexGuard<'_, LifecycleState> {
        let guard = self.slot(id).lock().unwrap();
        assert_ne!(
            *guard,
            LifecycleState::Destroyed,
            "lock acquired on destroyed resource {id:?}"
        );
        guard
    }

    /// Runs `f` with exclusive access to one resource instance.
    ///
    /// The lock is released on every exit path, including panics inside `f`.
    ///
    /// # Panics
    ///
    /// Panics if the resource is [`Destroyed`](LifecycleState::Destroyed).
    pub fn with_lock<R>(&self, id: ResourceId, f: impl FnOnce(&mut LifecycleState) -> R) -> R {
        let mut guard = self.acquire(id);
        f(&mut guard)
    }

    /// Runs `f` with exclusive access to several resource instances at once.
    ///
    /// Ids are sorted ascending and deduplicated before any lock is taken, so
    /// callers may pass them in any order without risking a lock-order
    /// inversion against other `with_locks` callers. `f` receives the guarded
    /// states in the sorted id order.
    pub fn with_locks<R>(
        &self,
        ids: &[ResourceId],
        f: impl FnOnce(&mut [&mut LifecycleState]) -> R,
    ) -> R {
        let ordered = ordered_ids(ids);
        let mut guards: Vec<MutexGuard<'_, LifecycleState>> =
            ordered.iter().map(|&id| self.acquire(id)).collect();
        let mut states: Vec<&mut LifecycleState> =
            guards.iter_mut().map(|guard| &mut **guard).collect();
        f(&mut states)
    }

    /// Locks every instance of one kind, ascending, for whole-kind sweeps
    /// (batch create, batch reset, batch destroy).
    pub fn with_all_of_kind<R>(
        &self,
        kind: ResourceKind,
        f: impl FnOnce(&mut [&mut LifecycleState]) -> R,
    ) -> R {
        let ids: Vec<ResourceId> = (0..self.capacity(kind))
            .map(|index| ResourceId::new(kind, index))
            .collect();
        self.with_locks(&ids, f)
    }
}

/// The acquisition order for a set of ids: ascending by `(kind, index)`,
/// duplicates removed.
fn ordered_ids(ids: &[ResourceId]) -> Vec<ResourceId> {
    let mut ordered = ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn ids_order_by_kind_then_index() {
        assert!(ResourceId::new(ResourceKind::CommandPool, 9) < ResourceId::command_buffer(0));
        assert!(ResourceId::command_buffer(4) < ResourceId::queue(0));
        assert!(ResourceId::buffer(1) < ResourceId::buffer(2));
    }

    #[test]
    fn with_locks_acquires_in_ascending_order() {
        let ids = [
            ResourceId::buffer(3),
            ResourceId::buffer(1),
            ResourceId::buffer(2),
        ];
        assert_eq!(
            ordered_ids(&ids),
            vec![
                ResourceId::buffer(1),
                ResourceId::buffer(2),
                ResourceId::buffer(3)
            ]
        );

        let mixed = [
            ResourceId::queue(0),
            ResourceId::command_buffer(2),
            ResourceId::new(ResourceKind::CommandPool, 0),
        ];
        assert_eq!(
            ordered_ids(&mixed),
            vec![
                ResourceId::new(ResourceKind::CommandPool, 0),
                ResourceId::command_buffer(2),
                ResourceId::queue(0),
            ]
        );
    }

    #[test]
    fn whole_kind_sweep_covers_every_slot() {
        let table = LockTable::new(&LockCapacities::default());
        table.with_all_of_kind(ResourceKind::Buffer, |states| {
            assert_eq!(states.len(), 13);
            for state in states.iter_mut() {
                state.advance_to(LifecycleState::Created);
            }
        });
    }

    #[test]
    fn duplicate_ids_do_not_deadlock() {
        let table = LockTable::new(&LockCapacities::default());
        let ids = [
            ResourceId::buffer(0),
            ResourceId::buffer(0),
            ResourceId::buffer(1),
        ];
        table.with_locks(&ids, |states| {
            assert_eq!(states.len(), 2);
        });
    }

    #[test]
    fn lock_is_exclusive() {
        let table = Arc::new(LockTable::new(&LockCapacities::default()));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        table.with_lock(ResourceId::buffer(0), |_state| {
                            let concurrent = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            assert_eq!(concurrent, 1, "two callers inside one critical section");
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn opposite_order_callers_do_not_deadlock() {
        let table = Arc::new(LockTable::new(&LockCapacities::default()));
        let forward = [
            ResourceId::buffer(0),
            ResourceId::buffer(1),
            ResourceId::buffer(2),
        ];
        let mut backward = forward;
        backward.reverse();

        let handles: Vec<_> = [forward, backward]
            .into_iter()
            .map(|ids| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        table.with_locks(&ids, |_| {});
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn lifecycle_advances_through_legal_states() {
        let mut state = LifecycleState::Unallocated;
        state.advance_to(LifecycleState::Created);
        state.advance_to(LifecycleState::Bound);
        state.advance_to(LifecycleState::Usable);
        state.advance_to(LifecycleState::Destroyed);
    }

    #[test]
    fn created_resource_may_be_destroyed_without_binding() {
        let mut state = LifecycleState::Created;
        state.advance_to(LifecycleState::Destroyed);
    }

    #[test]
    #[should_panic(expected = "illegal lifecycle transition")]
    fn skipping_bound_panics() {
        let mut state = LifecycleState::Created;
        state.advance_to(LifecycleState::Usable);
    }

    #[test]
    #[should_panic(expected = "destroyed resource")]
    fn locking_a_destroyed_resource_panics() {
        let table = LockTable::new(&LockCapacities::default());
        table.with_lock(ResourceId::image(0), |state| {
            state.advance_to(LifecycleState::Created);
            state.advance_to(LifecycleState::Destroyed);
        });
        table.with_lock(ResourceId::image(0), |_| {});
    }
}
