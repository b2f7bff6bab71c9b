//! The provisioning workflow.
//!
//! [`Provisioner`] ties the planner and the lock table together over an
//! externally supplied [`DeviceOps`] implementation. It drives the resource
//! lifecycle end to end:
//!
//! 1. create buffers and images (each under its own lock),
//! 2. gather per-resource memory requirements,
//! 3. plan each class's placement (buffer class first, then image class, so
//!    the image planner sees the buffer class's claim when both classes land
//!    on the same memory type),
//! 4. allocate one block per class and bind every member at its planned
//!    offset,
//! 5. map/fill/read the buffer allocation under the allocation-level lock,
//! 6. record, submit, reset under the pool/buffer/queue lock order,
//! 7. destroy members and free the class allocations.
//!
//! # Error policy
//!
//! Planner failures are returned as values ([`PlacementError`]) and must be
//! checked before binding. Driver-call failures are logged and execution
//! continues with the possibly-invalid handle; there is no rollback of
//! previously completed steps. A failed placement or bind therefore shows up
//! downstream as no-op reads or writes, not as an abort. This mirrors the
//! behavior of the workloads this crate provisions for and is a deliberate
//! policy, not an oversight.
//!
//! Lifecycle violations (using a destroyed resource, applying a placement
//! twice, locking out of order) are programming faults and panic.

use std::{
    ffi::c_void,
    sync::{Arc, Mutex},
};

use ash::{prelude::VkResult, vk};

use crate::{
    device::DeviceOps,
    lock::{LifecycleState, LockCapacities, LockTable, ResourceId, ResourceKind},
    plan::{ClaimedPlacement, PlacementError, PlacementPlan, PlanState, ResourceClass},
};

/// One class's shared memory block after binding.
///
/// Holds the allocation handle, the consumed placement data, and the
/// allocation-level map lock. Mapping is mutually exclusive for the whole
/// block: two resources bound into the same allocation must never be mapped
/// concurrently, even though each has its own per-resource lock.
pub struct ClassAllocation {
    memory: vk::DeviceMemory,
    type_index: u32,
    size: vk::DeviceSize,
    offsets: Vec<vk::DeviceSize>,
    map_lock: Mutex<()>,
}

impl ClassAllocation {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Byte offset of member `index` within the allocation. Fixed forever
    /// once bound.
    pub fn offset(&self, index: usize) -> vk::DeviceSize {
        self.offsets[index]
    }

    pub fn offsets(&self) -> &[vk::DeviceSize] {
        &self.offsets
    }
}

#[derive(Default)]
struct ClassSlot {
    requirements: Vec<vk::MemoryRequirements>,
    plan: Option<PlacementPlan>,
    allocation: Option<ClassAllocation>,
}

/// Context object owning the device boundary, the lock table, and the
/// per-class placement state.
///
/// All mutating operations on shared resources go through this object, which
/// serializes them with the per-resource lock discipline described in
/// [`crate::lock`]. The driving workflow is typically one thread; the locks
/// make the API safe to call from several.
pub struct Provisioner {
    device: Arc<dyn DeviceOps>,
    locks: LockTable,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buffers: Vec<vk::Buffer>,
    images: Vec<vk::Image>,
    command_buffers: Vec<vk::CommandBuffer>,
    queues: Vec<vk::Queue>,
    slots: [ClassSlot; ResourceClass::COUNT],
}

impl Provisioner {
    /// Builds the context and performs the one-shot memory topology query.
    pub fn new(device: Arc<dyn DeviceOps>, capacities: &LockCapacities) -> Self {
        let memory_properties = device.memory_properties();
        tracing::info!(
            memory_types = memory_properties.memory_type_count,
            memory_heaps = memory_properties.memory_heap_count,
            "queried device memory topology"
        );
        Self {
            device,
            locks: LockTable::new(capacities),
            memory_properties,
            buffers: Vec::new(),
            images: Vec::new(),
            command_buffers: Vec::new(),
            queues: Vec::new(),
            slots: Default::default(),
        }
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn buffers(&self) -> &[vk::Buffer] {
        &self.buffers
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// The bound allocation for a class, if the class was planned and bound.
    pub fn allocation(&self, class: ResourceClass) -> Option<&ClassAllocation> {
        self.slots[class as usize].allocation.as_ref()
    }

    /// Creates the buffer class members, one per entry of `sizes`, each under
    /// its own lock in ascending index order.
    ///
    /// A failed creation is logged and the loop continues; the slot keeps a
    /// null handle that later steps will pass along to the driver unchecked.
    pub fn create_buffers(&mut self, sizes: &[vk::DeviceSize], usage: vk::BufferUsageFlags) {
        assert!(self.buffers.is_empty(), "buffer class already created");
        assert!(
            sizes.len() <= self.locks.capacity(ResourceKind::Buffer),
            "buffer count exceeds the lock table capacity fixed at startup"
        );
        tracing::info!(count = sizes.len(), "creating buffers");
        for (index, &size) in sizes.iter().enumerate() {
            let device = Arc::clone(&self.device);
            let handle = self.locks.with_lock(ResourceId::buffer(index), |state| {
                let handle = match device.create_buffer(size, usage) {
                    Ok(handle) => handle,
                    Err(err) => {
                        tracing::warn!(index, %err, "failed to create buffer");
                        vk::Buffer::null()
                    }
                };
                state.advance_to(LifecycleState::Created);
                handle
            });
            self.buffers.push(handle);
        }
    }

    /// Creates the image class members. Same locking and failure policy as
    /// [`create_buffers`](Self::create_buffers).
    pub fn create_images(
        &mut self,
        extents: &[vk::Extent3D],
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) {
        assert!(self.images.is_empty(), "image class already created");
        assert!(
            extents.len() <= self.locks.capacity(ResourceKind::Image),
            "image count exceeds the lock table capacity fixed at startup"
        );
        tracing::info!(count = extents.len(), "creating images");
        for (index, &extent) in extents.iter().enumerate() {
            let device = Arc::clone(&self.device);
            let handle = self.locks.with_lock(ResourceId::image(index), |state| {
                let handle = match device.create_image(extent, format, usage) {
                    Ok(handle) => handle,
                    Err(err) => {
                        tracing::warn!(index, %err, "failed to create image");
                        vk::Image::null()
                    }
                };
                state.advance_to(LifecycleState::Created);
                handle
            });
            self.images.push(handle);
        }
    }

    /// Registers externally allocated command buffer handles so record, reset,
    /// and submit can address them by dense index.
    pub fn register_command_buffers(&mut self, handles: Vec<vk::CommandBuffer>) {
        assert!(
            handles.len() <= self.locks.capacity(ResourceKind::CommandBuffer),
            "command buffer count exceeds the lock table capacity fixed at startup"
        );
        self.command_buffers = handles;
    }

    /// Registers the device queues used for submission.
    pub fn register_queues(&mut self, handles: Vec<vk::Queue>) {
        assert!(
            handles.len() <= self.locks.capacity(ResourceKind::Queue),
            "queue count exceeds the lock table capacity fixed at startup"
        );
        self.queues = handles;
    }

    /// Queries the memory requirement of every member of a class. Called once
    /// per class, after creation and before planning.
    pub fn gather_requirements(&mut self, class: ResourceClass) {
        let requirements: Vec<vk::MemoryRequirements> = match class {
            ResourceClass::Buffer => self
                .buffers
                .iter()
                .map(|&buffer| self.device.buffer_requirements(buffer))
                .collect(),
            ResourceClass::Image => self
                .images
                .iter()
                .map(|&image| self.device.image_requirements(image))
                .collect(),
        };
        let total: vk::DeviceSize = requirements.iter().map(|r| r.size).sum();
        tracing::info!(?class, members = requirements.len(), total, "gathered requirements");
        self.slots[class as usize].requirements = requirements;
    }

    /// Runs the placement planner for a class.
    ///
    /// Classes planned earlier constrain later ones: a later class may only
    /// share an earlier class's memory type if both totals jointly fit the
    /// heap. On [`PlacementError::NoSuitableType`] the class keeps no plan and
    /// [`bind_class`](Self::bind_class) must be skipped for it.
    ///
    /// # Panics
    ///
    /// Panics if the class was already planned; plans are never recomputed.
    pub fn plan_class(&mut self, class: ResourceClass) -> Result<(), PlacementError> {
        assert!(
            self.slots[class as usize].plan.is_none(),
            "{class:?} class already planned"
        );
        let claimed: Vec<ClaimedPlacement> = ResourceClass::ALL
            .into_iter()
            .filter(|&other| other != class)
            .filter_map(|other| {
                let plan = self.slots[other as usize].plan.as_ref()?;
                (plan.state() != PlanState::Pending)
                    .then(|| (other, plan.type_index(), plan.total_size()))
            })
            .collect();

        let slot = &mut self.slots[class as usize];
        let mut plan = PlacementPlan::new(class);
        match plan.compute(&slot.requirements, &self.memory_properties, &claimed) {
            Ok(()) => {
                tracing::info!(
                    ?class,
                    type_index = plan.type_index(),
                    total_size = plan.total_size(),
                    "placement planned"
                );
                slot.plan = Some(plan);
                Ok(())
            }
            Err(err) => {
                tracing::error!(?class, %err, "placement failed; class will not be bound");
                Err(err)
            }
        }
    }

    /// Allocates the class block and binds every member at its planned offset.
    ///
    /// Consumes the placement plan exactly once. Allocation or bind failures
    /// are logged and the loop continues; members still advance to
    /// [`Bound`](LifecycleState::Bound) so the surrounding workflow proceeds
    /// with whatever handles it has.
    ///
    /// # Panics
    ///
    /// Panics if the class's placement was already applied.
    pub fn bind_class(&mut self, class: ResourceClass) -> Result<(), PlacementError> {
        let placement = match self.slots[class as usize].plan.as_mut() {
            Some(plan) => plan.consume(),
            None => return Err(PlacementError::NotPlanned(class)),
        };

        tracing::info!(
            ?class,
            type_index = placement.type_index,
            size = placement.total_size,
            "allocating class memory"
        );
        let memory = match self
            .device
            .allocate(placement.total_size, placement.type_index)
        {
            Ok(memory) => memory,
            Err(err) => {
                tracing::error!(?class, %err, "failed to allocate class memory");
                vk::DeviceMemory::null()
            }
        };

        for (index, &offset) in placement.offsets.iter().enumerate() {
            let device = Arc::clone(&self.device);
            match class {
                ResourceClass::Buffer => {
                    let buffer = self.buffers[index];
                    self.locks.with_lock(ResourceId::buffer(index), |state| {
                        if let Err(err) = device.bind_buffer(buffer, memory, offset) {
                            tracing::warn!(?class, index, %err, "failed to bind resource");
                        }
                        state.advance_to(LifecycleState::Bound);
                    });
                }
                ResourceClass::Image => {
                    let image = self.images[index];
                    self.locks.with_lock(ResourceId::image(index), |state| {
                        if let Err(err) = device.bind_image(image, memory, offset) {
                            tracing::warn!(?class, index, %err, "failed to bind resource");
                        }
                        state.advance_to(LifecycleState::Bound);
                    });
                }
            }
        }

        self.slots[class as usize].allocation = Some(ClassAllocation {
            memory,
            type_index: placement.type_index,
            size: placement.total_size,
            offsets: placement.offsets,
            map_lock: Mutex::new(()),
        });
        Ok(())
    }

    /// Maps the class allocation, runs `f` with the pointer and mapped size,
    /// and unmaps, all under the allocation-level map lock.
    ///
    /// Members still in [`Bound`](LifecycleState::Bound) are promoted to
    /// [`Usable`](LifecycleState::Usable) after the first successful host
    /// access.
    ///
    /// # Panics
    ///
    /// Panics if the class has no bound allocation.
    pub fn with_mapped(
        &self,
        class: ResourceClass,
        f: impl FnOnce(*mut c_void, vk::DeviceSize),
    ) -> VkResult<()> {
        let Some(allocation) = self.slots[class as usize].allocation.as_ref() else {
            panic!("{class:?} class has no allocation to map");
        };
        {
            let _map_guard = allocation.map_lock.lock().unwrap();
            let ptr = match self.device.map(allocation.memory) {
                Ok(ptr) => ptr,
                Err(err) => {
                    tracing::error!(?class, %err, "failed to map class memory");
                    return Err(err);
                }
            };
            f(ptr, allocation.size);
            self.device.unmap(allocation.memory);
        }

        for index in 0..allocation.offsets.len() {
            let id = match class {
                ResourceClass::Buffer => ResourceId::buffer(index),
                ResourceClass::Image => ResourceId::image(index),
            };
            self.locks.with_lock(id, |state| {
                if *state == LifecycleState::Bound {
                    state.advance_to(LifecycleState::Usable);
                }
            });
        }
        Ok(())
    }

    /// Runs `f` while holding the locks of every listed resource, acquired in
    /// ascending order regardless of input order. Members still `Bound` are
    /// promoted to `Usable`; use this for operations spanning several
    /// resources, such as a copy between two buffers.
    pub fn use_resources<R>(&self, ids: &[ResourceId], f: impl FnOnce() -> R) -> R {
        self.locks.with_locks(ids, |states| {
            for state in states.iter_mut() {
                if **state == LifecycleState::Bound {
                    state.advance_to(LifecycleState::Usable);
                }
            }
            f()
        })
    }

    /// Records into one command buffer under the pool lock and the buffer's
    /// own lock, in that order.
    pub fn record<R>(&self, index: usize, f: impl FnOnce(vk::CommandBuffer) -> R) -> R {
        let command_buffer = self.command_buffers[index];
        self.locks
            .with_lock(ResourceId::new(ResourceKind::CommandPool, 0), |_| {
                self.locks
                    .with_lock(ResourceId::command_buffer(index), |_| f(command_buffer))
            })
    }

    /// Resets every registered command buffer: pool lock first, then all
    /// buffer locks in ascending index order. Reset failures are logged and
    /// the sweep continues.
    pub fn reset_all_command_buffers(&self) {
        let ids: Vec<ResourceId> = (0..self.command_buffers.len())
            .map(ResourceId::command_buffer)
            .collect();
        self.locks
            .with_lock(ResourceId::new(ResourceKind::CommandPool, 0), |_| {
                self.locks.with_locks(&ids, |_| {
                    for (index, &command_buffer) in self.command_buffers.iter().enumerate() {
                        if let Err(err) = self.device.reset_command_buffer(command_buffer) {
                            tracing::warn!(index, %err, "failed to reset command buffer");
                        }
                    }
                });
            });
    }

    /// Submits a command buffer on a queue under the queue lock alone.
    ///
    /// The queue lock is independent of the command-buffer lock and is never
    /// nested inside one. A failed submission is logged; the caller keeps
    /// going.
    pub fn submit(&self, queue_index: usize, command_buffer_index: usize) {
        let queue = self.queues[queue_index];
        let command_buffer = self.command_buffers[command_buffer_index];
        self.locks.with_lock(ResourceId::queue(queue_index), |_| {
            if let Err(err) = self.device.submit(queue, command_buffer) {
                tracing::warn!(queue_index, command_buffer_index, %err, "failed to submit");
            }
        });
    }

    /// Destroys every buffer under its own lock, ascending. Terminal for the
    /// members; their locks may never be taken again.
    pub fn destroy_buffers(&mut self) {
        for (index, &buffer) in self.buffers.iter().enumerate() {
            let device = Arc::clone(&self.device);
            self.locks.with_lock(ResourceId::buffer(index), |state| {
                device.destroy_buffer(buffer);
                state.advance_to(LifecycleState::Destroyed);
            });
        }
        self.buffers.clear();
        self.slots[ResourceClass::Buffer as usize].requirements.clear();
    }

    /// Destroys every image under its own lock, ascending.
    pub fn destroy_images(&mut self) {
        for (index, &image) in self.images.iter().enumerate() {
            let device = Arc::clone(&self.device);
            self.locks.with_lock(ResourceId::image(index), |state| {
                device.destroy_image(image);
                state.advance_to(LifecycleState::Destroyed);
            });
        }
        self.images.clear();
        self.slots[ResourceClass::Image as usize].requirements.clear();
    }

    /// Waits for the device to drain, then frees the class allocations.
    /// Allocations are freed exactly once, at teardown; they are never resized
    /// or rebound in between.
    pub fn teardown(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            tracing::warn!(%err, "failed to wait for device idle");
        }
        for class in ResourceClass::ALL {
            if let Some(allocation) = self.slots[class as usize].allocation.take() {
                self.device.free(allocation.memory);
                tracing::info!(?class, size = allocation.size, "freed class memory");
            }
        }
    }
}
