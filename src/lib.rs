//! # Scoria
//!
//! A planning and synchronization layer for provisioning GPU-visible
//! resources.
//!
//! Scoria decides where buffers and images live in device memory and
//! serializes every mutating operation on a shared resource, while leaving the
//! actual driver work (creation, allocation, mapping, submission) to an
//! externally supplied [`DeviceOps`](device::DeviceOps) implementation. It has
//! no driver state of its own, so the whole core runs under unit tests with an
//! in-memory device.
//!
//! ## Overview
//!
//! Two components form the core, in dependency order:
//!
//! - [`plan`]: the memory placement planner. Pure decision logic: given the
//!   device's heap/type table and a class's per-resource requirements, it
//!   picks a memory type (first-fit, index-ascending) and assigns contiguous
//!   byte offsets within one shared allocation per class.
//! - [`lock`]: the resource lock manager. One exclusive lock per live resource
//!   instance, a fixed global acquisition order for operations touching
//!   several resources at once, and a lifecycle state carried inside each
//!   lock slot.
//!
//! [`provision::Provisioner`] drives both across the full resource lifecycle:
//! create, plan, bind, map, record, submit, destroy.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use scoria::prelude::*;
//!
//! let device: Arc<dyn DeviceOps> = todo!("wrap your driver");
//! let mut provisioner = Provisioner::new(device, &LockCapacities::default());
//!
//! provisioner.create_buffers(&[4096, 4096], vk::BufferUsageFlags::UNIFORM_BUFFER);
//! provisioner.gather_requirements(ResourceClass::Buffer);
//! provisioner.plan_class(ResourceClass::Buffer)?;
//! provisioner.bind_class(ResourceClass::Buffer)?;
//!
//! provisioner.with_mapped(ResourceClass::Buffer, |ptr, size| {
//!     // Host-fill the shared allocation; the allocation-level lock is held.
//! }).ok();
//! # Ok::<(), scoria::plan::PlacementError>(())
//! ```
//!
//! ## Error policy
//!
//! Planner failures ([`plan::PlacementError`]) are values the caller must
//! check before binding. Driver-call failures are logged and the workflow
//! continues with whatever handle it has; see [`provision`] for why that
//! policy is preserved rather than "fixed". Lifecycle violations panic.

pub mod device;
pub mod lock;
pub mod plan;
pub mod provision;

pub use ash;

pub mod prelude {
    pub use crate::{
        ash,
        ash::vk,
        device::DeviceOps,
        lock::{LifecycleState, LockCapacities, LockTable, ResourceId, ResourceKind},
        plan::{PlacementError, PlacementPlan, ResourceClass},
        provision::Provisioner,
    };
}
