//! The external device boundary.
//!
//! Everything that actually talks to a driver lives behind [`DeviceOps`]. The
//! core invokes these operations but never implements them: object creation and
//! destruction, memory allocation, binding, mapping, and submission are the
//! collaborator's business. The core's own job is deciding *where* memory goes
//! (see [`crate::plan`]) and serializing *who* touches each handle (see
//! [`crate::lock`]).
//!
//! The trait is expressed in raw `ash::vk` handle and descriptor types, which
//! are plain data and carry no driver state of their own. A production
//! implementation forwards each method to the corresponding `ash::Device`
//! entry point; tests implement the trait directly over in-memory state.
//!
//! Fallible operations return [`VkResult`], matching the `vk::Result` codes a
//! real driver reports. The provisioning workflow's policy for these errors is
//! log-and-continue, not abort; see [`crate::provision`].

use std::ffi::c_void;

use ash::{prelude::VkResult, vk};

/// Driver-side operations the provisioning core consumes.
///
/// Object-safe so the workflow can hold it as `Arc<dyn DeviceOps>`; `Send +
/// Sync` because call sites are serialized by the per-resource lock
/// discipline, never by the implementation.
pub trait DeviceOps: Send + Sync {
    /// Memory heaps and types of the current device. Queried once per device;
    /// the result is immutable for the device's lifetime.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> VkResult<vk::Image>;

    fn destroy_image(&self, image: vk::Image);

    /// Size and acceptable-type mask for a buffer. Called once per buffer,
    /// after creation and before binding.
    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// Size and acceptable-type mask for an image.
    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// Allocates one block of device memory on the given type index.
    fn allocate(&self, size: vk::DeviceSize, type_index: u32) -> VkResult<vk::DeviceMemory>;

    fn free(&self, memory: vk::DeviceMemory);

    /// Binds a buffer at a fixed byte offset within an allocation.
    /// Irreversible; a bound buffer is never rebound.
    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    fn bind_image(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Maps an entire allocation for host access.
    ///
    /// Callers must hold the allocation-level map lock; two resources sharing
    /// an allocation must never be mapped concurrently even though each has
    /// its own per-resource lock.
    fn map(&self, memory: vk::DeviceMemory) -> VkResult<*mut c_void>;

    fn unmap(&self, memory: vk::DeviceMemory);

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Schedules a command buffer on a queue. Start order is the submission
    /// order; completion order is not guaranteed.
    fn submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Blocks until the device is idle. The only form of waiting the core
    /// performs; there is no internal retry or timeout handling.
    fn wait_idle(&self) -> VkResult<()>;
}
