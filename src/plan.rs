//! Memory placement planning.
//!
//! This module decides, for each [`ResourceClass`], which device memory type the
//! class's shared allocation should live in, and at which byte offset each member
//! resource is bound within that allocation.
//!
//! # Overview
//!
//! All resources of one class (every buffer, or every image) share a single
//! contiguous allocation on a single memory type. The planner scans the device's
//! memory types in ascending index order and picks the first one that:
//!
//! - is host-visible and host-coherent, if the class is written by the host
//!   (buffers are filled directly by the CPU; images are populated on-device),
//! - belongs to a heap large enough for the class total,
//! - is accepted by **every** member's `memory_type_bits`, and
//! - is not already claimed by another class whose total, combined with this
//!   one, would overflow the shared heap.
//!
//! Lower-numbered types win even when a later type has more headroom. This is a
//! deliberate first-fit policy, not an optimizer.
//!
//! Offsets are a running sum in declaration order with no alignment padding
//! between members. Callers that need aligned suballocation must pad the
//! requirement sizes themselves before planning.
//!
//! # Quick Start
//!
//! ```
//! use ash::vk;
//! use scoria::plan::{PlacementPlan, ResourceClass};
//!
//! # let mut props = vk::PhysicalDeviceMemoryProperties {
//! #     memory_type_count: 1,
//! #     memory_heap_count: 1,
//! #     ..Default::default()
//! # };
//! # props.memory_types[0] = vk::MemoryType {
//! #     property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
//! #         | vk::MemoryPropertyFlags::HOST_COHERENT,
//! #     heap_index: 0,
//! # };
//! # props.memory_heaps[0] = vk::MemoryHeap { size: 1 << 20, flags: Default::default() };
//! let requirements = vec![vk::MemoryRequirements {
//!     size: 4096,
//!     alignment: 1,
//!     memory_type_bits: !0,
//! }];
//!
//! let mut plan = PlacementPlan::new(ResourceClass::Buffer);
//! plan.compute(&requirements, &props, &[]).unwrap();
//! assert_eq!(plan.offsets(), &[0]);
//! let placement = plan.consume();
//! assert_eq!(placement.total_size, 4096);
//! ```

use ash::vk;

/// A group of same-kind resources allocated together into one shared memory block.
///
/// The class determines the host-visibility constraint used during planning:
/// buffer memory must be mappable and coherent so the host can fill it without
/// explicit flushes, while image memory is only ever touched by device-side work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// All buffers. Host-written; requires `HOST_VISIBLE | HOST_COHERENT` memory.
    Buffer,
    /// All images. Device-populated; no host-visibility requirement.
    Image,
}

impl ResourceClass {
    pub const COUNT: usize = 2;

    pub const ALL: [ResourceClass; Self::COUNT] = [ResourceClass::Buffer, ResourceClass::Image];

    /// Whether this class's allocation must be directly writable by the host.
    pub fn requires_host_access(self) -> bool {
        match self {
            ResourceClass::Buffer => true,
            ResourceClass::Image => false,
        }
    }
}

/// Planning failed for a class; its resources must not be allocated or bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// No memory type satisfies the class's visibility, capacity, compatibility,
    /// and packing constraints.
    #[error("no suitable memory type for {0:?} class")]
    NoSuitableType(ResourceClass),
    /// A bind was attempted for a class that was never successfully planned.
    #[error("{0:?} class has no computed placement")]
    NotPlanned(ResourceClass),
}

/// Placement already claimed by another class: its chosen type index and the
/// class total in bytes. Used for the packing-conflict check when two classes
/// land on the same memory type.
pub type ClaimedPlacement = (ResourceClass, u32, vk::DeviceSize);

/// Selects the memory type for a class: first-fit, index-ascending.
///
/// Returns the lowest type index satisfying all constraints, or `None` if the
/// class cannot be placed. The scan is deterministic; given identical inputs it
/// always returns the same index.
///
/// `already_chosen` lists placements previously claimed by other classes. A
/// candidate type is rejected if some other class already claimed that exact
/// index and the two class totals jointly exceed the heap capacity. Two classes
/// may still share a type when their sizes fit the heap together.
pub fn select_memory_type(
    class: ResourceClass,
    requirements: &[vk::MemoryRequirements],
    props: &vk::PhysicalDeviceMemoryProperties,
    already_chosen: &[ClaimedPlacement],
) -> Option<u32> {
    let total: vk::DeviceSize = requirements.iter().map(|r| r.size).sum();
    let host_access = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    for index in 0..props.memory_type_count {
        let memory_type = &props.memory_types[index as usize];
        let heap = &props.memory_heaps[memory_type.heap_index as usize];

        if class.requires_host_access() && !memory_type.property_flags.contains(host_access) {
            continue;
        }
        if heap.size < total {
            continue;
        }
        if !type_supports_all(index, requirements) {
            continue;
        }
        let conflict = already_chosen
            .iter()
            .any(|&(_, chosen, their_total)| chosen == index && their_total + total > heap.size);
        if conflict {
            continue;
        }
        return Some(index);
    }
    None
}

/// True if every requirement in the class accepts the given memory type index.
///
/// `memory_type_bits` is a mask with bit `i` set when type index `i` is
/// acceptable; the whole class must agree on one type, so this is an AND
/// across members, not an OR.
fn type_supports_all(index: u32, requirements: &[vk::MemoryRequirements]) -> bool {
    let bit = 1u32 << index;
    requirements.iter().all(|r| r.memory_type_bits & bit != 0)
}

/// State of a [`PlacementPlan`] in its compute-once, apply-once lifecycle.
///
/// ```text
/// Pending -> Computed -> Consumed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    /// Created, no placement computed yet.
    Pending,
    /// Placement computed; ready to be applied to an allocation exactly once.
    Computed,
    /// Placement handed out to the bind step. Terminal.
    Consumed,
}

/// The planner's output for one class: a chosen memory type plus per-resource
/// byte offsets.
///
/// A plan is computed at most once and consumed at most once; recomputing or
/// double-applying a plan is a programming error and panics. The surrounding
/// workflow allocates one block of `total_size` bytes on `type_index` and binds
/// member `i` at `offsets[i]`.
#[derive(Debug)]
pub struct PlacementPlan {
    class: ResourceClass,
    type_index: u32,
    total_size: vk::DeviceSize,
    offsets: Vec<vk::DeviceSize>,
    state: PlanState,
}

/// The consumable payload of a computed [`PlacementPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub class: ResourceClass,
    pub type_index: u32,
    pub total_size: vk::DeviceSize,
    pub offsets: Vec<vk::DeviceSize>,
}

impl PlacementPlan {
    /// Creates an empty plan in the [`Pending`](PlanState::Pending) state.
    pub fn new(class: ResourceClass) -> Self {
        Self {
            class,
            type_index: u32::MAX,
            total_size: 0,
            offsets: Vec::new(),
            state: PlanState::Pending,
        }
    }

    /// Returns the class this plan places.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PlanState {
        self.state
    }

    /// Runs type selection and offset assignment over the class requirements.
    ///
    /// On success the plan transitions to [`Computed`](PlanState::Computed). On
    /// [`PlacementError::NoSuitableType`] the plan stays `Pending` and the class
    /// must not be allocated or bound; there are no side effects to undo.
    ///
    /// # Panics
    ///
    /// Panics if the plan was already computed. Plans are never recomputed;
    /// build a new one if the requirements change.
    pub fn compute(
        &mut self,
        requirements: &[vk::MemoryRequirements],
        props: &vk::PhysicalDeviceMemoryProperties,
        already_chosen: &[ClaimedPlacement],
    ) -> Result<(), PlacementError> {
        assert_eq!(
            self.state,
            PlanState::Pending,
            "placement plan for {:?} class computed twice",
            self.class
        );
        let type_index = select_memory_type(self.class, requirements, props, already_chosen)
            .ok_or(PlacementError::NoSuitableType(self.class))?;

        // Running sum in declaration order. No alignment padding is inserted
        // between members; requirement sizes must already account for any
        // padding the caller needs.
        let mut offsets = Vec::with_capacity(requirements.len());
        let mut cursor: vk::DeviceSize = 0;
        for requirement in requirements {
            offsets.push(cursor);
            cursor += requirement.size;
        }

        self.type_index = type_index;
        self.total_size = cursor;
        self.offsets = offsets;
        self.state = PlanState::Computed;
        Ok(())
    }

    /// Returns the chosen memory type index.
    ///
    /// # Panics
    ///
    /// Panics if the plan has not been computed.
    pub fn type_index(&self) -> u32 {
        assert_ne!(self.state, PlanState::Pending, "plan not computed");
        self.type_index
    }

    /// Returns the class total in bytes.
    pub fn total_size(&self) -> vk::DeviceSize {
        assert_ne!(self.state, PlanState::Pending, "plan not computed");
        self.total_size
    }

    /// Returns the per-resource offsets in declaration order.
    pub fn offsets(&self) -> &[vk::DeviceSize] {
        assert_ne!(self.state, PlanState::Pending, "plan not computed");
        &self.offsets
    }

    /// Hands the placement to the allocate/bind step and transitions the plan
    /// to [`Consumed`](PlanState::Consumed).
    ///
    /// # Panics
    ///
    /// Panics unless the plan is in the [`Computed`](PlanState::Computed)
    /// state. A placement feeds exactly one allocation; consuming twice would
    /// double-apply it.
    pub fn consume(&mut self) -> Placement {
        assert_eq!(
            self.state,
            PlanState::Computed,
            "placement plan for {:?} class must be computed exactly once before it is applied",
            self.class
        );
        self.state = PlanState::Consumed;
        Placement {
            class: self.class,
            type_index: self.type_index,
            total_size: self.total_size,
            offsets: std::mem::take(&mut self.offsets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(size: vk::DeviceSize, memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment: 1,
            memory_type_bits,
        }
    }

    fn device_props(
        heaps: &[vk::DeviceSize],
        types: &[(u32, vk::MemoryPropertyFlags)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: heaps.len() as u32,
            ..Default::default()
        };
        for (i, &size) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: vk::MemoryHeapFlags::empty(),
            };
        }
        for (i, &(heap_index, property_flags)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );
    const DEVICE_ONLY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn buffer_class_skips_non_host_visible_heap() {
        // Heap 0 is device-local only; the buffer class must land on heap 1.
        let props = device_props(&[1000, 5000], &[(0, DEVICE_ONLY), (1, HOST)]);
        let requirements = [requirement(4096, !0)];
        let chosen =
            select_memory_type(ResourceClass::Buffer, &requirements, &props, &[]).unwrap();
        assert_eq!(chosen, 1);
    }

    #[test]
    fn image_class_may_use_device_local_memory() {
        let props = device_props(&[1000, 5000], &[(0, DEVICE_ONLY), (1, HOST)]);
        let requirements = [requirement(512, !0)];
        let chosen = select_memory_type(ResourceClass::Image, &requirements, &props, &[]).unwrap();
        assert_eq!(chosen, 0);
    }

    #[test]
    fn shared_type_rejected_when_combined_totals_overflow_heap() {
        // Buffer class already claimed type 0 with 2000 bytes out of a 5000
        // byte heap. The image class alone would fit, but 2000 + 4000 > 5000.
        let props = device_props(&[5000], &[(0, HOST)]);
        let requirements = [requirement(4000, 0b1)];
        let claimed = [(ResourceClass::Buffer, 0, 2000)];
        assert_eq!(
            select_memory_type(ResourceClass::Image, &requirements, &props, &claimed),
            None
        );
    }

    #[test]
    fn classes_share_a_type_when_they_jointly_fit() {
        let props = device_props(&[8000], &[(0, HOST)]);
        let requirements = [requirement(4000, 0b1)];
        let claimed = [(ResourceClass::Buffer, 0, 2000)];
        assert_eq!(
            select_memory_type(ResourceClass::Image, &requirements, &props, &claimed),
            Some(0)
        );
    }

    #[test]
    fn every_member_must_accept_the_chosen_type() {
        // Type 0 is acceptable for the first member only; the class must fall
        // through to type 1, which both accept.
        let props = device_props(&[4096, 4096], &[(0, HOST), (1, HOST)]);
        let requirements = [requirement(16, 0b01 | 0b10), requirement(16, 0b10)];
        let chosen =
            select_memory_type(ResourceClass::Buffer, &requirements, &props, &[]).unwrap();
        assert_eq!(chosen, 1);
    }

    #[test]
    fn first_fit_prefers_lowest_index_over_headroom() {
        // Type 1's heap has far more headroom, but type 0 fits and wins.
        let props = device_props(&[1024, 1 << 30], &[(0, HOST), (1, HOST)]);
        let requirements = [requirement(512, !0)];
        for _ in 0..3 {
            assert_eq!(
                select_memory_type(ResourceClass::Buffer, &requirements, &props, &[]),
                Some(0)
            );
        }
    }

    #[test]
    fn heap_capacity_is_checked_against_class_total() {
        let props = device_props(&[1000], &[(0, HOST)]);
        let requirements = [requirement(600, !0), requirement(600, !0)];
        assert_eq!(
            select_memory_type(ResourceClass::Buffer, &requirements, &props, &[]),
            None
        );
    }

    #[test]
    fn offsets_are_a_running_sum_with_no_padding() {
        let props = device_props(&[4096], &[(0, HOST)]);
        let requirements = [
            requirement(100, !0),
            requirement(250, !0),
            requirement(64, !0),
        ];
        let mut plan = PlacementPlan::new(ResourceClass::Buffer);
        plan.compute(&requirements, &props, &[]).unwrap();
        assert_eq!(plan.offsets(), &[0, 100, 350]);
        assert_eq!(plan.total_size(), 414);
    }

    #[test]
    fn plan_walks_pending_computed_consumed() {
        let props = device_props(&[4096], &[(0, HOST)]);
        let requirements = [requirement(128, !0)];
        let mut plan = PlacementPlan::new(ResourceClass::Buffer);
        assert_eq!(plan.state(), PlanState::Pending);
        plan.compute(&requirements, &props, &[]).unwrap();
        assert_eq!(plan.state(), PlanState::Computed);
        let placement = plan.consume();
        assert_eq!(plan.state(), PlanState::Consumed);
        assert_eq!(placement.type_index, 0);
        assert_eq!(placement.offsets, vec![0]);
    }

    #[test]
    fn failed_compute_leaves_plan_pending() {
        let props = device_props(&[64], &[(0, HOST)]);
        let requirements = [requirement(128, !0)];
        let mut plan = PlacementPlan::new(ResourceClass::Buffer);
        assert_eq!(
            plan.compute(&requirements, &props, &[]),
            Err(PlacementError::NoSuitableType(ResourceClass::Buffer))
        );
        assert_eq!(plan.state(), PlanState::Pending);
    }

    #[test]
    #[should_panic(expected = "computed twice")]
    fn recomputing_a_plan_panics() {
        let props = device_props(&[4096], &[(0, HOST)]);
        let requirements = [requirement(128, !0)];
        let mut plan = PlacementPlan::new(ResourceClass::Buffer);
        plan.compute(&requirements, &props, &[]).unwrap();
        let _ = plan.compute(&requirements, &props, &[]);
    }

    #[test]
    #[should_panic(expected = "exactly once")]
    fn consuming_a_plan_twice_panics() {
        let props = device_props(&[4096], &[(0, HOST)]);
        let requirements = [requirement(128, !0)];
        let mut plan = PlacementPlan::new(ResourceClass::Buffer);
        plan.compute(&requirements, &props, &[]).unwrap();
        let _ = plan.consume();
        let _ = plan.consume();
    }

    #[test]
    #[should_panic(expected = "exactly once")]
    fn consuming_a_pending_plan_panics() {
        let mut plan = PlacementPlan::new(ResourceClass::Image);
        let _ = plan.consume();
    }
}
