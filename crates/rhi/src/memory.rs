//! Memory-type selection for dedicated allocations.

use ash::vk;

use crate::error::{RhiError, RhiResult};

/// Property flags for persistently mapped, CPU-written memory.
pub const HOST_MAPPED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Property flags for GPU-only memory.
pub const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

/// Finds the first memory type allowed by `type_filter` that has every flag in
/// `properties`.
///
/// `type_filter` is the `memory_type_bits` field of a `vk::MemoryRequirements`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableMemoryType`] when no type qualifies.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> RhiResult<u32> {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, memory_type)| {
            type_filter & (1 << i) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(i, _)| i as u32)
        .ok_or(RhiError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_first_matching_type_wins() {
        let props = properties_with(&[DEVICE_LOCAL, HOST_MAPPED, HOST_MAPPED | DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&props, 0b111, HOST_MAPPED).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b111, DEVICE_LOCAL).unwrap(), 0);
    }

    #[test]
    fn test_type_filter_excludes_types() {
        let props = properties_with(&[DEVICE_LOCAL, HOST_MAPPED, HOST_MAPPED | DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&props, 0b100, HOST_MAPPED).unwrap(), 2);
        assert_eq!(find_memory_type(&props, 0b110, DEVICE_LOCAL).unwrap(), 2);
    }

    #[test]
    fn test_superset_of_properties_matches() {
        let props = properties_with(&[HOST_MAPPED | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            0
        );
    }

    #[test]
    fn test_no_suitable_memory_type() {
        let props = properties_with(&[DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, HOST_MAPPED).unwrap_err();
        assert!(matches!(
            err,
            RhiError::NoSuitableMemoryType { type_filter: 0b1, .. }
        ));
    }

    #[test]
    fn test_types_beyond_count_are_ignored() {
        let mut props = properties_with(&[DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST_MAPPED;
        assert!(find_memory_type(&props, 0b11, HOST_MAPPED).is_err());
    }
}
