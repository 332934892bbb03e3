//! Utilities for aligning memory offsets and sizes

use ash::vk;

/// Align a value up to the next multiple of `alignment`. Values that are already aligned are returned unchanged.
/// An alignment of zero is treated as one.
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    match value % alignment {
        0 => value,
        rem => value + (alignment - rem),
    }
}

/// Align a value down to the previous multiple of `alignment`. The alignment must be a power of two.
pub fn align_down_pow2(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    value & !(alignment - 1)
}

/// Check whether the last byte of the first range lives on the same (or a later) page as the
/// first byte of the second range. Both ranges are given as offsets into the same memory object.
pub fn is_aliasing(
    first_offset: vk::DeviceSize,
    first_size: vk::DeviceSize,
    second_offset: vk::DeviceSize,
    page_size: vk::DeviceSize,
) -> bool {
    debug_assert!(first_size > 0);
    debug_assert!(page_size > 0);

    let first_end = first_offset + (first_size - 1);
    let first_end_page = align_down_pow2(first_end, page_size);
    let second_start_page = align_down_pow2(second_offset, page_size);
    first_end_page >= second_start_page
}
