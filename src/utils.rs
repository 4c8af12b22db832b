use std::ops::{Bound, RangeBounds};

use ash::vk;

pub trait AsVkHandle {
    type Handle: ash::vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}
impl<T> AsVkHandle for &'_ mut T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// Resolves a byte range against a resource of `size` bytes into `(offset, size)`.
///
/// The range is clamped to the resource.
pub(crate) fn resolve_range(
    range: impl RangeBounds<vk::DeviceSize>,
    size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let offset = match range.start_bound() {
        Bound::Included(start) => *start,
        Bound::Excluded(start) => start.saturating_add(1),
        Bound::Unbounded => 0,
    }
    .min(size);
    let end = match range.end_bound() {
        Bound::Included(end) => end.saturating_add(1),
        Bound::Excluded(end) => *end,
        Bound::Unbounded => size,
    }
    .min(size);
    (offset, end.saturating_sub(offset))
}
