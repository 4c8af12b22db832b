//! Error types.
//!
//! Every native call is checked where it is made and converted into an [`Error`]
//! through [`VkResultExt::context`], which attaches the name of the failing
//! operation to the Vulkan result code.

use std::thread::ThreadId;

use ash::{prelude::VkResult, vk};

use crate::format::ImageFormatQuery;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by the allocator or the resource registry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A Vulkan or VMA call returned an error code.
    #[error("{op} failed: {result}")]
    Vk {
        /// The native operation that failed.
        op: &'static str,
        result: vk::Result,
    },

    /// Buffers must have a non-zero size.
    #[error("buffer size must be greater than 0")]
    ZeroSizedBuffer,

    /// The device requires a dedicated allocation for an image, but the consumer
    /// of the shared memory cannot import dedicated allocations.
    #[error(
        "the device requires a dedicated allocation for this image, but dedicated memory import is disabled"
    )]
    DedicatedImportUnsupported,

    /// No supported configuration was found for the image, even after relaxing
    /// storage usage and tiling.
    #[error("image configuration is not supported by the device: {0:?}")]
    UnsupportedImageFormat(ImageFormatQuery),

    /// An object heap was used from a thread other than the one that owns it.
    #[error("object heap owned by thread {owner:?} was accessed from thread {caller:?}")]
    ForeignThread { owner: ThreadId, caller: ThreadId },
}

/// Attaches an operation label to native results.
pub trait VkResultExt<T> {
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|result| Error::Vk { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_result_code() {
        let result: VkResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = result.context("vmaCreatePool").unwrap_err();
        assert!(matches!(
            err,
            Error::Vk {
                op: "vmaCreatePool",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
        assert!(err.to_string().starts_with("vmaCreatePool failed"));
    }
}
