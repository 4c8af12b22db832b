//! Image format support probing.
//!
//! Before an image is created, its (format, type, tiling, usage, flags) combination is
//! checked against the device. Unsupported combinations are relaxed in a fixed order
//! until the device accepts them:
//!
//! 1. `STORAGE` usage is dropped. Storage image support is the capability most
//!    commonly missing on constrained implementations.
//! 2. `OPTIMAL` tiling is replaced by `LINEAR`.
//!
//! Each relaxation that leads to a supported configuration is logged as a warning.
//! Results are cached per requested configuration, so the device is only queried
//! the first time a configuration is seen.

use std::{collections::HashMap, sync::RwLock};

use ash::{prelude::VkResult, vk};

use crate::error::{Result, VkResultExt};

/// The parameters of an image that determine whether the device supports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageFormatQuery {
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl ImageFormatQuery {
    pub fn from_create_info(info: &vk::ImageCreateInfo) -> Self {
        Self {
            format: info.format,
            image_type: info.image_type,
            tiling: info.tiling,
            usage: info.usage,
            flags: info.flags,
        }
    }

    /// Writes the parameters back into an image create info.
    pub fn apply_to(&self, info: &mut vk::ImageCreateInfo) {
        info.format = self.format;
        info.image_type = self.image_type;
        info.tiling = self.tiling;
        info.usage = self.usage;
        info.flags = self.flags;
    }

    /// The next step of the fallback search, if any remain.
    fn relax(&self) -> Option<(Relaxation, Self)> {
        if self.usage.contains(vk::ImageUsageFlags::STORAGE) {
            Some((
                Relaxation::DropStorage,
                Self {
                    usage: self.usage & !vk::ImageUsageFlags::STORAGE,
                    ..*self
                },
            ))
        } else if self.tiling == vk::ImageTiling::OPTIMAL {
            Some((
                Relaxation::LinearTiling,
                Self {
                    tiling: vk::ImageTiling::LINEAR,
                    ..*self
                },
            ))
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Relaxation {
    DropStorage,
    LinearTiling,
}

/// The resolution of an [`ImageFormatQuery`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatSupport {
    /// Supported, possibly after relaxing the requested parameters.
    Supported(ImageFormatQuery),
    Unsupported,
}

impl FormatSupport {
    /// Overwrites `query` with the supported parameters. Returns whether the
    /// configuration is supported; an unsupported result leaves `query` untouched.
    pub fn apply(&self, query: &mut ImageFormatQuery) -> bool {
        match self {
            Self::Supported(supported) => {
                *query = *supported;
                true
            }
            Self::Unsupported => false,
        }
    }
}

/// Append-only cache of format support results.
///
/// Safe to share between threads. Two threads probing the same unseen
/// configuration may both query the device; they will store the same result.
#[derive(Default)]
pub struct FormatSupportCache {
    entries: RwLock<HashMap<ImageFormatQuery, FormatSupport>>,
}

impl FormatSupportCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &ImageFormatQuery) -> Option<FormatSupport> {
        self.entries.read().unwrap().get(query).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks whether `query` is supported, relaxing it if necessary.
    ///
    /// `query_device` returns `Ok(false)` when the device reports
    /// `VK_ERROR_FORMAT_NOT_SUPPORTED`. Any other error aborts the search.
    ///
    /// On success `query` holds the parameters to create the image with.
    pub fn probe(
        &self,
        query: &mut ImageFormatQuery,
        mut query_device: impl FnMut(&ImageFormatQuery) -> VkResult<bool>,
    ) -> Result<bool> {
        let support = match self.get(query) {
            Some(support) => support,
            None => self.resolve(*query, &mut query_device)?,
        };
        Ok(support.apply(query))
    }

    fn resolve(
        &self,
        requested: ImageFormatQuery,
        query_device: &mut impl FnMut(&ImageFormatQuery) -> VkResult<bool>,
    ) -> Result<FormatSupport> {
        if let Some(support) = self.get(&requested) {
            return Ok(support);
        }
        let supported =
            query_device(&requested).context("vkGetPhysicalDeviceImageFormatProperties")?;
        let support = if supported {
            FormatSupport::Supported(requested)
        } else if let Some((relaxation, relaxed)) = requested.relax() {
            let support = self.resolve(relaxed, query_device)?;
            if support != FormatSupport::Unsupported {
                match relaxation {
                    Relaxation::DropStorage => tracing::warn!(
                        format = ?requested.format,
                        "Storage image usage was removed due to lack of support"
                    ),
                    Relaxation::LinearTiling => tracing::warn!(
                        format = ?requested.format,
                        "TILING_OPTIMAL was changed to TILING_LINEAR due to lack of support"
                    ),
                }
            }
            support
        } else {
            FormatSupport::Unsupported
        };
        self.entries.write().unwrap().insert(requested, support);
        Ok(support)
    }
}
