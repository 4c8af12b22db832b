//! Handles to the host application's Vulkan device.
//!
//! The instance, physical device and logical device are created and destroyed by the
//! host application. [`Device`] only borrows them for the lifetime of the allocator,
//! and provides the handful of device-level queries the allocator needs.
//!
//! ```no_run
//! # use pumicite_memory::Device;
//! # fn host_handles() -> (ash::Instance, ash::vk::PhysicalDevice, ash::Device) { unimplemented!() }
//! let (instance, physical_device, device) = host_handles();
//! let device = unsafe { Device::from_raw(instance, physical_device, device) };
//! ```

use std::{fmt::Debug, ops::Deref, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{format::ImageFormatQuery, utils::AsVkHandle};

/// A trait for types created from a Vulkan device.
pub trait HasDevice {
    /// Returns a reference to the Vulkan device.
    fn device(&self) -> &Device;

    /// Returns the Vulkan physical device handle.
    ///
    /// This is a convenience method that delegates to `self.device().physical_device()`.
    fn physical_device(&self) -> vk::PhysicalDevice {
        self.device().physical_device()
    }
}

/// A Vulkan logical device owned by the host application.
///
/// Reference-counted using [`Arc`] for cheap shared access. Dropping the last
/// reference does **not** destroy the device.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.device.handle())
            .finish()
    }
}

struct DeviceInner {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
}
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl Device {
    /// Wraps handles created by the host application.
    ///
    /// # Safety
    /// `device` must have been created from `physical_device`, which must belong to
    /// `instance`. All three must outlive every object created through this wrapper.
    pub unsafe fn from_raw(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        Self(Arc::new(DeviceInner {
            instance,
            physical_device,
            device,
        }))
    }

    /// Returns a reference to the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.0.instance
    }

    /// Returns the physical device this device was created from.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }

    /// Queries image format properties for a specific configuration.
    ///
    /// Returns `Ok(None)` if the format is not supported for the given parameters.
    /// Any other failure is returned as an error.
    pub fn image_format_properties(
        &self,
        query: &ImageFormatQuery,
    ) -> VkResult<Option<vk::ImageFormatProperties>> {
        unsafe {
            match self.0.instance.get_physical_device_image_format_properties(
                self.0.physical_device,
                query.format,
                query.image_type,
                query.tiling,
                query.usage,
                query.flags,
            ) {
                Ok(properties) => Ok(Some(properties)),
                Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(None),
                Err(err) => Err(err),
            }
        }
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}
impl AsVkHandle for Device {
    type Handle = vk::Device;

    fn vk_handle(&self) -> Self::Handle {
        self.0.device.handle()
    }
}
