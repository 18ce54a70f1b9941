//! Imports a compositor-exported DMA-BUF frame as an aliased Vulkan image (§4.2).

use std::os::unix::io::RawFd;

use ash::vk;
use tracing::error;

use super::context::GpuContext;
use super::ImportError;
use crate::compositor::{close_fd, dup_fd};
use crate::frame::FrameDescriptor;

const IMPORTED_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// An image aliased over a duplicated DMA-BUF fd. The transient image and memory are
/// destroyed every cycle (§4.3); `Drop` also closes the owned duplicate fd exactly once.
pub struct ImportedImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    width: u32,
    height: u32,
    owned_fd: RawFd,
}

impl ImportedImage {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Imports plane 0 of `frame` as a sampled/transfer-source image (§4.2). Any frame
    /// with more than one plane, or a non-default DRM modifier, is rejected outright --
    /// the dispatcher treats that as a permanent failure.
    pub fn import(context: &GpuContext, frame: &FrameDescriptor) -> Result<Self, ImportError> {
        if frame.plane_count() != 1 {
            return Err(ImportError::TooManyPlanes(frame.plane_count()));
        }
        if let Some(modifier) = frame.modifier {
            if modifier != 0 {
                return Err(ImportError::UnsupportedModifier(modifier));
            }
        }
        let plane = frame.planes[0];
        let owned_fd = dup_fd(plane.fd);

        let device = context.device();

        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let image_info = vk::ImageCreateInfo::builder()
            .push_next(&mut external_info)
            .image_type(vk::ImageType::TYPE_2D)
            .format(IMPORTED_FORMAT)
            .extent(vk::Extent3D {
                width: frame.width,
                height: frame.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
            close_fd(owned_fd);
            ImportError::CreateImage(e)
        })?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let fd_properties = unsafe {
            context
                .external_memory_fd()
                .get_memory_fd_properties_khr(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, owned_fd)
        };
        let type_bits = fd_properties
            .map(|p| p.memory_type_bits & requirements.memory_type_bits)
            .unwrap_or(requirements.memory_type_bits);
        let memory_type_index = find_importable_memory_type(context, type_bits).unwrap_or(0);

        let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(owned_fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut dedicated_info)
            .push_next(&mut import_info);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            unsafe { device.destroy_image(image, None) };
            close_fd(owned_fd);
            ImportError::ImportMemory(e)
        })?;

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            close_fd(owned_fd);
            return Err(ImportError::BindMemory(e));
        }

        Ok(Self {
            image,
            memory,
            width: frame.width,
            height: frame.height,
            owned_fd,
        })
    }

    /// Destroys the image and memory against `context`'s device. Must be called before
    /// the `ImportedImage` is dropped; `Drop` only closes the fd, since it has no handle
    /// back to the device.
    pub fn destroy(mut self, context: &GpuContext) {
        unsafe {
            context.device().destroy_image(self.image, None);
            context.device().free_memory(self.memory, None);
        }
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
    }
}

impl Drop for ImportedImage {
    fn drop(&mut self) {
        if self.image != vk::Image::null() {
            error!("ImportedImage dropped without destroy(); leaking GPU image/memory handles");
        }
        close_fd(self.owned_fd);
    }
}

fn find_importable_memory_type(context: &GpuContext, type_bits: u32) -> Option<u32> {
    let props =
        unsafe { context.instance().get_physical_device_memory_properties(context.physical_device()) };
    (0..props.memory_type_count).find(|&i| (type_bits & (1 << i)) != 0)
}
