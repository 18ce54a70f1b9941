//! GPU context: instance, device, queue, command pool, readback buffer and fence (§4.1).
//!
//! Mirrors the teacher's `base/app.rs` object lifecycle (one struct owning every
//! reusable Vulkan handle, created once at startup) but built on raw `ash` so the
//! importer can reach `VK_KHR_external_memory_fd`.

use std::ffi::CStr;
use std::time::Duration;

use ash::extensions::khr::ExternalMemoryFd;
use ash::vk;
use tracing::{debug, error};

use super::GpuError;

const STAGING_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
const FENCE_TIMEOUT: Duration = Duration::from_millis(100);

/// The staging image mip chain blitted down to 1x1 for readback. Recreated only if a
/// later frame's dimensions no longer match (§9: resize mid-run is out of scope, so in
/// practice this is allocated once).
struct StagingImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    mip_levels: u32,
    width: u32,
    height: u32,
}

pub struct GpuContext {
    // Kept alive only to keep libvulkan.so loaded for the process lifetime; never read.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    readback_buffer: vk::Buffer,
    readback_memory: vk::DeviceMemory,
    external_memory_fd: ExternalMemoryFd,
    staging: Option<StagingImage>,
}

impl GpuContext {
    pub fn new() -> Result<Self, GpuError> {
        let entry = unsafe { ash::Entry::new() }.map_err(|e| GpuError::Loader(e.to_string()))?;

        let app_name = CStr::from_bytes_with_nul(b"wluma\0").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(app_name)
            .api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        // No validation layers by default (§4.1).
        let instance = unsafe { entry.create_instance(&instance_info, None) }.map_err(|e| match e {
            ash::InstanceError::VkError(r) => GpuError::Instance(r),
            ash::InstanceError::LoadError(strs) => GpuError::Loader(strs.join("; ")),
        })?;
        debug!("vulkan instance created");

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(GpuError::Instance)?;
        let (physical_device, queue_family_index) = physical_devices
            .into_iter()
            .find_map(|pd| find_graphics_queue_family(&instance, pd).map(|qfi| (pd, qfi)))
            .ok_or_else(|| {
                error!("no physical device exposes a graphics queue family");
                GpuError::NoPhysicalDevice
            })?;
        debug!(queue_family_index, "physical device selected");

        let queue_priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        // VK_EXT_external_memory_dma_buf contributes no functions of its own -- it just
        // adds the DMA_BUF_EXT handle type to VK_KHR_external_memory(_fd) -- so it has
        // no `ash::extensions` loader struct; it still has to be requested by name.
        let external_memory_dma_buf_ext = CStr::from_bytes_with_nul(
            b"VK_EXT_external_memory_dma_buf\0",
        )
        .unwrap();
        let device_extensions = [
            ash::extensions::khr::ExternalMemoryFd::name().as_ptr(),
            external_memory_dma_buf_ext.as_ptr(),
        ];
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_extensions);
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| {
                error!(error = %e, "logical device creation failed");
                GpuError::Device(e)
            })?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let external_memory_fd = ExternalMemoryFd::new(&instance, &device);
        debug!("logical device and queue created");

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(GpuError::Alloc)?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(GpuError::Alloc)?[0];

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.create_fence(&fence_info, None) }.map_err(GpuError::Alloc)?;

        let (readback_buffer, readback_memory) =
            create_host_visible_buffer(&instance, &device, physical_device, 4)?;
        debug!("readback buffer and fence allocated");

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            command_pool,
            command_buffer,
            fence,
            readback_buffer,
            readback_memory,
            external_memory_fd,
            staging: None,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn external_memory_fd(&self) -> &ExternalMemoryFd {
        &self.external_memory_fd
    }

    fn ensure_staging_image(&mut self, src_width: u32, src_height: u32) -> Result<(), GpuError> {
        let width = (src_width / 2).max(1);
        let height = (src_height / 2).max(1);
        if let Some(staging) = &self.staging {
            if staging.width == width && staging.height == height {
                return Ok(());
            }
            // §9: resize mid-run is out of scope; a dimension change tears down and
            // rebuilds the staging chain rather than juggling two live sizes.
            self.destroy_staging();
        }

        let mip_levels = (32 - width.max(height).leading_zeros()).max(1);
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(STAGING_FORMAT)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(GpuError::Alloc)?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &self.instance,
            self.physical_device,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap_or(0); // memory type 0 is acceptable on the universal heap (§4.1).
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }
            .map_err(GpuError::Alloc)?;
        unsafe { self.device.bind_image_memory(image, memory, 0) }.map_err(GpuError::Alloc)?;

        self.staging = Some(StagingImage {
            image,
            memory,
            mip_levels,
            width,
            height,
        });
        debug!(width, height, mip_levels, "staging image (re)allocated");
        Ok(())
    }

    fn destroy_staging(&mut self) {
        if let Some(staging) = self.staging.take() {
            unsafe {
                self.device.destroy_image(staging.image, None);
                self.device.free_memory(staging.memory, None);
            }
        }
    }

    /// Runs the blit-mipmap-readback algorithm of §4.3 against `src_image`, returning
    /// the raw `[R, G, B, A]` bytes read back from the final 1x1 mip, or `None` on any
    /// submit/wait/map failure (the caller turns that into the -1 luma sentinel).
    pub fn blit_mip_readback(
        &mut self,
        src_image: vk::Image,
        src_extent: (u32, u32),
    ) -> Option<[u8; 4]> {
        if let Err(err) = self.ensure_staging_image(src_extent.0, src_extent.1) {
            error!(error = %err, "failed to allocate staging image");
            return None;
        }
        let staging = self.staging.as_ref().expect("just ensured");

        let device = &self.device;
        let cmd = self.command_buffer;

        let result = (|| -> Result<(), vk::Result> {
            unsafe {
                device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
                let begin_info = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                device.begin_command_buffer(cmd, &begin_info)?;

                transition_image(
                    device,
                    cmd,
                    src_image,
                    0,
                    1,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                transition_image(
                    device,
                    cmd,
                    staging.image,
                    0,
                    staging.mip_levels,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );

                blit(
                    device,
                    cmd,
                    src_image,
                    (src_extent.0 as i32, src_extent.1 as i32),
                    0,
                    staging.image,
                    (staging.width as i32, staging.height as i32),
                    0,
                );

                let mut prev_w = staging.width as i32;
                let mut prev_h = staging.height as i32;
                for mip in 1..staging.mip_levels {
                    transition_image(
                        device,
                        cmd,
                        staging.image,
                        mip - 1,
                        1,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    );
                    let next_w = (prev_w / 2).max(1);
                    let next_h = (prev_h / 2).max(1);
                    blit(
                        device,
                        cmd,
                        staging.image,
                        (prev_w, prev_h),
                        mip - 1,
                        staging.image,
                        (next_w, next_h),
                        mip,
                    );
                    prev_w = next_w;
                    prev_h = next_h;
                }

                let last_mip = staging.mip_levels - 1;
                transition_image(
                    device,
                    cmd,
                    staging.image,
                    last_mip,
                    1,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );

                let region = vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: last_mip,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D { width: 1, height: 1, depth: 1 });
                device.cmd_copy_image_to_buffer(
                    cmd,
                    staging.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.readback_buffer,
                    std::slice::from_ref(&region),
                );

                device.end_command_buffer(cmd)?;

                let submit_info =
                    vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cmd));
                device.queue_submit(self.queue, std::slice::from_ref(&submit_info), self.fence)?;

                device.wait_for_fences(
                    std::slice::from_ref(&self.fence),
                    true,
                    FENCE_TIMEOUT.as_nanos() as u64,
                )?;
                Ok(())
            }
        })();

        if let Err(err) = result {
            error!(error = %err, "blit/readback submission failed");
            unsafe {
                let _ = self.device.reset_fences(std::slice::from_ref(&self.fence));
            }
            return None;
        }

        let bytes = unsafe {
            let ptr = self
                .device
                .map_memory(self.readback_memory, 0, 4, vk::MemoryMapFlags::empty())
                .ok()? as *const u8;
            let mut out = [0u8; 4];
            std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), 4);
            self.device.unmap_memory(self.readback_memory);
            self.device
                .reset_fences(std::slice::from_ref(&self.fence))
                .ok()?;
            out
        };
        Some(bytes)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.destroy_staging();
            self.device.destroy_buffer(self.readback_buffer, None);
            self.device.free_memory(self.readback_memory, None);
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn find_graphics_queue_family(instance: &ash::Instance, pd: vk::PhysicalDevice) -> Option<u32> {
    unsafe { instance.get_physical_device_queue_family_properties(pd) }
        .iter()
        .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

fn find_memory_type(
    instance: &ash::Instance,
    pd: vk::PhysicalDevice,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let props = unsafe { instance.get_physical_device_memory_properties(pd) };
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

fn create_host_visible_buffer(
    instance: &ash::Instance,
    device: &ash::Device,
    physical_device: vk::PhysicalDevice,
    size: vk::DeviceSize,
) -> Result<(vk::Buffer, vk::DeviceMemory), GpuError> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&buffer_info, None) }.map_err(GpuError::Alloc)?;

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory_type_index = find_memory_type(
        instance,
        physical_device,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .unwrap_or(0);
    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(GpuError::Alloc)?;
    unsafe { device.bind_buffer_memory(buffer, memory, 0) }.map_err(GpuError::Alloc)?;
    Ok((buffer, memory))
}

fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    base_mip: u32,
    level_count: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_mip,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn blit(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    src_extent: (i32, i32),
    src_mip: u32,
    dst: vk::Image,
    dst_extent: (i32, i32),
    dst_mip: u32,
) {
    let region = vk::ImageBlit::builder()
        .src_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: src_mip,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_offsets([
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D { x: src_extent.0, y: src_extent.1, z: 1 },
        ])
        .dst_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: dst_mip,
            base_array_layer: 0,
            layer_count: 1,
        })
        .dst_offsets([
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D { x: dst_extent.0, y: dst_extent.1, z: 1 },
        ]);
    unsafe {
        device.cmd_blit_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
            vk::Filter::LINEAR,
        );
    }
}
