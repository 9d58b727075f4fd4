//! DPB 图像: 解码输出兼参考图像.
//!
//! 每个槽位一张 NV12 图像, 独立分配设备内存. 除解码用的完整视图外,
//! 另外创建亮度/色度两个平面视图供计算着色器采样.

use std::cell::Cell;
use std::sync::Arc;

use ash::vk;
use log::debug;

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::session::{PICTURE_FORMAT, VideoProfile};

/// 计算着色器读取平面所需的视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneViews {
    pub image: vk::Image,
    pub luma: vk::ImageView,
    pub chroma: vk::ImageView,
}

/// 一个 DPB 槽位的图像
pub struct DpbImage {
    ctx: Arc<VulkanContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    luma_view: vk::ImageView,
    chroma_view: vk::ImageView,
    extent: vk::Extent2D,
    /// 图像已转换到解码布局
    initialized: Cell<bool>,
}

impl DpbImage {
    /// 创建图像, 分配并绑定设备内存, 创建视图
    pub fn create(
        ctx: Arc<VulkanContext>,
        profile: &VideoProfile,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let device = ctx.device().clone();
        let families = ctx.queue_family_indices();
        let sharing = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let image = profile.with_info(|info| {
            let mut profile_list =
                vk::VideoProfileListInfoKHR::default().profiles(std::slice::from_ref(info));
            let create_info = vk::ImageCreateInfo::default()
                .flags(vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE)
                .image_type(vk::ImageType::TYPE_2D)
                .format(PICTURE_FORMAT)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(
                    vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
                        | vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
                        | vk::ImageUsageFlags::SAMPLED,
                )
                .sharing_mode(sharing)
                .queue_family_indices(&families)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut profile_list);
            unsafe {
                // SAFETY: 创建信息在调用期间有效
                device.create_image(&create_info, None)
            }
        });
        let image = image.map_err(VulkanError::call("vkCreateImage"))?;

        // 以下步骤失败时逐一回收
        let mut this = Self {
            ctx,
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            luma_view: vk::ImageView::null(),
            chroma_view: vk::ImageView::null(),
            extent,
            initialized: Cell::new(false),
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        this.memory = this
            .ctx
            .allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        unsafe { device.bind_image_memory(image, this.memory, 0) }
            .map_err(VulkanError::call("vkBindImageMemory"))?;

        this.view = this.create_view(
            PICTURE_FORMAT,
            vk::ImageAspectFlags::COLOR,
            vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR | vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR,
        )?;
        this.luma_view = this.create_view(
            vk::Format::R8_UNORM,
            vk::ImageAspectFlags::PLANE_0,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        this.chroma_view = this.create_view(
            vk::Format::R8G8_UNORM,
            vk::ImageAspectFlags::PLANE_1,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        Ok(this)
    }

    fn create_view(
        &self,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        usage: vk::ImageUsageFlags,
    ) -> VulkanResult<vk::ImageView> {
        let mut usage_info = vk::ImageViewUsageCreateInfo::default().usage(usage);
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .push_next(&mut usage_info);
        unsafe { self.ctx.device().create_image_view(&info, None) }
            .map_err(VulkanError::call("vkCreateImageView"))
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// 解码使用的完整视图
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn plane_views(&self) -> PlaneViews {
        PlaneViews {
            image: self.image,
            luma: self.luma_view,
            chroma: self.chroma_view,
        }
    }

    /// 解码引用的图像资源描述
    pub fn picture_resource(&self) -> vk::VideoPictureResourceInfoKHR<'static> {
        vk::VideoPictureResourceInfoKHR::default()
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .coded_extent(self.extent)
            .base_array_layer(0)
            .image_view_binding(self.view)
    }

    /// 首次作为解码目标时返回从 UNDEFINED 转换的屏障
    pub fn take_initial_barrier(&self) -> Option<vk::ImageMemoryBarrier2<'static>> {
        if self.initialized.replace(true) {
            return None;
        }
        Some(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::NONE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::VIDEO_DECODE_KHR)
                .dst_access_mask(
                    vk::AccessFlags2::VIDEO_DECODE_READ_KHR
                        | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
                )
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::VIDEO_DECODE_DPB_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
                .subresource_range(color_range()),
        )
    }
}

/// 整张图像的子资源范围
pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for DpbImage {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            // SAFETY: 调用方已等待设备空闲; 空句柄的销毁是无操作
            for view in [self.chroma_view, self.luma_view, self.view] {
                if view != vk::ImageView::null() {
                    device.destroy_image_view(view, None);
                }
            }
            device.destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
        debug!("Vulkan: DPB 图像已销毁");
    }
}
