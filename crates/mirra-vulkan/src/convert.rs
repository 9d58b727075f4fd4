//! 计算着色器 YUV → RGBA 转换.
//!
//! 系数取自 [`mirra_scale::ColorSpec`], 与 CPU 实现一致. 每个 DPB 槽位对应一张 RGBA 输出图像,
//! 转换在计算队列上执行, 等待解码时间线值后开始, 返回前等待完成.

use std::sync::Arc;

use ash::vk;
use log::debug;

use mirra_core::MirraResult;
use mirra_scale::ColorSpec;

use crate::context::VulkanContext;
use crate::dpb_image::{PlaneViews, color_range};
use crate::error::{VulkanError, VulkanResult};
use crate::shader::{ShaderModule, yuv_to_rgba_spirv};

/// 工作组边长 (与着色器 local_size 一致)
const WORKGROUP: u32 = 16;

/// 着色器 push constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertPush {
    /// [Ys, Yoff, Rv, Gu, Gv, Bu]
    pub coefficients: [f32; 6],
    pub width: u32,
    pub height: u32,
}

impl ConvertPush {
    pub const SIZE: usize = 32;

    pub fn new(spec: ColorSpec, width: u32, height: u32) -> Self {
        Self {
            coefficients: spec.float_coefficients(),
            width,
            height,
        }
    }

    /// std430 布局的字节表示
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (i, c) in self.coefficients.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_ne_bytes());
        }
        out[24..28].copy_from_slice(&self.width.to_ne_bytes());
        out[28..32].copy_from_slice(&self.height.to_ne_bytes());
        out
    }
}

/// 分派的工作组数量
pub fn dispatch_size(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(WORKGROUP), height.div_ceil(WORKGROUP))
}

/// RGBA 输出图像
struct RgbaImage {
    ctx: Arc<VulkanContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    width: u32,
    height: u32,
}

impl RgbaImage {
    fn create(ctx: Arc<VulkanContext>, width: u32, height: u32) -> VulkanResult<Self> {
        let device = ctx.device().clone();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }
            .map_err(VulkanError::call("vkCreateImage"))?;
        let mut this = Self {
            ctx,
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            width,
            height,
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        this.memory = this
            .ctx
            .allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        unsafe { device.bind_image_memory(image, this.memory, 0) }
            .map_err(VulkanError::call("vkBindImageMemory"))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(color_range());
        this.view = unsafe { device.create_image_view(&view_info, None) }
            .map_err(VulkanError::call("vkCreateImageView"))?;
        Ok(this)
    }
}

impl Drop for RgbaImage {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            // SAFETY: 转换器销毁前已等待设备空闲; 空句柄的销毁是无操作
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// 计算着色器转换器
pub struct ComputeConverter {
    ctx: Arc<VulkanContext>,
    shader: Option<ShaderModule>,
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    outputs: Vec<Option<RgbaImage>>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    spec: ColorSpec,
}

impl ComputeConverter {
    /// 为 `slots` 个 DPB 槽位创建转换器
    pub fn new(ctx: Arc<VulkanContext>, slots: usize) -> MirraResult<Self> {
        let spirv = yuv_to_rgba_spirv();
        let mut this = Self {
            ctx: ctx.clone(),
            shader: None,
            sampler: vk::Sampler::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            outputs: (0..slots).map(|_| None).collect(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            spec: ColorSpec::default(),
        };
        // 失败时 Drop 回收已创建的对象
        this.shader = Some(ShaderModule::from_spirv(ctx, spirv)?);
        this.init(slots)?;
        debug!("Vulkan: 计算转换器已创建, {} 个输出槽位", slots);
        Ok(this)
    }

    fn init(&mut self, slots: usize) -> VulkanResult<()> {
        let device = self.ctx.device().clone();

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .unnormalized_coordinates(false);
        self.sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(VulkanError::call("vkCreateSampler"))?;

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::call("vkCreateDescriptorSetLayout"))?;

        let set_layouts = [self.set_layout];
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(ConvertPush::SIZE as u32);
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        self.pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(VulkanError::call("vkCreatePipelineLayout"))?;

        let module = self
            .shader
            .as_ref()
            .map(ShaderModule::handle)
            .ok_or_else(|| VulkanError::Shader("着色器模块未创建".into()))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout);
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, result)| VulkanError::call("vkCreateComputePipelines")(result))?;
        self.pipeline = pipelines
            .first()
            .copied()
            .ok_or_else(|| VulkanError::Shader("驱动未返回管线".into()))?;

        let count = slots.max(1) as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(count * 2),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(count),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(count)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::call("vkCreateDescriptorPool"))?;
        let layouts = vec![self.set_layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::call("vkAllocateDescriptorSets"))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.ctx.compute_queue().family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(VulkanError::call("vkCreateCommandPool"))?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(VulkanError::call("vkAllocateCommandBuffers"))?
            .first()
            .copied()
            .unwrap_or_default();

        self.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(VulkanError::call("vkCreateFence"))?;
        Ok(())
    }

    /// 设置色彩矩阵 (来自 SPS 的 VUI)
    pub fn set_color_spec(&mut self, spec: ColorSpec) {
        self.spec = spec;
    }

    /// 转换一个 DPB 槽位, 返回 RGBA 图像与视图
    ///
    /// `wait` 为解码提交的时间线信号量与值.
    pub fn convert(
        &mut self,
        slot: usize,
        planes: PlaneViews,
        width: u32,
        height: u32,
        wait: (vk::Semaphore, u64),
    ) -> MirraResult<(vk::Image, vk::ImageView)> {
        let set = *self
            .sets
            .get(slot)
            .ok_or_else(|| VulkanError::Capability(format!("转换槽位越界: {}", slot)))?;
        let reuse = self
            .outputs
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|o| o.width == width && o.height == height);
        if !reuse {
            let output = RgbaImage::create(self.ctx.clone(), width, height)?;
            if let Some(entry) = self.outputs.get_mut(slot) {
                *entry = Some(output);
            }
        }
        let (out_image, out_view) = match self.outputs.get(slot).and_then(Option::as_ref) {
            Some(output) => (output.image, output.view),
            None => {
                return Err(VulkanError::Capability(format!("转换槽位越界: {}", slot)).into());
            }
        };

        self.update_descriptors(set, planes, out_view);
        self.record(set, planes.image, out_image, width, height)?;
        self.submit_and_wait(wait)?;
        Ok((out_image, out_view))
    }

    fn update_descriptors(&self, set: vk::DescriptorSet, planes: PlaneViews, output: vk::ImageView) {
        let luma = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(planes.luma)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let chroma = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(planes.chroma)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let rgba = [vk::DescriptorImageInfo::default()
            .image_view(output)
            .image_layout(vk::ImageLayout::GENERAL)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&luma),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&chroma),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&rgba),
        ];
        unsafe { self.ctx.device().update_descriptor_sets(&writes, &[]) };
    }

    fn record(
        &self,
        set: vk::DescriptorSet,
        source: vk::Image,
        output: vk::Image,
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        let device = self.ctx.device();
        let cmd = self.command_buffer;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin) }
            .map_err(VulkanError::call("vkBeginCommandBuffer"))?;

        let to_read = [
            layout_barrier(
                source,
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                ),
            ),
            layout_barrier(
                output,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ),
        ];
        let push = ConvertPush::new(self.spec, width, height).to_bytes();
        let (groups_x, groups_y) = dispatch_size(width, height);
        let back_to_dpb = [layout_barrier(
            source,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        )];

        unsafe {
            // SAFETY: 命令缓冲处于录制状态, 引用的对象都有效
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_read),
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                &push,
            );
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&back_to_dpb),
            );
            device.end_command_buffer(cmd)
        }
        .map_err(VulkanError::call("vkEndCommandBuffer"))
    }

    fn submit_and_wait(&self, wait: (vk::Semaphore, u64)) -> VulkanResult<()> {
        let device = self.ctx.device();
        let wait_semaphores = [wait.0];
        let wait_values = [wait.1];
        let wait_stages = [vk::PipelineStageFlags::COMPUTE_SHADER];
        let command_buffers = [self.command_buffer];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&wait_values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .push_next(&mut timeline_info);
        unsafe {
            device
                .queue_submit(self.ctx.compute_queue().queue, &[submit], self.fence)
                .map_err(VulkanError::call("vkQueueSubmit"))?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::call("vkWaitForFences"))?;
            device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::call("vkResetFences"))
        }
    }
}

fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
}

impl Drop for ComputeConverter {
    fn drop(&mut self) {
        self.outputs.clear();
        let device = self.ctx.device();
        unsafe {
            // SAFETY: 调用方已等待设备空闲; 空句柄的销毁是无操作
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
        self.shader = None;
    }
}
