//! [`DecodeBackend`] 的 Vulkan Video 实现.
//!
//! 码流语义由 [`mirra_codec::SliceDecoder`] 处理, 这里只负责把每次提交翻译成
//! 视频编码命令: 开始编码范围, (IDR 时) 重置, 解码, 结束编码范围, 提交并推进时间线.

use std::sync::Arc;

use ash::vk;
use ash::vk::native;
use log::{debug, warn};

use mirra_codec::h264::{
    BitstreamSlot, DecodeBackend, DecodeSubmission, ParameterSets, ReferenceSlot, SessionCaps,
    SessionDescriptor,
};
use mirra_core::{MirraError, MirraResult};

use crate::context::VulkanContext;
use crate::dpb_image::DpbImage;
use crate::error::VulkanError;
use crate::frame_ring::{FrameRing, HostBuffer, INITIAL_BITSTREAM_CAPACITY, VulkanRing};
use crate::session::{self, DecodeCapabilities, SessionParameters, VideoProfile, VideoSession};

/// 会话存续期间的提交资源: 帧资源环与每个槽位的命令缓冲
struct SubmitResources {
    ctx: Arc<VulkanContext>,
    ring: FrameRing<HostBuffer>,
    ring_backend: VulkanRing,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl SubmitResources {
    fn create(
        ctx: Arc<VulkanContext>,
        profile: VideoProfile,
        alignment: u64,
        count: usize,
        sync: bool,
    ) -> MirraResult<Self> {
        let mut ring_backend = VulkanRing::new(ctx.clone(), profile)?;
        let mut ring = FrameRing::create(
            &mut ring_backend,
            count,
            alignment,
            INITIAL_BITSTREAM_CAPACITY,
            sync,
        )?;

        let device = ctx.device();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.decode_queue().family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(result) => {
                ring.destroy(&mut ring_backend);
                return Err(VulkanError::call("vkCreateCommandPool")(result).into());
            }
        };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(ring.len() as u32);
        let command_buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(result) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                ring.destroy(&mut ring_backend);
                return Err(VulkanError::call("vkAllocateCommandBuffers")(result).into());
            }
        };

        Ok(Self {
            ctx,
            ring,
            ring_backend,
            command_pool,
            command_buffers,
        })
    }
}

impl Drop for SubmitResources {
    fn drop(&mut self) {
        self.ring.destroy(&mut self.ring_backend);
        unsafe {
            // SAFETY: 调用方已等待设备空闲, 命令缓冲随命令池一起释放
            self.ctx
                .device()
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Vulkan Video 解码后端
pub struct VulkanBackend {
    ctx: Arc<VulkanContext>,
    frames_in_flight: usize,
    sync: bool,
    profile: Option<VideoProfile>,
    caps: Option<DecodeCapabilities>,
    session: Option<VideoSession>,
    parameters: Option<SessionParameters>,
    resources: Option<SubmitResources>,
    /// 新会话首次使用前需要重置
    reset_pending: bool,
    last_value: u64,
}

impl VulkanBackend {
    pub fn new(ctx: Arc<VulkanContext>, frames_in_flight: usize, sync: bool) -> Self {
        Self {
            ctx,
            frames_in_flight: frames_in_flight.max(1),
            sync,
            profile: None,
            caps: None,
            session: None,
            parameters: None,
            resources: None,
            reset_pending: false,
            last_value: 0,
        }
    }

    /// 解码提交使用的时间线信号量 (会话存在时)
    pub fn semaphore(&self) -> Option<vk::Semaphore> {
        self.resources.as_ref().map(|r| r.ring_backend.semaphore())
    }

    /// 最近一次提交的时间线值
    pub fn last_timeline_value(&self) -> u64 {
        self.last_value
    }

    /// 码流缓冲扩容次数
    pub fn ring_resizes(&self) -> u64 {
        self.resources.as_ref().map_or(0, |r| r.ring.resize_count())
    }

    fn wait_pending(&mut self) -> MirraResult<()> {
        if let Some(res) = self.resources.as_mut() {
            res.ring.wait_all(&mut res.ring_backend)?;
        }
        Ok(())
    }

    fn record(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        submission: &DecodeSubmission<'_, DpbImage>,
    ) -> MirraResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| MirraError::Internal("解码会话未创建".into()))?;
        let parameters = self
            .parameters
            .as_ref()
            .ok_or_else(|| MirraError::MissingParameterSet("会话参数未创建".into()))?;
        let device = self.ctx.device();
        let video_queue = self.ctx.video_queue().fp();
        let header = submission.header;
        let target = &submission.target;

        // 参考槽位: std 信息, DPB 槽位信息, 图像资源, 槽位描述依次引用
        let std_refs: Vec<native::StdVideoDecodeH264ReferenceInfo> =
            submission.references.iter().map(std_reference_info).collect();
        let mut dpb_infos: Vec<vk::VideoDecodeH264DpbSlotInfoKHR<'_>> = std_refs
            .iter()
            .map(|info| vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(info))
            .collect();
        let resources: Vec<vk::VideoPictureResourceInfoKHR<'_>> = submission
            .references
            .iter()
            .map(|r| r.picture.picture_resource())
            .collect();
        let reference_slots: Vec<vk::VideoReferenceSlotInfoKHR<'_>> = dpb_infos
            .iter_mut()
            .zip(&resources)
            .zip(&submission.references)
            .map(|((info, resource), r)| {
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(r.slot_index as i32)
                    .picture_resource(resource)
                    .push_next(info)
            })
            .collect();

        let target_resource = target.picture.picture_resource();
        let target_std = std_reference_info(target);
        let mut target_dpb = vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(&target_std);
        let setup_slot = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(target.slot_index as i32)
            .picture_resource(&target_resource)
            .push_next(&mut target_dpb);

        // 开始编码范围时输出槽位尚未激活, 以 -1 标记
        let mut begin_slots = reference_slots.clone();
        begin_slots.push(
            vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(-1)
                .picture_resource(&target_resource),
        );
        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(session.handle())
            .video_session_parameters(parameters.handle())
            .reference_slots(&begin_slots);

        let mut std_picture: native::StdVideoDecodeH264PictureInfo = unsafe { std::mem::zeroed() };
        std_picture.flags.set_IdrPicFlag(header.is_idr() as u32);
        std_picture.flags.set_is_reference(header.is_reference() as u32);
        std_picture.flags.set_is_intra(submission.intra_only as u32);
        std_picture.flags.set_field_pic_flag(0);
        std_picture.seq_parameter_set_id = submission.sps.sps_id as u8;
        std_picture.pic_parameter_set_id = submission.pps.pps_id as u8;
        std_picture.frame_num = header.frame_num as u16;
        std_picture.idr_pic_id = header.idr_pic_id as u16;
        std_picture.PicOrderCnt = [submission.poc, submission.poc];

        // 每个 slice 都以起始码开头, 偏移相对 src_buffer_offset
        let mut h264_picture = vk::VideoDecodeH264PictureInfoKHR::default()
            .std_picture_info(&std_picture)
            .slice_offsets(submission.slice_offsets);
        let decode_info = vk::VideoDecodeInfoKHR::default()
            .src_buffer(buffer)
            .src_buffer_offset(0)
            .src_buffer_range(submission.bitstream.size)
            .dst_picture_resource(target_resource)
            .setup_reference_slot(&setup_slot)
            .reference_slots(&reference_slots)
            .push_next(&mut h264_picture);

        let barriers: Vec<vk::ImageMemoryBarrier2<'_>> = std::iter::once(target.picture)
            .chain(submission.references.iter().map(|r| r.picture))
            .filter_map(DpbImage::take_initial_barrier)
            .collect();

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            // SAFETY: 命令缓冲对应的帧资源槽位已在 acquire 中等待完成
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::call("vkResetCommandBuffer"))?;
            device
                .begin_command_buffer(cmd, &begin)
                .map_err(VulkanError::call("vkBeginCommandBuffer"))?;
            if !barriers.is_empty() {
                device.cmd_pipeline_barrier2(
                    cmd,
                    &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                );
            }
            (video_queue.cmd_begin_video_coding_khr)(cmd, &begin_info);
            if header.is_idr() || self.reset_pending {
                let control = vk::VideoCodingControlInfoKHR::default()
                    .flags(vk::VideoCodingControlFlagsKHR::RESET);
                (video_queue.cmd_control_video_coding_khr)(cmd, &control);
            }
            (self.ctx.video_decode_queue().fp().cmd_decode_video_khr)(cmd, &decode_info);
            (video_queue.cmd_end_video_coding_khr)(cmd, &vk::VideoEndCodingInfoKHR::default());
            device
                .end_command_buffer(cmd)
                .map_err(VulkanError::call("vkEndCommandBuffer"))?;
        }
        Ok(())
    }
}

fn std_reference_info(slot: &ReferenceSlot<'_, DpbImage>) -> native::StdVideoDecodeH264ReferenceInfo {
    let mut info: native::StdVideoDecodeH264ReferenceInfo = unsafe { std::mem::zeroed() };
    info.flags
        .set_used_for_long_term_reference(slot.is_long_term as u32);
    info.FrameNum = if slot.is_long_term {
        slot.long_term_frame_idx as u16
    } else {
        slot.frame_num as u16
    };
    info.PicOrderCnt = [slot.poc, slot.poc];
    info
}

impl DecodeBackend for VulkanBackend {
    type Picture = DpbImage;

    fn query_capabilities(&mut self, desc: &SessionDescriptor) -> MirraResult<SessionCaps> {
        let profile = VideoProfile::from_descriptor(desc)?;
        let caps = session::query_capabilities(&self.ctx, &profile)?;
        self.profile = Some(profile);
        self.caps = Some(caps);
        Ok(SessionCaps {
            max_dpb_slots: caps.max_dpb_slots,
            max_active_references: caps.max_active_references,
            max_coded_width: caps.max_coded_extent.width,
            max_coded_height: caps.max_coded_extent.height,
            bitstream_alignment: caps.bitstream_alignment,
        })
    }

    fn create_session(&mut self, desc: &SessionDescriptor) -> MirraResult<()> {
        let (Some(profile), Some(caps)) = (self.profile, self.caps) else {
            return Err(MirraError::Internal("创建会话前未查询设备能力".into()));
        };
        let session = VideoSession::create(self.ctx.clone(), &profile, &caps, desc)?;
        // 失败时 session 随作用域销毁
        let resources = SubmitResources::create(
            self.ctx.clone(),
            profile,
            caps.bitstream_alignment,
            self.frames_in_flight,
            self.sync,
        )?;
        self.session = Some(session);
        self.resources = Some(resources);
        self.reset_pending = true;
        Ok(())
    }

    fn create_picture(&mut self, desc: &SessionDescriptor, index: usize) -> MirraResult<DpbImage> {
        let profile = self
            .profile
            .ok_or_else(|| MirraError::Internal("创建图像前未查询设备能力".into()))?;
        let extent = vk::Extent2D {
            width: desc.max_coded_width,
            height: desc.max_coded_height,
        };
        let image = DpbImage::create(self.ctx.clone(), &profile, extent)?;
        debug!("Vulkan: DPB 槽位 {} 图像已创建", index);
        Ok(image)
    }

    fn destroy_picture(&mut self, picture: DpbImage) {
        drop(picture);
    }

    fn update_parameters(&mut self, sets: &ParameterSets) -> MirraResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| MirraError::Internal("解码会话未创建".into()))?;
        let parameters = SessionParameters::create(self.ctx.clone(), session, sets)?;
        // 旧参数对象可能仍被未完成的命令引用
        self.wait_pending()?;
        self.parameters = Some(parameters);
        Ok(())
    }

    fn destroy_parameters(&mut self) {
        self.parameters = None;
    }

    fn destroy_session(&mut self) {
        self.resources = None;
        self.session = None;
        self.profile = None;
        self.caps = None;
        self.reset_pending = false;
    }

    fn wait_idle(&mut self) {
        if let Err(result) = unsafe { self.ctx.device().device_wait_idle() } {
            warn!("Vulkan: 等待设备空闲失败: {}", result);
        }
    }

    fn upload_bitstream(&mut self, data: &[u8]) -> MirraResult<BitstreamSlot> {
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| MirraError::Internal("帧资源环未创建".into()))?;
        let lease = res.ring.acquire(&mut res.ring_backend, data)?;
        Ok(BitstreamSlot {
            ring_index: lease.index,
            size: lease.size,
        })
    }

    fn submit(&mut self, submission: &DecodeSubmission<'_, DpbImage>) -> MirraResult<()> {
        let ring_index = submission.bitstream.ring_index;
        let (cmd, buffer) = {
            let res = self
                .resources
                .as_ref()
                .ok_or_else(|| MirraError::Internal("帧资源环未创建".into()))?;
            let cmd = res.command_buffers.get(ring_index).copied();
            let buffer = res.ring.buffer(ring_index).map(HostBuffer::buffer);
            match (cmd, buffer) {
                (Some(cmd), Some(buffer)) => (cmd, buffer),
                _ => {
                    return Err(MirraError::Internal(format!(
                        "帧资源槽位越界: {}",
                        ring_index
                    )));
                }
            }
        };

        self.record(cmd, buffer, submission)?;

        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| MirraError::Internal("帧资源环未创建".into()))?;
        let value = res.ring.next_value();
        let signal_semaphores = [res.ring_backend.semaphore()];
        let signal_values = [value];
        let command_buffers = [cmd];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);
        unsafe {
            self.ctx.device().queue_submit(
                self.ctx.decode_queue().queue,
                &[submit_info],
                vk::Fence::null(),
            )
        }
        .map_err(VulkanError::call("vkQueueSubmit"))?;

        self.reset_pending = false;
        self.last_value = value;
        res.ring.submitted(&mut res.ring_backend, ring_index, value)?;
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.wait_idle();
        }
        self.parameters = None;
        self.resources = None;
        self.session = None;
    }
}
