//! Vulkan Video 解码会话, 会话内存与会话参数.

use std::ptr;
use std::sync::Arc;

use ash::vk;
use ash::vk::native;
use log::{debug, info};

use mirra_codec::h264::{ParameterSets, Pps, ScalingLists, SessionDescriptor, Sps};

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};

/// 解码输出与参考图像的格式
pub const PICTURE_FORMAT: vk::Format = vk::Format::G8_B8R8_2PLANE_420_UNORM;

// ============================================================
// 解码配置 (profile)
// ============================================================

/// H.264 解码 profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub profile_idc: u8,
}

impl VideoProfile {
    /// 由会话描述构造, 只支持 8 bit 4:2:0
    pub fn from_descriptor(desc: &SessionDescriptor) -> VulkanResult<Self> {
        if desc.chroma_format_idc != 1 {
            return Err(VulkanError::Capability(format!(
                "只支持 4:2:0, chroma_format_idc={}",
                desc.chroma_format_idc
            )));
        }
        if desc.bit_depth_luma != 8 || desc.bit_depth_chroma != 8 {
            return Err(VulkanError::Capability(format!(
                "只支持 8 bit, luma={}, chroma={}",
                desc.bit_depth_luma, desc.bit_depth_chroma
            )));
        }
        let profile_idc = match desc.profile_idc {
            66 | 77 | 100 => desc.profile_idc,
            other => {
                return Err(VulkanError::Capability(format!(
                    "不支持的 profile_idc={}",
                    other
                )));
            }
        };
        Ok(Self { profile_idc })
    }

    /// 在栈上构造 `VkVideoProfileInfoKHR` 并传给 `f`
    pub fn with_info<R>(&self, f: impl FnOnce(&vk::VideoProfileInfoKHR<'_>) -> R) -> R {
        let mut h264 = vk::VideoDecodeH264ProfileInfoKHR::default()
            .std_profile_idc(self.profile_idc as _)
            .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE);
        let info = vk::VideoProfileInfoKHR::default()
            .video_codec_operation(vk::VideoCodecOperationFlagsKHR::DECODE_H264)
            .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
            .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .push_next(&mut h264);
        f(&info)
    }
}

/// 设备对某个 profile 的解码能力
#[derive(Debug, Clone, Copy)]
pub struct DecodeCapabilities {
    pub max_dpb_slots: u32,
    pub max_active_references: u32,
    pub max_coded_extent: vk::Extent2D,
    /// 码流缓冲偏移与大小的对齐 (取两者较大值)
    pub bitstream_alignment: u64,
    pub std_header_version: vk::ExtensionProperties,
}

/// 查询设备解码能力
pub fn query_capabilities(
    ctx: &VulkanContext,
    profile: &VideoProfile,
) -> VulkanResult<DecodeCapabilities> {
    let mut h264_caps = vk::VideoDecodeH264CapabilitiesKHR::default();
    let mut decode_caps = vk::VideoDecodeCapabilitiesKHR::default();
    let mut caps = vk::VideoCapabilitiesKHR::default()
        .push_next(&mut decode_caps)
        .push_next(&mut h264_caps);

    profile
        .with_info(|info| unsafe {
            // SAFETY: 函数指针由 VK_KHR_video_queue 加载, 结构链在调用期间有效
            (ctx.video_queue_instance()
                .fp()
                .get_physical_device_video_capabilities_khr)(
                ctx.physical_device(), info, &mut caps
            )
        })
        .result()
        .map_err(VulkanError::call("vkGetPhysicalDeviceVideoCapabilitiesKHR"))?;

    let result = DecodeCapabilities {
        max_dpb_slots: caps.max_dpb_slots,
        max_active_references: caps.max_active_reference_pictures,
        max_coded_extent: caps.max_coded_extent,
        bitstream_alignment: caps
            .min_bitstream_buffer_offset_alignment
            .max(caps.min_bitstream_buffer_size_alignment)
            .max(1),
        std_header_version: caps.std_header_version,
    };
    if !decode_caps
        .flags
        .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE)
    {
        return Err(VulkanError::Capability(
            "设备要求 DPB 与输出图像分离".into(),
        ));
    }
    debug!(
        "Vulkan: 解码能力 dpb={}, refs={}, extent={}x{}, align={}",
        result.max_dpb_slots,
        result.max_active_references,
        result.max_coded_extent.width,
        result.max_coded_extent.height,
        result.bitstream_alignment
    );
    Ok(result)
}

// ============================================================
// 解码会话
// ============================================================

/// 已绑定内存的解码会话
pub struct VideoSession {
    ctx: Arc<VulkanContext>,
    session: vk::VideoSessionKHR,
    memory: Vec<vk::DeviceMemory>,
}

impl VideoSession {
    /// 创建会话, 查询内存需求并逐一分配绑定
    ///
    /// 任一步失败都会销毁已创建的内存与会话.
    pub fn create(
        ctx: Arc<VulkanContext>,
        profile: &VideoProfile,
        caps: &DecodeCapabilities,
        desc: &SessionDescriptor,
    ) -> VulkanResult<Self> {
        let extent = vk::Extent2D {
            width: desc.max_coded_width,
            height: desc.max_coded_height,
        };
        let mut handle = vk::VideoSessionKHR::null();
        profile
            .with_info(|info| {
                let create_info = vk::VideoSessionCreateInfoKHR::default()
                    .queue_family_index(ctx.decode_queue().family_index)
                    .video_profile(info)
                    .picture_format(PICTURE_FORMAT)
                    .max_coded_extent(extent)
                    .reference_picture_format(PICTURE_FORMAT)
                    .max_dpb_slots(desc.max_dpb_slots)
                    .max_active_reference_pictures(desc.max_active_references)
                    .std_header_version(&caps.std_header_version);
                unsafe {
                    // SAFETY: 创建信息在调用期间有效
                    (ctx.video_queue().fp().create_video_session_khr)(
                        ctx.device().handle(),
                        &create_info,
                        ptr::null(),
                        &mut handle,
                    )
                }
            })
            .result()
            .map_err(VulkanError::call("vkCreateVideoSessionKHR"))?;

        let mut session = Self {
            ctx,
            session: handle,
            memory: Vec::new(),
        };
        // 失败时由 Drop 释放已分配的内存和会话
        session.bind_memory()?;
        info!(
            "Vulkan: 解码会话已创建 {}x{}, dpb={}, 内存块 {}",
            extent.width,
            extent.height,
            desc.max_dpb_slots,
            session.memory.len()
        );
        Ok(session)
    }

    fn bind_memory(&mut self) -> VulkanResult<()> {
        let ctx = self.ctx.clone();
        let fp = ctx.video_queue().fp();
        let device = ctx.device().handle();

        let mut count = 0u32;
        unsafe {
            // SAFETY: 先查询数量
            (fp.get_video_session_memory_requirements_khr)(
                device,
                self.session,
                &mut count,
                ptr::null_mut(),
            )
        }
        .result()
        .map_err(VulkanError::call("vkGetVideoSessionMemoryRequirementsKHR"))?;

        let mut requirements = vec![vk::VideoSessionMemoryRequirementsKHR::default(); count as usize];
        unsafe {
            // SAFETY: 缓冲长度与 count 一致
            (fp.get_video_session_memory_requirements_khr)(
                device,
                self.session,
                &mut count,
                requirements.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::call("vkGetVideoSessionMemoryRequirementsKHR"))?;
        requirements.truncate(count as usize);

        let mut binds = Vec::with_capacity(requirements.len());
        for req in &requirements {
            let memory = ctx
                .allocate_memory(req.memory_requirements, vk::MemoryPropertyFlags::empty())?;
            self.memory.push(memory);
            binds.push(
                vk::BindVideoSessionMemoryInfoKHR::default()
                    .memory_bind_index(req.memory_bind_index)
                    .memory(memory)
                    .memory_offset(0)
                    .memory_size(req.memory_requirements.size),
            );
        }

        if !binds.is_empty() {
            unsafe {
                // SAFETY: 每个 memory_bind_index 只绑定一次
                (fp.bind_video_session_memory_khr)(
                    device,
                    self.session,
                    binds.len() as u32,
                    binds.as_ptr(),
                )
            }
            .result()
            .map_err(VulkanError::call("vkBindVideoSessionMemoryKHR"))?;
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::VideoSessionKHR {
        self.session
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            // SAFETY: 调用方已等待设备空闲, 会话不再被任何命令引用
            (self.ctx.video_queue().fp().destroy_video_session_khr)(
                device.handle(),
                self.session,
                ptr::null(),
            );
            for memory in self.memory.drain(..) {
                device.free_memory(memory, None);
            }
        }
        debug!("Vulkan: 解码会话已销毁");
    }
}

// ============================================================
// 会话参数
// ============================================================

/// 由 SPS/PPS 表生成的会话参数对象
pub struct SessionParameters {
    ctx: Arc<VulkanContext>,
    handle: vk::VideoSessionParametersKHR,
}

impl SessionParameters {
    /// 用当前全部 SPS/PPS 创建参数对象
    pub fn create(
        ctx: Arc<VulkanContext>,
        session: &VideoSession,
        sets: &ParameterSets,
    ) -> VulkanResult<Self> {
        let sps_list = sets.sps_list();
        let pps_list = sets.pps_list();
        if sps_list.is_empty() || pps_list.is_empty() {
            return Err(VulkanError::MissingParameters);
        }

        // 指针引用的数据必须先全部就位
        let sps_scaling: Vec<Option<native::StdVideoH264ScalingLists>> = sps_list
            .iter()
            .map(|sps| sps.scaling_lists.as_ref().map(std_scaling_lists))
            .collect();
        let pps_scaling: Vec<Option<native::StdVideoH264ScalingLists>> = pps_list
            .iter()
            .map(|pps| pps.scaling_lists.as_ref().map(std_scaling_lists))
            .collect();
        let std_sps: Vec<native::StdVideoH264SequenceParameterSet> = sps_list
            .iter()
            .zip(&sps_scaling)
            .map(|(sps, scaling)| std_sequence_parameter_set(sps, scaling.as_ref()))
            .collect();
        let std_pps: Vec<native::StdVideoH264PictureParameterSet> = pps_list
            .iter()
            .zip(&pps_scaling)
            .map(|(pps, scaling)| std_picture_parameter_set(pps, scaling.as_ref()))
            .collect();

        let add_info = vk::VideoDecodeH264SessionParametersAddInfoKHR::default()
            .std_sp_ss(&std_sps)
            .std_pp_ss(&std_pps);
        let mut h264_info = vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
            .max_std_sps_count(std_sps.len() as u32)
            .max_std_pps_count(std_pps.len() as u32)
            .parameters_add_info(&add_info);
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(session.handle())
            .push_next(&mut h264_info);

        let mut handle = vk::VideoSessionParametersKHR::null();
        unsafe {
            // SAFETY: std 结构中的指针指向上面的局部数据, 调用期间有效
            (ctx.video_queue().fp().create_video_session_parameters_khr)(
                ctx.device().handle(),
                &create_info,
                ptr::null(),
                &mut handle,
            )
        }
        .result()
        .map_err(VulkanError::call("vkCreateVideoSessionParametersKHR"))?;

        debug!(
            "Vulkan: 会话参数已更新, SPS {} 个, PPS {} 个",
            std_sps.len(),
            std_pps.len()
        );
        Ok(Self { ctx, handle })
    }

    pub fn handle(&self) -> vk::VideoSessionParametersKHR {
        self.handle
    }
}

impl Drop for SessionParameters {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: 参数对象不再被任何命令引用
            (self.ctx.video_queue().fp().destroy_video_session_parameters_khr)(
                self.ctx.device().handle(),
                self.handle,
                ptr::null(),
            );
        }
    }
}

// ============================================================
// SPS/PPS 到 Vulkan std 结构的转换
// ============================================================

/// level_idc 到 `StdVideoH264LevelIdc` 枚举值
pub fn std_level_idc(level_idc: u8) -> u32 {
    const LEVELS: [u8; 19] = [
        10, 11, 12, 13, 20, 21, 22, 30, 31, 32, 40, 41, 42, 50, 51, 52, 60, 61, 62,
    ];
    match level_idc {
        // level 1b
        9 => 0,
        level => LEVELS
            .iter()
            .position(|&l| l == level)
            .unwrap_or(LEVELS.len() - 1) as u32,
    }
}

fn flag(value: bool) -> u32 {
    u32::from(value)
}

/// 转换量化矩阵
pub fn std_scaling_lists(lists: &ScalingLists) -> native::StdVideoH264ScalingLists {
    // SAFETY: 纯数据 C 结构, 全零为合法值
    let mut std: native::StdVideoH264ScalingLists = unsafe { std::mem::zeroed() };
    std.ScalingList4x4 = lists.list_4x4;
    for (dst, src) in std.ScalingList8x8.iter_mut().zip(&lists.list_8x8) {
        *dst = *src;
    }
    let count = 6 + lists.list_8x8.len().min(6);
    std.scaling_list_present_mask = ((1u32 << count) - 1) as u16;
    std.use_default_scaling_matrix_mask = 0;
    std
}

/// 转换 SPS, `scaling` 需在返回值使用期间保持有效
pub fn std_sequence_parameter_set(
    sps: &Sps,
    scaling: Option<&native::StdVideoH264ScalingLists>,
) -> native::StdVideoH264SequenceParameterSet {
    // SAFETY: 纯数据 C 结构, 全零为合法值 (空指针)
    let mut std: native::StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };

    let cs = sps.constraint_set_flags;
    std.flags.set_constraint_set0_flag(u32::from(cs >> 7 & 1));
    std.flags.set_constraint_set1_flag(u32::from(cs >> 6 & 1));
    std.flags.set_constraint_set2_flag(u32::from(cs >> 5 & 1));
    std.flags.set_constraint_set3_flag(u32::from(cs >> 4 & 1));
    std.flags.set_constraint_set4_flag(u32::from(cs >> 3 & 1));
    std.flags.set_constraint_set5_flag(u32::from(cs >> 2 & 1));
    std.flags
        .set_direct_8x8_inference_flag(flag(sps.direct_8x8_inference));
    std.flags
        .set_mb_adaptive_frame_field_flag(flag(sps.mb_adaptive_frame_field));
    std.flags.set_frame_mbs_only_flag(flag(sps.frame_mbs_only));
    std.flags
        .set_delta_pic_order_always_zero_flag(flag(sps.delta_pic_order_always_zero));
    std.flags
        .set_separate_colour_plane_flag(flag(sps.separate_colour_plane));
    std.flags
        .set_gaps_in_frame_num_value_allowed_flag(flag(sps.gaps_in_frame_num_allowed));
    std.flags
        .set_qpprime_y_zero_transform_bypass_flag(flag(sps.qpprime_y_zero_transform_bypass));
    std.flags.set_frame_cropping_flag(flag(sps.frame_cropping));
    std.flags
        .set_seq_scaling_matrix_present_flag(flag(scaling.is_some()));
    std.flags.set_vui_parameters_present_flag(0);

    std.profile_idc = sps.profile_idc as _;
    std.level_idc = std_level_idc(sps.level_idc) as _;
    std.chroma_format_idc = sps.chroma_format_idc as _;
    std.seq_parameter_set_id = sps.sps_id as u8;
    std.bit_depth_luma_minus8 = sps.bit_depth_luma.saturating_sub(8) as u8;
    std.bit_depth_chroma_minus8 = sps.bit_depth_chroma.saturating_sub(8) as u8;
    std.log2_max_frame_num_minus4 = sps.log2_max_frame_num.saturating_sub(4) as u8;
    std.pic_order_cnt_type = sps.poc_type.min(2) as _;
    std.offset_for_non_ref_pic = sps.offset_for_non_ref_pic;
    std.offset_for_top_to_bottom_field = sps.offset_for_top_to_bottom_field;
    std.log2_max_pic_order_cnt_lsb_minus4 = sps.log2_max_poc_lsb.saturating_sub(4) as u8;
    std.num_ref_frames_in_pic_order_cnt_cycle = sps.offset_for_ref_frame.len() as u8;
    std.max_num_ref_frames = sps.max_num_ref_frames as u8;
    std.pic_width_in_mbs_minus1 = sps.pic_width_in_mbs.saturating_sub(1);
    std.pic_height_in_map_units_minus1 = sps.pic_height_in_map_units.saturating_sub(1);
    std.frame_crop_left_offset = sps.crop[0];
    std.frame_crop_right_offset = sps.crop[1];
    std.frame_crop_top_offset = sps.crop[2];
    std.frame_crop_bottom_offset = sps.crop[3];
    if !sps.offset_for_ref_frame.is_empty() {
        std.pOffsetForRefFrame = sps.offset_for_ref_frame.as_ptr();
    }
    if let Some(lists) = scaling {
        std.pScalingLists = lists;
    }
    std
}

/// 转换 PPS, `scaling` 需在返回值使用期间保持有效
pub fn std_picture_parameter_set(
    pps: &Pps,
    scaling: Option<&native::StdVideoH264ScalingLists>,
) -> native::StdVideoH264PictureParameterSet {
    // SAFETY: 纯数据 C 结构, 全零为合法值 (空指针)
    let mut std: native::StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };

    std.flags
        .set_transform_8x8_mode_flag(flag(pps.transform_8x8_mode));
    std.flags
        .set_redundant_pic_cnt_present_flag(flag(pps.redundant_pic_cnt_present));
    std.flags
        .set_constrained_intra_pred_flag(flag(pps.constrained_intra_pred));
    std.flags
        .set_deblocking_filter_control_present_flag(flag(pps.deblocking_filter_control));
    std.flags.set_weighted_pred_flag(flag(pps.weighted_pred));
    std.flags
        .set_bottom_field_pic_order_in_frame_present_flag(flag(pps.bottom_field_pic_order_present));
    std.flags
        .set_entropy_coding_mode_flag(flag(pps.entropy_coding_mode));
    std.flags
        .set_pic_scaling_matrix_present_flag(flag(scaling.is_some()));

    std.seq_parameter_set_id = pps.sps_id as u8;
    std.pic_parameter_set_id = pps.pps_id as u8;
    std.num_ref_idx_l0_default_active_minus1 =
        pps.num_ref_idx_l0_default_active.saturating_sub(1) as u8;
    std.num_ref_idx_l1_default_active_minus1 =
        pps.num_ref_idx_l1_default_active.saturating_sub(1) as u8;
    std.weighted_bipred_idc = pps.weighted_bipred_idc as _;
    std.pic_init_qp_minus26 = (pps.pic_init_qp - 26) as i8;
    std.pic_init_qs_minus26 = (pps.pic_init_qs - 26) as i8;
    std.chroma_qp_index_offset = pps.chroma_qp_index_offset as i8;
    std.second_chroma_qp_index_offset = pps.second_chroma_qp_index_offset as i8;
    if let Some(lists) = scaling {
        std.pScalingLists = lists;
    }
    std
}

#[cfg(test)]
mod tests {
    use mirra_codec::h264::{SessionDescriptor, parse_pps, parse_sps};

    use super::*;

    // Baseline 320x240, level 3.0, log2_max_frame_num=4, poc_type=0, lsb=6
    const SPS_RBSP: [u8; 7] = [0x42, 0x00, 0x1E, 0xED, 0x02, 0x83, 0xF2];
    // pps_id=0, sps_id=0, CAVLC, qp=26
    const PPS_RBSP: [u8; 3] = [0xCE, 0x3C, 0x80];

    fn descriptor(profile_idc: u8, chroma: u32, depth: u32) -> SessionDescriptor {
        SessionDescriptor {
            profile_idc,
            chroma_format_idc: chroma,
            bit_depth_luma: depth,
            bit_depth_chroma: depth,
            max_coded_width: 1920,
            max_coded_height: 1088,
            max_dpb_slots: 8,
            max_active_references: 7,
        }
    }

    #[test]
    fn test_profile_from_descriptor() {
        assert_eq!(
            VideoProfile::from_descriptor(&descriptor(100, 1, 8))
                .unwrap()
                .profile_idc,
            100
        );
        assert!(VideoProfile::from_descriptor(&descriptor(100, 3, 8)).is_err());
        assert!(VideoProfile::from_descriptor(&descriptor(110, 1, 10)).is_err());
        assert!(VideoProfile::from_descriptor(&descriptor(88, 1, 8)).is_err());
    }

    #[test]
    fn test_std_level_idc() {
        assert_eq!(std_level_idc(10), 0);
        assert_eq!(std_level_idc(9), 0);
        assert_eq!(std_level_idc(30), 7);
        assert_eq!(std_level_idc(41), 11);
        assert_eq!(std_level_idc(62), 18);
        assert_eq!(std_level_idc(99), 18);
    }

    #[test]
    fn test_std_sequence_parameter_set() {
        let sps = parse_sps(&SPS_RBSP).unwrap();
        let std = std_sequence_parameter_set(&sps, None);
        assert_eq!(std.profile_idc as u32, 66);
        assert_eq!(std.level_idc as u32, 7);
        assert_eq!(std.seq_parameter_set_id, 0);
        assert_eq!(std.pic_width_in_mbs_minus1, sps.pic_width_in_mbs - 1);
        assert_eq!(
            std.pic_height_in_map_units_minus1,
            sps.pic_height_in_map_units - 1
        );
        assert_eq!(std.flags.frame_mbs_only_flag(), 1);
        assert_eq!(std.flags.seq_scaling_matrix_present_flag(), 0);
        assert!(std.pScalingLists.is_null());
        assert!(std.pOffsetForRefFrame.is_null());
    }

    #[test]
    fn test_std_picture_parameter_set() {
        let mut sets = ParameterSets::new();
        sets.insert_sps(parse_sps(&SPS_RBSP).unwrap());
        let pps = parse_pps(&PPS_RBSP, &sets).unwrap();
        let scaling = std_scaling_lists(&ScalingLists::defaults(2));
        let std = std_picture_parameter_set(&pps, Some(&scaling));
        assert_eq!(std.pic_parameter_set_id, 0);
        assert_eq!(std.pic_init_qp_minus26, 0);
        assert_eq!(std.flags.entropy_coding_mode_flag(), 0);
        assert_eq!(std.flags.pic_scaling_matrix_present_flag(), 1);
        assert!(!std.pScalingLists.is_null());
    }

    #[test]
    fn test_std_scaling_lists_mask() {
        let std = std_scaling_lists(&ScalingLists::defaults(2));
        assert_eq!(std.scaling_list_present_mask, 0xFF);
        assert_eq!(std.ScalingList8x8[1], ScalingLists::defaults(2).list_8x8[1]);
        let std = std_scaling_lists(&ScalingLists::defaults(0));
        assert_eq!(std.scaling_list_present_mask, 0x3F);
    }
}
