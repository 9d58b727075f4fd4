//! H.264 SPS (Sequence Parameter Set) 解析器.
//!
//! SPS 包含编码视频序列的全局参数, 包括:
//! - Profile / Level (编码规格)
//! - 图像宽度和高度 (以宏块为单位, 需要 cropping 调整)
//! - 色度格式与位深
//! - POC 类型及其专属字段
//! - VUI 中的宽高比、色彩描述、帧率和重排深度

use log::{debug, warn};
use mirra_core::{BitstreamReader, MirraError, MirraResult};

use super::scaling::{ScalingLists, parse_scaling_matrix};

/// SPS 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct Sps {
    /// profile_idc (编码规格, 如 66=Baseline, 77=Main, 100=High)
    pub profile_idc: u8,
    /// constraint_set0..5 标志位 (高位在前)
    pub constraint_set_flags: u8,
    /// level_idc (编码级别, 如 30=3.0, 41=4.1)
    pub level_idc: u8,
    /// seq_parameter_set_id (0-31)
    pub sps_id: u32,
    /// 色度格式 (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
    /// separate_colour_plane_flag
    pub separate_colour_plane: bool,
    /// 亮度位深
    pub bit_depth_luma: u32,
    /// 色度位深
    pub bit_depth_chroma: u32,
    /// qpprime_y_zero_transform_bypass_flag
    pub qpprime_y_zero_transform_bypass: bool,
    /// 序列级量化矩阵 (seq_scaling_matrix_present_flag=1 时存在)
    pub scaling_lists: Option<ScalingLists>,
    /// log2(max_frame_num)
    pub log2_max_frame_num: u32,
    /// 图像顺序计数类型
    ///
    /// 合法值为 0/1/2, 其他值按 frame_num 作为 POC 处理.
    pub poc_type: u32,
    /// log2(max_pic_order_cnt_lsb) (仅 poc_type==0)
    pub log2_max_poc_lsb: u32,
    /// `poc_type==1` 时的 delta_pic_order_always_zero_flag
    pub delta_pic_order_always_zero: bool,
    /// `poc_type==1` 时的 offset_for_non_ref_pic
    pub offset_for_non_ref_pic: i32,
    /// `poc_type==1` 时的 offset_for_top_to_bottom_field
    pub offset_for_top_to_bottom_field: i32,
    /// `poc_type==1` 时的 offset_for_ref_frame 循环表
    pub offset_for_ref_frame: Vec<i32>,
    /// 最大参考帧数
    pub max_num_ref_frames: u32,
    /// gaps_in_frame_num_value_allowed_flag
    pub gaps_in_frame_num_allowed: bool,
    /// 宽度 (宏块)
    pub pic_width_in_mbs: u32,
    /// 高度 (map unit, 场编码时为半帧高度)
    pub pic_height_in_map_units: u32,
    /// 是否为帧编码 (非场编码)
    pub frame_mbs_only: bool,
    /// mb_adaptive_frame_field_flag
    pub mb_adaptive_frame_field: bool,
    /// direct_8x8_inference_flag
    pub direct_8x8_inference: bool,
    /// frame_cropping_flag
    pub frame_cropping: bool,
    /// cropping 偏移 (左, 右, 上, 下), 单位为 crop unit
    pub crop: [u32; 4],
    /// VUI 参数
    pub vui: Option<Vui>,
}

/// VUI 参数 (解码所需子集)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vui {
    /// 像素宽高比 (num, den)
    pub sar: (u32, u32),
    /// video_full_range_flag
    pub full_range: bool,
    /// matrix_coefficients (2 表示未指定)
    pub matrix_coefficients: u8,
    /// 帧率 (time_scale, 2 * num_units_in_tick)
    pub fps: Option<(u32, u32)>,
    /// bitstream_restriction 中的 max_num_reorder_frames
    pub max_num_reorder_frames: Option<u32>,
    /// bitstream_restriction 中的 max_dec_frame_buffering
    pub max_dec_frame_buffering: Option<u32>,
}

impl Default for Vui {
    fn default() -> Self {
        Self {
            sar: (1, 1),
            full_range: false,
            matrix_coefficients: 2,
            fps: None,
            max_num_reorder_frames: None,
            max_dec_frame_buffering: None,
        }
    }
}

impl Sps {
    /// ChromaArrayType
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// MaxFrameNum
    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    /// MaxPicOrderCntLsb
    pub fn max_poc_lsb(&self) -> u32 {
        1 << self.log2_max_poc_lsb
    }

    /// 编码宽度 (像素, 宏块对齐)
    pub fn coded_width(&self) -> u32 {
        self.pic_width_in_mbs * 16
    }

    /// 编码高度 (像素, 宏块对齐)
    pub fn coded_height(&self) -> u32 {
        let frame_height_in_mbs = self.pic_height_in_map_units * if self.frame_mbs_only { 1 } else { 2 };
        frame_height_in_mbs * 16
    }

    /// 显示宽度 (已应用 cropping)
    pub fn width(&self) -> u32 {
        let (unit_x, _) = cropping_unit(self.chroma_array_type(), self.frame_mbs_only);
        self.coded_width() - (self.crop[0] + self.crop[1]) * unit_x
    }

    /// 显示高度 (已应用 cropping)
    pub fn height(&self) -> u32 {
        let (_, unit_y) = cropping_unit(self.chroma_array_type(), self.frame_mbs_only);
        self.coded_height() - (self.crop[2] + self.crop[3]) * unit_y
    }

    /// 帧率 (浮点), 来自 VUI timing_info
    pub fn frame_rate(&self) -> Option<f64> {
        let (num, den) = self.vui.as_ref()?.fps?;
        Some(f64::from(num) / f64::from(den))
    }
}

/// 预定义的 SAR 表 (ITU-T H.264 表 E-1)
const SAR_TABLE: [(u32, u32); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// 从 RBSP 数据解析 SPS
pub fn parse_sps(rbsp: &[u8]) -> MirraResult<Sps> {
    if rbsp.len() < 3 {
        return Err(MirraError::InvalidData("H.264: SPS RBSP 太短".into()));
    }

    let mut br = BitstreamReader::new(rbsp);

    let profile_idc = br.read_bits(8)? as u8;
    let constraint_set_flags = br.read_bits(8)? as u8;
    let level_idc = br.read_bits(8)? as u8;
    let sps_id = br.read_ue()?;
    if sps_id > 31 {
        return Err(MirraError::InvalidData(format!(
            "H.264: sps_id 超出范围, sps_id={}",
            sps_id
        )));
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    let mut bit_depth_chroma = 8;
    let mut qpprime_y_zero_transform_bypass = false;
    let mut scaling_lists = None;

    // High profile 及以上有额外字段
    if is_high_profile(profile_idc) {
        chroma_format_idc = br.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(MirraError::InvalidData(format!(
                "H.264: chroma_format_idc 非法, value={}",
                chroma_format_idc
            )));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = br.read_flag()?;
        }
        bit_depth_luma = br.read_ue()? + 8;
        bit_depth_chroma = br.read_ue()? + 8;
        if !(8..=14).contains(&bit_depth_luma) || !(8..=14).contains(&bit_depth_chroma) {
            return Err(MirraError::InvalidData(format!(
                "H.264: bit_depth 非法, luma={}, chroma={}",
                bit_depth_luma, bit_depth_chroma
            )));
        }
        qpprime_y_zero_transform_bypass = br.read_flag()?;
        if br.read_flag()? {
            let num_8x8 = if chroma_format_idc == 3 { 6 } else { 2 };
            scaling_lists = Some(parse_scaling_matrix(&mut br, num_8x8)?);
        }
    }

    let log2_max_frame_num_minus4 = br.read_ue()?;
    if log2_max_frame_num_minus4 > 12 {
        return Err(MirraError::InvalidData(format!(
            "H.264: log2_max_frame_num_minus4 超出范围, value={}",
            log2_max_frame_num_minus4
        )));
    }

    let poc_type = br.read_ue()?;
    let mut log2_max_poc_lsb = 0u32;
    let mut delta_pic_order_always_zero = false;
    let mut offset_for_non_ref_pic = 0i32;
    let mut offset_for_top_to_bottom_field = 0i32;
    let mut offset_for_ref_frame = Vec::new();
    match poc_type {
        0 => {
            let log2_max_poc_lsb_minus4 = br.read_ue()?;
            if log2_max_poc_lsb_minus4 > 12 {
                return Err(MirraError::InvalidData(format!(
                    "H.264: log2_max_pic_order_cnt_lsb_minus4 超出范围, value={}",
                    log2_max_poc_lsb_minus4
                )));
            }
            log2_max_poc_lsb = log2_max_poc_lsb_minus4 + 4;
        }
        1 => {
            delta_pic_order_always_zero = br.read_flag()?;
            offset_for_non_ref_pic = br.read_se()?;
            offset_for_top_to_bottom_field = br.read_se()?;
            let num_ref_in_cycle = br.read_ue()?;
            if num_ref_in_cycle > 255 {
                return Err(MirraError::InvalidData(format!(
                    "H.264: num_ref_frames_in_pic_order_cnt_cycle 超出范围, value={}",
                    num_ref_in_cycle
                )));
            }
            offset_for_ref_frame = (0..num_ref_in_cycle)
                .map(|_| br.read_se())
                .collect::<MirraResult<Vec<_>>>()?;
        }
        2 => {}
        other => {
            // 非标准值没有专属字段, POC 计算回退到 frame_num
            warn!("H.264: pic_order_cnt_type 非标准, value={}", other);
        }
    }

    let max_num_ref_frames = br.read_ue()?;
    if max_num_ref_frames > 16 {
        return Err(MirraError::InvalidData(format!(
            "H.264: max_num_ref_frames 超出范围, value={}",
            max_num_ref_frames
        )));
    }
    let gaps_in_frame_num_allowed = br.read_flag()?;

    let pic_width_in_mbs = br.read_ue()? + 1;
    let pic_height_in_map_units = br.read_ue()? + 1;
    if pic_width_in_mbs > 1024 || pic_height_in_map_units > 1024 {
        return Err(MirraError::InvalidData(format!(
            "H.264: 图像尺寸超出范围, width_mbs={}, height_map_units={}",
            pic_width_in_mbs, pic_height_in_map_units
        )));
    }

    let frame_mbs_only = br.read_flag()?;
    let mb_adaptive_frame_field = if frame_mbs_only {
        false
    } else {
        br.read_flag()?
    };
    let direct_8x8_inference = br.read_flag()?;

    let frame_cropping = br.read_flag()?;
    let mut crop = [0u32; 4];
    if frame_cropping {
        for value in crop.iter_mut() {
            *value = br.read_ue()?;
        }
    }

    let mut sps = Sps {
        profile_idc,
        constraint_set_flags,
        level_idc,
        sps_id,
        chroma_format_idc,
        separate_colour_plane,
        bit_depth_luma,
        bit_depth_chroma,
        qpprime_y_zero_transform_bypass,
        scaling_lists,
        log2_max_frame_num: log2_max_frame_num_minus4 + 4,
        poc_type,
        log2_max_poc_lsb,
        delta_pic_order_always_zero,
        offset_for_non_ref_pic,
        offset_for_top_to_bottom_field,
        offset_for_ref_frame,
        max_num_ref_frames,
        gaps_in_frame_num_allowed,
        pic_width_in_mbs,
        pic_height_in_map_units,
        frame_mbs_only,
        mb_adaptive_frame_field,
        direct_8x8_inference,
        frame_cropping,
        crop,
        vui: None,
    };
    validate_cropping(&sps)?;

    if br.read_flag()? {
        sps.vui = Some(parse_vui(&mut br)?);
    }

    Ok(sps)
}

// ============================================================
// 辅助函数
// ============================================================

/// 是否为 High Profile 或更高
fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134
    )
}

/// 获取 cropping 单位
fn cropping_unit(chroma_array_type: u32, frame_mbs_only: bool) -> (u32, u32) {
    let sub_width = match chroma_array_type {
        0 | 3 => 1,
        _ => 2,
    };
    let sub_height = match chroma_array_type {
        0 | 2 | 3 => 1,
        _ => 2,
    };
    let height_mult = if frame_mbs_only { 1 } else { 2 };

    (sub_width, sub_height * height_mult)
}

fn validate_cropping(sps: &Sps) -> MirraResult<()> {
    let (unit_x, unit_y) = cropping_unit(sps.chroma_array_type(), sps.frame_mbs_only);
    let crop_x = sps.crop[0]
        .checked_add(sps.crop[1])
        .and_then(|v| v.checked_mul(unit_x));
    let crop_y = sps.crop[2]
        .checked_add(sps.crop[3])
        .and_then(|v| v.checked_mul(unit_y));
    match (crop_x, crop_y) {
        (Some(x), Some(y)) if x < sps.coded_width() && y < sps.coded_height() => Ok(()),
        _ => Err(MirraError::InvalidData(format!(
            "H.264: 裁剪参数非法, raw={}x{}, crop={:?}",
            sps.coded_width(),
            sps.coded_height(),
            sps.crop
        ))),
    }
}

/// 解析 VUI 参数
///
/// timing_info 之后的 HRD 与 bitstream_restriction 截断时只记录日志,
/// 已解析出的字段仍然有效.
fn parse_vui(br: &mut BitstreamReader) -> MirraResult<Vui> {
    let mut vui = Vui::default();

    // aspect_ratio_info_present_flag
    if br.read_flag()? {
        let ar_idc = br.read_bits(8)? as usize;
        if ar_idc == 255 {
            let sar_w = br.read_bits(16)?;
            let sar_h = br.read_bits(16)?;
            if sar_w == 0 || sar_h == 0 {
                return Err(MirraError::InvalidData(format!(
                    "H.264: VUI Extended_SAR 非法, sar_w={}, sar_h={}",
                    sar_w, sar_h
                )));
            }
            vui.sar = (sar_w, sar_h);
        } else if let Some(&(w, h)) = SAR_TABLE.get(ar_idc) {
            if w > 0 {
                vui.sar = (w, h);
            }
        } else {
            return Err(MirraError::InvalidData(format!(
                "H.264: VUI aspect_ratio_idc 非法, value={}",
                ar_idc
            )));
        }
    }

    // overscan_info_present_flag
    if br.read_flag()? {
        br.skip_bits(1)?;
    }

    // video_signal_type_present_flag
    if br.read_flag()? {
        br.skip_bits(3)?; // video_format
        vui.full_range = br.read_flag()?;
        if br.read_flag()? {
            br.skip_bits(8)?; // colour_primaries
            br.skip_bits(8)?; // transfer_characteristics
            vui.matrix_coefficients = br.read_bits(8)? as u8;
        }
    }

    // chroma_loc_info_present_flag
    if br.read_flag()? {
        br.read_ue()?;
        br.read_ue()?;
    }

    // timing_info_present_flag
    if br.read_flag()? {
        let num_units = br.read_bits(32)?;
        let time_scale = br.read_bits(32)?;
        let _fixed_frame_rate = br.read_flag()?;
        if num_units == 0 {
            return Err(MirraError::InvalidData(
                "H.264: VUI num_units_in_tick 不能为 0".into(),
            ));
        }
        if time_scale == 0 {
            return Err(MirraError::InvalidData(
                "H.264: VUI time_scale 不能为 0".into(),
            ));
        }
        // fps = time_scale / (2 * num_units_in_tick)
        vui.fps = Some((time_scale, num_units.saturating_mul(2)));
    }

    if let Err(err) = parse_vui_tail(br, &mut vui) {
        debug!("H.264: VUI 尾部字段不完整, 已忽略: {}", err);
    }

    Ok(vui)
}

/// HRD 参数与 bitstream_restriction
fn parse_vui_tail(br: &mut BitstreamReader, vui: &mut Vui) -> MirraResult<()> {
    let nal_hrd = br.read_flag()?;
    if nal_hrd {
        skip_hrd_parameters(br)?;
    }
    let vcl_hrd = br.read_flag()?;
    if vcl_hrd {
        skip_hrd_parameters(br)?;
    }
    if nal_hrd || vcl_hrd {
        br.skip_bits(1)?; // low_delay_hrd_flag
    }
    br.skip_bits(1)?; // pic_struct_present_flag

    if br.read_flag()? {
        br.skip_bits(1)?; // motion_vectors_over_pic_boundaries_flag
        br.read_ue()?; // max_bytes_per_pic_denom
        br.read_ue()?; // max_bits_per_mb_denom
        br.read_ue()?; // log2_max_mv_length_horizontal
        br.read_ue()?; // log2_max_mv_length_vertical
        vui.max_num_reorder_frames = Some(br.read_ue()?);
        vui.max_dec_frame_buffering = Some(br.read_ue()?);
    }
    Ok(())
}

fn skip_hrd_parameters(br: &mut BitstreamReader) -> MirraResult<()> {
    let cpb_cnt = br.read_ue()? + 1;
    if cpb_cnt > 32 {
        return Err(MirraError::InvalidData(format!(
            "H.264: cpb_cnt_minus1 超出范围, value={}",
            cpb_cnt - 1
        )));
    }
    br.skip_bits(4)?; // bit_rate_scale
    br.skip_bits(4)?; // cpb_size_scale
    for _ in 0..cpb_cnt {
        br.read_ue()?; // bit_rate_value_minus1
        br.read_ue()?; // cpb_size_value_minus1
        br.skip_bits(1)?; // cbr_flag
    }
    br.skip_bits(20)?; // 4 个 5 位长度字段
    Ok(())
}
