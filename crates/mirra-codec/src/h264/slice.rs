//! H.264 slice header 解析.
//!
//! 残差与宏块数据交给硬件解码, 这里只解析到 slice_data 之前.
//! 参考列表修改与加权预测表只解析不应用, 用于保持比特游标位置正确.

use mirra_core::{BitstreamReader, MirraError, MirraResult};

use super::nal::{NalUnit, NalUnitType, remove_emulation_prevention};
use super::params::ParameterSets;
use super::pps::Pps;
use super::sps::Sps;

/// 单个 slice 中允许的 MMCO 命令上限
pub const MAX_MMCO_OPS: usize = 64;

/// slice 类型 (已归一化到 0-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    /// 从 slice_type 语法值 (0-9) 构造
    pub fn from_raw(raw: u32) -> MirraResult<Self> {
        match raw % 5 {
            0 if raw <= 9 => Ok(Self::P),
            1 if raw <= 9 => Ok(Self::B),
            2 if raw <= 9 => Ok(Self::I),
            3 if raw <= 9 => Ok(Self::Sp),
            4 if raw <= 9 => Ok(Self::Si),
            _ => Err(MirraError::InvalidData(format!(
                "H.264: slice_type 非法, value={}",
                raw
            ))),
        }
    }

    /// 归一化后的数值
    pub fn as_raw(&self) -> u32 {
        match self {
            Self::P => 0,
            Self::B => 1,
            Self::I => 2,
            Self::Sp => 3,
            Self::Si => 4,
        }
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I | Self::Si)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, Self::B)
    }
}

/// 一条参考列表修改指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefPicListModification {
    /// modification_of_pic_nums_idc (0-2)
    pub idc: u32,
    /// abs_diff_pic_num_minus1 或 long_term_pic_num
    pub value: u32,
}

/// 一条 MMCO 命令
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmcoCommand {
    /// memory_management_control_operation (1-6)
    pub operation: u32,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx_plus1: u32,
}

/// dec_ref_pic_marking 语法
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    /// no_output_of_prior_pics_flag (仅 IDR)
    pub no_output_of_prior_pics: bool,
    /// long_term_reference_flag (仅 IDR)
    pub long_term_reference: bool,
    /// adaptive_ref_pic_marking_mode_flag (仅非 IDR)
    pub adaptive: bool,
    /// 按出现顺序排列的 MMCO 命令
    pub ops: Vec<MmcoCommand>,
}

impl DecRefPicMarking {
    /// 是否包含 MMCO 5
    pub fn has_mmco5(&self) -> bool {
        self.ops.iter().any(|op| op.operation == 5)
    }
}

/// slice header 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHeader {
    pub nal_type: NalUnitType,
    pub nal_ref_idc: u8,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pps_id: u32,
    pub colour_plane_id: u32,
    pub frame_num: u32,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred: bool,
    pub num_ref_idx_l0_active: u32,
    pub num_ref_idx_l1_active: u32,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    /// 是否携带 pred_weight_table
    pub has_pred_weight_table: bool,
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub cabac_init_idc: u32,
    pub slice_qp_delta: i32,
    pub disable_deblocking_filter_idc: u32,
    pub slice_alpha_c0_offset_div2: i32,
    pub slice_beta_offset_div2: i32,
    /// slice header 的比特长度 (RBSP 域)
    pub header_bits: usize,
}

impl SliceHeader {
    pub fn is_idr(&self) -> bool {
        self.nal_type == NalUnitType::SliceIdr
    }

    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }
}

/// 只读取 slice header 开头三个字段, 取出 pps_id
pub fn peek_pps_id(rbsp: &[u8]) -> MirraResult<u32> {
    let mut br = BitstreamReader::new(rbsp);
    br.read_ue()?; // first_mb_in_slice
    SliceType::from_raw(br.read_ue()?)?;
    let pps_id = br.read_ue()?;
    if pps_id > 255 {
        return Err(MirraError::InvalidData(format!(
            "H.264: slice pps_id 超出范围, pps_id={}",
            pps_id
        )));
    }
    Ok(pps_id)
}

/// 解析 slice header, 所引用的 SPS/PPS 必须已经存在
pub fn parse_slice_header(nal: &NalUnit<'_>, sets: &ParameterSets) -> MirraResult<SliceHeader> {
    if !matches!(nal.nal_type, NalUnitType::Slice | NalUnitType::SliceIdr) {
        return Err(MirraError::InvalidArgument(format!(
            "H.264: 非 slice NAL, type={}",
            nal.nal_type
        )));
    }
    let rbsp = remove_emulation_prevention(&nal.payload()[1..]);
    let pps_id = peek_pps_id(&rbsp)?;
    let (sps, pps) = sets.resolve(pps_id)?;
    parse_slice_header_with(&rbsp, nal.nal_type, nal.ref_idc, sps, pps)
}

/// 使用给定的 SPS/PPS 解析 slice header RBSP
pub fn parse_slice_header_with(
    rbsp: &[u8],
    nal_type: NalUnitType,
    nal_ref_idc: u8,
    sps: &Sps,
    pps: &Pps,
) -> MirraResult<SliceHeader> {
    let is_idr = nal_type == NalUnitType::SliceIdr;
    let mut br = BitstreamReader::new(rbsp);

    let first_mb_in_slice = br.read_ue()?;
    let slice_type = SliceType::from_raw(br.read_ue()?)?;
    if is_idr && !slice_type.is_intra() {
        return Err(MirraError::InvalidData(format!(
            "H.264: IDR slice 类型非法, slice_type={:?}",
            slice_type
        )));
    }
    let pps_id = br.read_ue()?;

    let colour_plane_id = if sps.separate_colour_plane {
        br.read_bits(2)?
    } else {
        0
    };
    let frame_num = br.read_bits(sps.log2_max_frame_num)?;

    let mut field_pic = false;
    let mut bottom_field = false;
    if !sps.frame_mbs_only {
        field_pic = br.read_flag()?;
        if field_pic {
            bottom_field = br.read_flag()?;
        }
    }
    if field_pic {
        return Err(MirraError::Unsupported(format!(
            "H.264: 不支持场编码图像, bottom_field={}",
            bottom_field
        )));
    }

    let idr_pic_id = if is_idr { br.read_ue()? } else { 0 };

    let mut pic_order_cnt_lsb = 0;
    let mut delta_pic_order_cnt_bottom = 0;
    let mut delta_pic_order_cnt = [0i32; 2];
    match sps.poc_type {
        0 => {
            pic_order_cnt_lsb = br.read_bits(sps.log2_max_poc_lsb)?;
            if pps.bottom_field_pic_order_present {
                delta_pic_order_cnt_bottom = br.read_se()?;
            }
        }
        1 if !sps.delta_pic_order_always_zero => {
            delta_pic_order_cnt[0] = br.read_se()?;
            if pps.bottom_field_pic_order_present {
                delta_pic_order_cnt[1] = br.read_se()?;
            }
        }
        _ => {}
    }

    let redundant_pic_cnt = if pps.redundant_pic_cnt_present {
        br.read_ue()?
    } else {
        0
    };

    let direct_spatial_mv_pred = if slice_type.is_b() {
        br.read_flag()?
    } else {
        false
    };

    let mut num_ref_idx_l0_active = pps.num_ref_idx_l0_default_active;
    let mut num_ref_idx_l1_active = pps.num_ref_idx_l1_default_active;
    if !slice_type.is_intra() && br.read_flag()? {
        num_ref_idx_l0_active = br.read_ue()? + 1;
        if slice_type.is_b() {
            num_ref_idx_l1_active = br.read_ue()? + 1;
        }
    }
    if num_ref_idx_l0_active > 32 || num_ref_idx_l1_active > 32 {
        return Err(MirraError::InvalidData(format!(
            "H.264: num_ref_idx_active 超出范围, l0={}, l1={}",
            num_ref_idx_l0_active, num_ref_idx_l1_active
        )));
    }
    if slice_type.is_intra() {
        num_ref_idx_l0_active = 0;
    }
    if !slice_type.is_b() {
        num_ref_idx_l1_active = 0;
    }

    let mut ref_pic_list_modification_l0 = Vec::new();
    let mut ref_pic_list_modification_l1 = Vec::new();
    if !slice_type.is_intra() {
        ref_pic_list_modification_l0 = parse_ref_pic_list_modification(&mut br)?;
        if slice_type.is_b() {
            ref_pic_list_modification_l1 = parse_ref_pic_list_modification(&mut br)?;
        }
    }

    let has_pred_weight_table = (pps.weighted_pred
        && matches!(slice_type, SliceType::P | SliceType::Sp))
        || (pps.weighted_bipred_idc == 1 && slice_type.is_b());
    if has_pred_weight_table {
        skip_pred_weight_table(
            &mut br,
            sps.chroma_array_type(),
            num_ref_idx_l0_active,
            num_ref_idx_l1_active,
        )?;
    }

    let dec_ref_pic_marking = if nal_ref_idc != 0 {
        parse_dec_ref_pic_marking(&mut br, is_idr)?
    } else {
        DecRefPicMarking::default()
    };

    let cabac_init_idc = if pps.entropy_coding_mode && !slice_type.is_intra() {
        let value = br.read_ue()?;
        if value > 2 {
            return Err(MirraError::InvalidData(format!(
                "H.264: cabac_init_idc 非法, value={}",
                value
            )));
        }
        value
    } else {
        0
    };

    let slice_qp_delta = br.read_se()?;
    let slice_qp = pps.pic_init_qp + slice_qp_delta;
    if !(0..=51).contains(&slice_qp) {
        return Err(MirraError::InvalidData(format!(
            "H.264: slice_qp 超出范围, slice_qp={}",
            slice_qp
        )));
    }

    if matches!(slice_type, SliceType::Sp | SliceType::Si) {
        if slice_type == SliceType::Sp {
            br.skip_bits(1)?; // sp_for_switch_flag
        }
        br.read_se()?; // slice_qs_delta
    }

    let mut disable_deblocking_filter_idc = 0;
    let mut slice_alpha_c0_offset_div2 = 0;
    let mut slice_beta_offset_div2 = 0;
    if pps.deblocking_filter_control {
        disable_deblocking_filter_idc = br.read_ue()?;
        if disable_deblocking_filter_idc > 2 {
            return Err(MirraError::InvalidData(format!(
                "H.264: disable_deblocking_filter_idc 非法, value={}",
                disable_deblocking_filter_idc
            )));
        }
        if disable_deblocking_filter_idc != 1 {
            slice_alpha_c0_offset_div2 = br.read_se()?;
            slice_beta_offset_div2 = br.read_se()?;
        }
    }

    Ok(SliceHeader {
        nal_type,
        nal_ref_idc,
        first_mb_in_slice,
        slice_type,
        pps_id,
        colour_plane_id,
        frame_num,
        field_pic,
        bottom_field,
        idr_pic_id,
        pic_order_cnt_lsb,
        delta_pic_order_cnt_bottom,
        delta_pic_order_cnt,
        redundant_pic_cnt,
        direct_spatial_mv_pred,
        num_ref_idx_l0_active,
        num_ref_idx_l1_active,
        ref_pic_list_modification_l0,
        ref_pic_list_modification_l1,
        has_pred_weight_table,
        dec_ref_pic_marking,
        cabac_init_idc,
        slice_qp_delta,
        disable_deblocking_filter_idc,
        slice_alpha_c0_offset_div2,
        slice_beta_offset_div2,
        header_bits: br.bits_read(),
    })
}

fn parse_ref_pic_list_modification(
    br: &mut BitstreamReader,
) -> MirraResult<Vec<RefPicListModification>> {
    let mut ops = Vec::new();
    if !br.read_flag()? {
        return Ok(ops);
    }
    loop {
        let idc = br.read_ue()?;
        match idc {
            0..=2 => {
                if ops.len() >= 33 {
                    return Err(MirraError::InvalidData(
                        "H.264: ref_pic_list_modification 指令过多".into(),
                    ));
                }
                let value = br.read_ue()?;
                ops.push(RefPicListModification { idc, value });
            }
            3 => break,
            _ => {
                return Err(MirraError::InvalidData(format!(
                    "H.264: modification_of_pic_nums_idc 非法, value={}",
                    idc
                )));
            }
        }
    }
    Ok(ops)
}

fn skip_pred_weight_table(
    br: &mut BitstreamReader,
    chroma_array_type: u32,
    num_l0: u32,
    num_l1: u32,
) -> MirraResult<()> {
    let luma_log2_weight_denom = br.read_ue()?;
    if luma_log2_weight_denom > 7 {
        return Err(MirraError::InvalidData(format!(
            "H.264: luma_log2_weight_denom 超出范围, value={}",
            luma_log2_weight_denom
        )));
    }
    if chroma_array_type != 0 {
        let chroma_log2_weight_denom = br.read_ue()?;
        if chroma_log2_weight_denom > 7 {
            return Err(MirraError::InvalidData(format!(
                "H.264: chroma_log2_weight_denom 超出范围, value={}",
                chroma_log2_weight_denom
            )));
        }
    }
    for count in [num_l0, num_l1] {
        for _ in 0..count {
            if br.read_flag()? {
                br.read_se()?; // luma_weight
                br.read_se()?; // luma_offset
            }
            if chroma_array_type != 0 && br.read_flag()? {
                for _ in 0..2 {
                    br.read_se()?; // chroma_weight
                    br.read_se()?; // chroma_offset
                }
            }
        }
    }
    Ok(())
}

fn parse_dec_ref_pic_marking(
    br: &mut BitstreamReader,
    is_idr: bool,
) -> MirraResult<DecRefPicMarking> {
    let mut marking = DecRefPicMarking::default();
    if is_idr {
        marking.no_output_of_prior_pics = br.read_flag()?;
        marking.long_term_reference = br.read_flag()?;
        return Ok(marking);
    }

    marking.adaptive = br.read_flag()?;
    if !marking.adaptive {
        return Ok(marking);
    }
    loop {
        let operation = br.read_ue()?;
        if operation == 0 {
            break;
        }
        if marking.ops.len() >= MAX_MMCO_OPS {
            return Err(MirraError::InvalidData(format!(
                "H.264: MMCO 命令数量超出上限, limit={}",
                MAX_MMCO_OPS
            )));
        }
        let mut cmd = MmcoCommand {
            operation,
            ..MmcoCommand::default()
        };
        match operation {
            1 => cmd.difference_of_pic_nums_minus1 = br.read_ue()?,
            2 => cmd.long_term_pic_num = br.read_ue()?,
            3 => {
                cmd.difference_of_pic_nums_minus1 = br.read_ue()?;
                cmd.long_term_frame_idx = br.read_ue()?;
            }
            4 => cmd.max_long_term_frame_idx_plus1 = br.read_ue()?,
            5 => {}
            6 => cmd.long_term_frame_idx = br.read_ue()?,
            _ => {
                return Err(MirraError::InvalidData(format!(
                    "H.264: memory_management_control_operation 非法, value={}",
                    operation
                )));
            }
        }
        marking.ops.push(cmd);
    }
    Ok(marking)
}
