//! H.264 PPS (Picture Parameter Set) 解析器.

use mirra_core::{BitstreamReader, MirraError, MirraResult};

use super::params::ParameterSets;
use super::scaling::{ScalingLists, parse_scaling_matrix};

/// PPS 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct Pps {
    /// pic_parameter_set_id (0-255)
    pub pps_id: u32,
    /// 引用的 seq_parameter_set_id
    pub sps_id: u32,
    /// entropy_coding_mode_flag (false=CAVLC, true=CABAC)
    pub entropy_coding_mode: bool,
    /// bottom_field_pic_order_in_frame_present_flag
    pub bottom_field_pic_order_present: bool,
    /// num_ref_idx_l0_default_active_minus1 + 1
    pub num_ref_idx_l0_default_active: u32,
    /// num_ref_idx_l1_default_active_minus1 + 1
    pub num_ref_idx_l1_default_active: u32,
    /// weighted_pred_flag
    pub weighted_pred: bool,
    /// weighted_bipred_idc (0-2)
    pub weighted_bipred_idc: u32,
    /// 26 + pic_init_qp_minus26
    pub pic_init_qp: i32,
    /// 26 + pic_init_qs_minus26
    pub pic_init_qs: i32,
    /// chroma_qp_index_offset
    pub chroma_qp_index_offset: i32,
    /// deblocking_filter_control_present_flag
    pub deblocking_filter_control: bool,
    /// constrained_intra_pred_flag
    pub constrained_intra_pred: bool,
    /// redundant_pic_cnt_present_flag
    pub redundant_pic_cnt_present: bool,
    /// transform_8x8_mode_flag
    pub transform_8x8_mode: bool,
    /// 图像级量化矩阵
    pub scaling_lists: Option<ScalingLists>,
    /// second_chroma_qp_index_offset (缺省等于 chroma_qp_index_offset)
    pub second_chroma_qp_index_offset: i32,
}

/// 从 RBSP 数据解析 PPS
///
/// 8x8 量化矩阵的组数取决于所引用 SPS 的色度格式, 引用的 SPS 尚未出现时按 4:2:0 处理.
/// 多 slice group (FMO) 不支持, 直接返回错误.
pub fn parse_pps(rbsp: &[u8], sets: &ParameterSets) -> MirraResult<Pps> {
    if rbsp.is_empty() {
        return Err(MirraError::InvalidData("H.264: PPS RBSP 为空".into()));
    }

    let mut br = BitstreamReader::new(rbsp);
    let pps_id = br.read_ue()?;
    if pps_id > 255 {
        return Err(MirraError::InvalidData(format!(
            "H.264: pps_id 超出范围, pps_id={}",
            pps_id
        )));
    }

    let sps_id = br.read_ue()?;
    if sps_id > 31 {
        return Err(MirraError::InvalidData(format!(
            "H.264: sps_id 超出范围, sps_id={}",
            sps_id
        )));
    }

    let entropy_coding_mode = br.read_flag()?;
    let bottom_field_pic_order_present = br.read_flag()?;

    let num_slice_groups_minus1 = br.read_ue()?;
    if num_slice_groups_minus1 > 0 {
        return Err(MirraError::Unsupported(format!(
            "H.264: 不支持多 slice group, num_slice_groups_minus1={}",
            num_slice_groups_minus1
        )));
    }

    let num_ref_idx_l0_default_active_minus1 = br.read_ue()?;
    if num_ref_idx_l0_default_active_minus1 > 31 {
        return Err(MirraError::InvalidData(format!(
            "H.264: num_ref_idx_l0_default_active_minus1 超出范围, value={}",
            num_ref_idx_l0_default_active_minus1
        )));
    }
    let num_ref_idx_l1_default_active_minus1 = br.read_ue()?;
    if num_ref_idx_l1_default_active_minus1 > 31 {
        return Err(MirraError::InvalidData(format!(
            "H.264: num_ref_idx_l1_default_active_minus1 超出范围, value={}",
            num_ref_idx_l1_default_active_minus1
        )));
    }

    let weighted_pred = br.read_flag()?;
    let weighted_bipred_idc = br.read_bits(2)?;
    if weighted_bipred_idc > 2 {
        return Err(MirraError::InvalidData(format!(
            "H.264: weighted_bipred_idc 非法, value={}",
            weighted_bipred_idc
        )));
    }

    let pic_init_qp = read_init_qp(&mut br, "pic_init_qp")?;
    let pic_init_qs = read_init_qp(&mut br, "pic_init_qs")?;

    let chroma_qp_index_offset = br.read_se()?;
    validate_chroma_offset("chroma_qp_index_offset", chroma_qp_index_offset)?;

    let deblocking_filter_control = br.read_flag()?;
    let constrained_intra_pred = br.read_flag()?;
    let redundant_pic_cnt_present = br.read_flag()?;

    let mut transform_8x8_mode = false;
    let mut scaling_lists = None;
    let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

    if br.more_rbsp_data() {
        transform_8x8_mode = br.read_flag()?;
        if br.read_flag()? {
            let chroma_format_idc = sets.sps(sps_id).map_or(1, |sps| sps.chroma_format_idc);
            let num_8x8 = match (transform_8x8_mode, chroma_format_idc) {
                (false, _) => 0,
                (true, 3) => 6,
                (true, _) => 2,
            };
            scaling_lists = Some(parse_scaling_matrix(&mut br, num_8x8)?);
        }
        second_chroma_qp_index_offset = br.read_se()?;
        validate_chroma_offset("second_chroma_qp_index_offset", second_chroma_qp_index_offset)?;
    }

    Ok(Pps {
        pps_id,
        sps_id,
        entropy_coding_mode,
        bottom_field_pic_order_present,
        num_ref_idx_l0_default_active: num_ref_idx_l0_default_active_minus1 + 1,
        num_ref_idx_l1_default_active: num_ref_idx_l1_default_active_minus1 + 1,
        weighted_pred,
        weighted_bipred_idc,
        pic_init_qp,
        pic_init_qs,
        chroma_qp_index_offset,
        deblocking_filter_control,
        constrained_intra_pred,
        redundant_pic_cnt_present,
        transform_8x8_mode,
        scaling_lists,
        second_chroma_qp_index_offset,
    })
}

fn validate_chroma_offset(field: &str, value: i32) -> MirraResult<()> {
    if !(-12..=12).contains(&value) {
        return Err(MirraError::InvalidData(format!(
            "H.264: {} 超出范围, value={}",
            field, value
        )));
    }
    Ok(())
}

/// 读取 `*_minus26` 形式的初始量化参数, 取值 0..=51
fn read_init_qp(br: &mut BitstreamReader<'_>, name: &str) -> MirraResult<i32> {
    let qp = br.read_se()?.saturating_add(26);
    if !(0..=51).contains(&qp) {
        return Err(MirraError::InvalidData(format!(
            "H.264: {} 超出范围, {}={}",
            name, name, qp
        )));
    }
    Ok(qp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::tests::helpers::{TestPps, build_pps_rbsp};

    #[test]
    fn test_parse_pps_basic_fields() {
        let input = TestPps {
            pps_id: 3,
            entropy_coding_mode: true,
            num_ref_idx_l0_minus1: 2,
            weighted_bipred_idc: 1,
            pic_init_qp_minus26: -4,
            chroma_qp_index_offset: 2,
            ..TestPps::default()
        };
        let pps = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new()).expect("PPS 解析失败");
        assert_eq!(pps.pps_id, 3);
        assert!(pps.entropy_coding_mode);
        assert_eq!(pps.num_ref_idx_l0_default_active, 3);
        assert_eq!(pps.weighted_bipred_idc, 1);
        assert_eq!(pps.pic_init_qp, 22);
        assert_eq!(pps.second_chroma_qp_index_offset, 2);
        assert!(!pps.transform_8x8_mode);
    }

    #[test]
    fn test_parse_pps_high_profile_extension() {
        let input = TestPps {
            transform_8x8_mode: Some(true),
            second_chroma_qp_index_offset: -3,
            ..TestPps::default()
        };
        let pps = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new()).unwrap();
        assert!(pps.transform_8x8_mode);
        assert_eq!(pps.second_chroma_qp_index_offset, -3);
        assert!(pps.scaling_lists.is_none());
    }

    #[test]
    fn test_parse_pps_reject_slice_groups() {
        let input = TestPps {
            num_slice_groups_minus1: 1,
            ..TestPps::default()
        };
        let err = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new())
            .expect_err("多 slice group 应失败");
        assert!(matches!(err, MirraError::Unsupported(_)));
    }

    #[test]
    fn test_parse_pps_reject_chroma_offset() {
        let input = TestPps {
            chroma_qp_index_offset: 13,
            ..TestPps::default()
        };
        let err = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new())
            .expect_err("chroma_qp_index_offset 超范围应失败");
        assert!(format!("{err}").contains("chroma_qp_index_offset"));
    }

    #[test]
    fn test_parse_pps_reject_init_qs() {
        let input = TestPps {
            pic_init_qs_minus26: 26,
            ..TestPps::default()
        };
        let err = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new())
            .expect_err("pic_init_qs 超范围应失败");
        assert!(format!("{err}").contains("pic_init_qs"));

        let input = TestPps {
            pic_init_qs_minus26: -26,
            ..TestPps::default()
        };
        let pps = parse_pps(&build_pps_rbsp(&input), &ParameterSets::new()).unwrap();
        assert_eq!(pps.pic_init_qs, 0);
    }
}
