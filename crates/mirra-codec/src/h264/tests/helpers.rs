use mirra_core::{MirraError, MirraResult};

use super::super::{
    BitstreamSlot, DecodeBackend, DecodeSubmission, MmcoCommand, NalUnitType, ParameterSets,
    SessionCaps, SessionDescriptor, SliceHeader, Sps, add_emulation_prevention, parse_pps,
    parse_slice_header_with, parse_sps,
};

// ============================================================
// 位写入器
// ============================================================

/// 按位构造 RBSP
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bit(&mut self, value: bool) {
        self.bits.push(value);
    }

    pub(crate) fn bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.bits.push((u64::from(value) >> i) & 1 == 1);
        }
    }

    pub(crate) fn ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros();
        for _ in 0..len - 1 {
            self.bits.push(false);
        }
        for i in (0..len).rev() {
            self.bits.push((code >> i) & 1 == 1);
        }
    }

    pub(crate) fn se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.ue(mapped);
    }

    /// 追加 rbsp_stop_one_bit 与字节对齐
    pub(crate) fn into_rbsp(mut self) -> Vec<u8> {
        self.bits.push(true);
        self.into_bytes()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &bit)| acc | (u8::from(bit) << (7 - i)))
            })
            .collect()
    }
}

// ============================================================
// 参数集构造
// ============================================================

#[derive(Debug, Clone)]
pub(crate) struct TestSps {
    pub(crate) profile_idc: u8,
    pub(crate) level_idc: u8,
    pub(crate) sps_id: u32,
    pub(crate) bit_depth_luma_minus8: u32,
    pub(crate) bit_depth_chroma_minus8: u32,
    pub(crate) log2_max_frame_num_minus4: u32,
    pub(crate) poc_type: u32,
    pub(crate) log2_max_poc_lsb_minus4: u32,
    pub(crate) delta_pic_order_always_zero: bool,
    pub(crate) offset_for_non_ref_pic: i32,
    pub(crate) offset_for_top_to_bottom_field: i32,
    pub(crate) offset_for_ref_frame: Vec<i32>,
    pub(crate) max_num_ref_frames: u32,
    pub(crate) width_mbs: u32,
    pub(crate) height_mbs: u32,
    pub(crate) crop: [u32; 4],
    pub(crate) frame_mbs_only: bool,
    /// (num_units_in_tick, time_scale)
    pub(crate) vui_timing: Option<(u32, u32)>,
    pub(crate) vui_max_num_reorder_frames: Option<u32>,
}

impl Default for TestSps {
    fn default() -> Self {
        Self {
            profile_idc: 66,
            level_idc: 30,
            sps_id: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_frame_num_minus4: 0,
            poc_type: 0,
            log2_max_poc_lsb_minus4: 2,
            delta_pic_order_always_zero: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: Vec::new(),
            max_num_ref_frames: 4,
            width_mbs: 20,
            height_mbs: 15,
            crop: [0; 4],
            frame_mbs_only: true,
            vui_timing: None,
            vui_max_num_reorder_frames: None,
        }
    }
}

impl TestSps {
    /// 4:2:0 帧编码, 按需在右侧与底部裁剪
    pub(crate) fn with_size(width: u32, height: u32) -> Self {
        let width_mbs = width.div_ceil(16);
        let height_mbs = height.div_ceil(16);
        Self {
            width_mbs,
            height_mbs,
            crop: [0, (width_mbs * 16 - width) / 2, 0, (height_mbs * 16 - height) / 2],
            ..Self::default()
        }
    }
}

fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134
    )
}

pub(crate) fn build_sps_rbsp(input: &TestSps) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.bits(u32::from(input.profile_idc), 8);
    w.bits(0, 8);
    w.bits(u32::from(input.level_idc), 8);
    w.ue(input.sps_id);
    if is_high_profile(input.profile_idc) {
        w.ue(1);
        w.ue(input.bit_depth_luma_minus8);
        w.ue(input.bit_depth_chroma_minus8);
        w.bit(false);
        w.bit(false);
    }
    w.ue(input.log2_max_frame_num_minus4);
    w.ue(input.poc_type);
    match input.poc_type {
        0 => w.ue(input.log2_max_poc_lsb_minus4),
        1 => {
            w.bit(input.delta_pic_order_always_zero);
            w.se(input.offset_for_non_ref_pic);
            w.se(input.offset_for_top_to_bottom_field);
            w.ue(input.offset_for_ref_frame.len() as u32);
            for &offset in &input.offset_for_ref_frame {
                w.se(offset);
            }
        }
        _ => {}
    }
    w.ue(input.max_num_ref_frames);
    w.bit(false);
    w.ue(input.width_mbs - 1);
    w.ue(input.height_mbs - 1);
    w.bit(input.frame_mbs_only);
    if !input.frame_mbs_only {
        w.bit(false);
    }
    w.bit(true);
    if input.crop.iter().any(|&v| v != 0) {
        w.bit(true);
        for &value in &input.crop {
            w.ue(value);
        }
    } else {
        w.bit(false);
    }

    let has_vui = input.vui_timing.is_some() || input.vui_max_num_reorder_frames.is_some();
    w.bit(has_vui);
    if has_vui {
        w.bit(false); // aspect_ratio_info_present_flag
        w.bit(false); // overscan_info_present_flag
        w.bit(false); // video_signal_type_present_flag
        w.bit(false); // chroma_loc_info_present_flag
        match input.vui_timing {
            Some((num_units, time_scale)) => {
                w.bit(true);
                w.bits(num_units, 32);
                w.bits(time_scale, 32);
                w.bit(true);
            }
            None => w.bit(false),
        }
        w.bit(false); // nal_hrd
        w.bit(false); // vcl_hrd
        w.bit(false); // pic_struct_present_flag
        match input.vui_max_num_reorder_frames {
            Some(reorder) => {
                w.bit(true);
                w.bit(true);
                w.ue(2);
                w.ue(1);
                w.ue(16);
                w.ue(16);
                w.ue(reorder);
                w.ue(reorder.max(input.max_num_ref_frames));
            }
            None => w.bit(false),
        }
    }
    w.into_rbsp()
}

#[derive(Debug, Clone)]
pub(crate) struct TestPps {
    pub(crate) pps_id: u32,
    pub(crate) sps_id: u32,
    pub(crate) entropy_coding_mode: bool,
    pub(crate) bottom_field_pic_order_present: bool,
    pub(crate) num_slice_groups_minus1: u32,
    pub(crate) num_ref_idx_l0_minus1: u32,
    pub(crate) num_ref_idx_l1_minus1: u32,
    pub(crate) weighted_pred: bool,
    pub(crate) weighted_bipred_idc: u32,
    pub(crate) pic_init_qp_minus26: i32,
    pub(crate) pic_init_qs_minus26: i32,
    pub(crate) chroma_qp_index_offset: i32,
    pub(crate) deblocking_filter_control: bool,
    pub(crate) redundant_pic_cnt_present: bool,
    pub(crate) transform_8x8_mode: Option<bool>,
    pub(crate) second_chroma_qp_index_offset: i32,
}

impl Default for TestPps {
    fn default() -> Self {
        Self {
            pps_id: 0,
            sps_id: 0,
            entropy_coding_mode: false,
            bottom_field_pic_order_present: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_minus1: 0,
            num_ref_idx_l1_minus1: 0,
            weighted_pred: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control: true,
            redundant_pic_cnt_present: false,
            transform_8x8_mode: None,
            second_chroma_qp_index_offset: 0,
        }
    }
}

pub(crate) fn build_pps_rbsp(input: &TestPps) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.ue(input.pps_id);
    w.ue(input.sps_id);
    w.bit(input.entropy_coding_mode);
    w.bit(input.bottom_field_pic_order_present);
    w.ue(input.num_slice_groups_minus1);
    if input.num_slice_groups_minus1 > 0 {
        w.ue(0); // slice_group_map_type
        for _ in 0..=input.num_slice_groups_minus1 {
            w.ue(0);
        }
    }
    w.ue(input.num_ref_idx_l0_minus1);
    w.ue(input.num_ref_idx_l1_minus1);
    w.bit(input.weighted_pred);
    w.bits(input.weighted_bipred_idc, 2);
    w.se(input.pic_init_qp_minus26);
    w.se(input.pic_init_qs_minus26);
    w.se(input.chroma_qp_index_offset);
    w.bit(input.deblocking_filter_control);
    w.bit(false);
    w.bit(input.redundant_pic_cnt_present);
    if let Some(transform_8x8) = input.transform_8x8_mode {
        w.bit(transform_8x8);
        w.bit(false);
        w.se(input.second_chroma_qp_index_offset);
    }
    w.into_rbsp()
}

// ============================================================
// slice 构造
// ============================================================

#[derive(Debug, Clone)]
pub(crate) struct TestSlice {
    pub(crate) idr: bool,
    pub(crate) ref_idc: u8,
    pub(crate) slice_type: u32,
    pub(crate) first_mb: u32,
    pub(crate) frame_num: u32,
    pub(crate) idr_pic_id: u32,
    pub(crate) poc_lsb: u32,
    pub(crate) delta_poc: [i32; 2],
    pub(crate) num_ref_idx_override: Option<u32>,
    pub(crate) ref_list_modifications: Vec<(u32, u32)>,
    pub(crate) with_weight_table: bool,
    pub(crate) no_output_of_prior_pics: bool,
    pub(crate) long_term_reference: bool,
    pub(crate) mmco: Vec<MmcoCommand>,
    pub(crate) slice_qp_delta: i32,
}

impl TestSlice {
    pub(crate) fn idr(idr_pic_id: u32) -> Self {
        Self {
            idr: true,
            ref_idc: 3,
            slice_type: 7,
            first_mb: 0,
            frame_num: 0,
            idr_pic_id,
            poc_lsb: 0,
            delta_poc: [0; 2],
            num_ref_idx_override: None,
            ref_list_modifications: Vec::new(),
            with_weight_table: false,
            no_output_of_prior_pics: false,
            long_term_reference: false,
            mmco: Vec::new(),
            slice_qp_delta: 0,
        }
    }

    pub(crate) fn p(frame_num: u32) -> Self {
        Self {
            idr: false,
            ref_idc: 2,
            slice_type: 5,
            frame_num,
            ..Self::idr(0)
        }
    }

    pub(crate) fn b(frame_num: u32) -> Self {
        Self {
            idr: false,
            ref_idc: 0,
            slice_type: 6,
            frame_num,
            ..Self::idr(0)
        }
    }

    pub(crate) fn with_poc_lsb(mut self, poc_lsb: u32) -> Self {
        self.poc_lsb = poc_lsb;
        self
    }
}

pub(crate) fn build_slice_rbsp(slice: &TestSlice, sps: &TestSps, pps: &TestPps) -> Vec<u8> {
    let kind = slice.slice_type % 5;
    let is_b = kind == 1;
    let is_intra = kind == 2 || kind == 4;

    let mut w = BitWriter::new();
    w.ue(slice.first_mb);
    w.ue(slice.slice_type);
    w.ue(pps.pps_id);
    w.bits(slice.frame_num, sps.log2_max_frame_num_minus4 + 4);
    if !sps.frame_mbs_only {
        w.bit(false);
    }
    if slice.idr {
        w.ue(slice.idr_pic_id);
    }
    match sps.poc_type {
        0 => {
            w.bits(slice.poc_lsb, sps.log2_max_poc_lsb_minus4 + 4);
            if pps.bottom_field_pic_order_present {
                w.se(0);
            }
        }
        1 if !sps.delta_pic_order_always_zero => {
            w.se(slice.delta_poc[0]);
            if pps.bottom_field_pic_order_present {
                w.se(slice.delta_poc[1]);
            }
        }
        _ => {}
    }
    if pps.redundant_pic_cnt_present {
        w.ue(0);
    }
    if is_b {
        w.bit(true);
    }

    let mut num_l0 = pps.num_ref_idx_l0_minus1 + 1;
    let mut num_l1 = pps.num_ref_idx_l1_minus1 + 1;
    if !is_intra {
        match slice.num_ref_idx_override {
            Some(count) => {
                w.bit(true);
                w.ue(count - 1);
                num_l0 = count;
                if is_b {
                    w.ue(count - 1);
                    num_l1 = count;
                }
            }
            None => w.bit(false),
        }
        if slice.ref_list_modifications.is_empty() {
            w.bit(false);
        } else {
            w.bit(true);
            for &(idc, value) in &slice.ref_list_modifications {
                w.ue(idc);
                w.ue(value);
            }
            w.ue(3);
        }
        if is_b {
            w.bit(false);
        }
    }

    if slice.with_weight_table {
        w.ue(0);
        w.ue(0);
        let lists = if is_b { num_l0 + num_l1 } else { num_l0 };
        for _ in 0..lists {
            w.bit(false);
            w.bit(false);
        }
    }

    if slice.ref_idc != 0 {
        if slice.idr {
            w.bit(slice.no_output_of_prior_pics);
            w.bit(slice.long_term_reference);
        } else if slice.mmco.is_empty() {
            w.bit(false);
        } else {
            w.bit(true);
            for cmd in &slice.mmco {
                w.ue(cmd.operation);
                match cmd.operation {
                    1 => w.ue(cmd.difference_of_pic_nums_minus1),
                    2 => w.ue(cmd.long_term_pic_num),
                    3 => {
                        w.ue(cmd.difference_of_pic_nums_minus1);
                        w.ue(cmd.long_term_frame_idx);
                    }
                    4 => w.ue(cmd.max_long_term_frame_idx_plus1),
                    6 => w.ue(cmd.long_term_frame_idx),
                    _ => {}
                }
            }
            w.ue(0);
        }
    }

    if pps.entropy_coding_mode && !is_intra {
        w.ue(0);
    }
    w.se(slice.slice_qp_delta);
    if pps.deblocking_filter_control {
        w.ue(1);
    }
    // 伪造的 slice_data
    w.bits(0xA5, 8);
    w.into_rbsp()
}

/// 组装带 4 字节起始码的 NAL
pub(crate) fn annex_b_nal(nal_type: u8, ref_idc: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01, (ref_idc << 5) | nal_type];
    out.extend(add_emulation_prevention(rbsp));
    out
}

pub(crate) fn sps_nal(input: &TestSps) -> Vec<u8> {
    annex_b_nal(7, 3, &build_sps_rbsp(input))
}

pub(crate) fn pps_nal(input: &TestPps) -> Vec<u8> {
    annex_b_nal(8, 3, &build_pps_rbsp(input))
}

pub(crate) fn build_slice_nal(slice: &TestSlice, sps: &TestSps, pps: &TestPps) -> Vec<u8> {
    let nal_type = if slice.idr { 5 } else { 1 };
    annex_b_nal(nal_type, slice.ref_idc, &build_slice_rbsp(slice, sps, pps))
}

pub(crate) fn parameter_sets(sps: &TestSps, pps: &TestPps) -> ParameterSets {
    let mut sets = ParameterSets::new();
    sets.insert_sps(parse_sps(&build_sps_rbsp(sps)).expect("测试 SPS 解析失败"));
    let parsed = parse_pps(&build_pps_rbsp(pps), &sets).expect("测试 PPS 解析失败");
    sets.insert_pps(parsed);
    sets
}

/// 直接由构造参数得到 SPS 与 slice header
pub(crate) fn parse_test_header(
    slice: &TestSlice,
    sps_input: &TestSps,
    pps_input: &TestPps,
) -> (Sps, SliceHeader) {
    let sets = parameter_sets(sps_input, pps_input);
    let (sps, pps) = sets.resolve(pps_input.pps_id).expect("测试参数集缺失");
    let nal_type = if slice.idr {
        NalUnitType::SliceIdr
    } else {
        NalUnitType::Slice
    };
    let rbsp = build_slice_rbsp(slice, sps_input, pps_input);
    let header = parse_slice_header_with(&rbsp, nal_type, slice.ref_idc, sps, pps)
        .expect("测试 slice header 解析失败");
    (sps.clone(), header)
}

// ============================================================
// 模拟后端
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackendCall {
    QueryCapabilities,
    CreateSession,
    CreatePicture(usize),
    DestroyPicture(u32),
    UpdateParameters,
    DestroyParameters,
    DestroySession,
    WaitIdle,
    Upload(usize),
    Submit {
        target: usize,
        references: Vec<usize>,
        poc: i32,
    },
}

/// 记录调用的后端, 图像资源是递增的编号
#[derive(Debug)]
pub(crate) struct MockBackend {
    pub(crate) calls: Vec<BackendCall>,
    pub(crate) max_dpb_slots: u32,
    pub(crate) fail_session: bool,
    pub(crate) fail_picture_at: Option<usize>,
    pub(crate) fail_parameters: bool,
    pub(crate) fail_submit: bool,
    pub(crate) live_pictures: usize,
    pub(crate) session_live: bool,
    /// 每次提交的 slice 偏移
    pub(crate) slice_offsets: Vec<Vec<u32>>,
    next_picture: u32,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            calls: Vec::new(),
            max_dpb_slots: 16,
            fail_session: false,
            fail_picture_at: None,
            fail_parameters: false,
            fail_submit: false,
            live_pictures: 0,
            session_live: false,
            slice_offsets: Vec::new(),
            next_picture: 0,
        }
    }

    pub(crate) fn submits(&self) -> Vec<(usize, Vec<usize>, i32)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Submit {
                    target,
                    references,
                    poc,
                } => Some((*target, references.clone(), *poc)),
                _ => None,
            })
            .collect()
    }
}

impl DecodeBackend for MockBackend {
    type Picture = u32;

    fn query_capabilities(&mut self, _desc: &SessionDescriptor) -> MirraResult<SessionCaps> {
        self.calls.push(BackendCall::QueryCapabilities);
        Ok(SessionCaps {
            max_dpb_slots: self.max_dpb_slots,
            max_active_references: self.max_dpb_slots,
            max_coded_width: 4096,
            max_coded_height: 4096,
            bitstream_alignment: 256,
        })
    }

    fn create_session(&mut self, _desc: &SessionDescriptor) -> MirraResult<()> {
        self.calls.push(BackendCall::CreateSession);
        if self.fail_session {
            return Err(MirraError::Gpu("模拟会话创建失败".into()));
        }
        self.session_live = true;
        Ok(())
    }

    fn create_picture(&mut self, _desc: &SessionDescriptor, index: usize) -> MirraResult<u32> {
        self.calls.push(BackendCall::CreatePicture(index));
        if self.fail_picture_at == Some(index) {
            return Err(MirraError::Gpu("模拟图像分配失败".into()));
        }
        self.live_pictures += 1;
        self.next_picture += 1;
        Ok(self.next_picture)
    }

    fn destroy_picture(&mut self, picture: u32) {
        self.calls.push(BackendCall::DestroyPicture(picture));
        self.live_pictures -= 1;
    }

    fn update_parameters(&mut self, sets: &ParameterSets) -> MirraResult<()> {
        self.calls.push(BackendCall::UpdateParameters);
        if self.fail_parameters || sets.active_pps().is_none() {
            return Err(MirraError::MissingParameterSet("模拟参数构建失败".into()));
        }
        Ok(())
    }

    fn destroy_parameters(&mut self) {
        self.calls.push(BackendCall::DestroyParameters);
    }

    fn destroy_session(&mut self) {
        self.calls.push(BackendCall::DestroySession);
        self.session_live = false;
    }

    fn wait_idle(&mut self) {
        self.calls.push(BackendCall::WaitIdle);
    }

    fn upload_bitstream(&mut self, data: &[u8]) -> MirraResult<BitstreamSlot> {
        self.calls.push(BackendCall::Upload(data.len()));
        Ok(BitstreamSlot {
            ring_index: 0,
            size: (data.len() as u64).next_multiple_of(256),
        })
    }

    fn submit(&mut self, submission: &DecodeSubmission<'_, u32>) -> MirraResult<()> {
        self.slice_offsets.push(submission.slice_offsets.to_vec());
        self.calls.push(BackendCall::Submit {
            target: submission.target.slot_index,
            references: submission.references.iter().map(|r| r.slot_index).collect(),
            poc: submission.poc,
        });
        if self.fail_submit {
            return Err(MirraError::Gpu("模拟队列提交失败".into()));
        }
        Ok(())
    }
}
