//! slice 解码状态机.
//!
//! 同一图像的 slice 先拼接到一个码流缓冲中, 图像结束时依次经过: 获取帧资源并上传码流,
//! 选择输出槽位, 构建参考列表, 提交解码, 更新 DPB 与参考标记, 进入重排缓冲, 输出就绪帧.
//!
//! 图像在以下时机结束: 下一幅图像的首个 slice, 非 VCL 的参数集或分隔符 NAL,
//! 以及每次 `decode` / `decode_access_unit` 调用返回之前.

use std::fmt;

use log::{debug, warn};
use mirra_core::{MirraError, MirraResult};

use super::backend::{DecodeBackend, DecodeSubmission, ReferenceSlot, SessionDescriptor};
use super::dpb::{AcquireKind, DpbManager};
use super::marking::ReferenceMarker;
use super::nal::{NalUnit, NalUnitType, split_annex_b};
use super::params::ParameterSets;
use super::poc::PocCalculator;
use super::pps::{Pps, parse_pps};
use super::reorder::{PendingFrame, ReorderBuffer};
use super::session::{DecodeSession, close_session, open_session};
use super::slice::{SliceHeader, parse_slice_header};
use super::sps::{Sps, parse_sps};

/// 状态机配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDecoderConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub dpb_slots: u32,
    pub reorder_capacity: usize,
}

impl Default for SliceDecoderConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1088,
            dpb_slots: 8,
            reorder_capacity: 8,
        }
    }
}

/// 按显示顺序输出的图像, `slot_index` 指向 DPB 中的解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPicture {
    pub slot_index: usize,
    pub poc: i32,
    pub pts: i64,
    pub width: u32,
    pub height: u32,
}

/// 解码统计, 供外部健康监控
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub nals_parsed: u64,
    pub parse_errors: u64,
    pub frames_submitted: u64,
    pub submit_errors: u64,
    pub frames_emitted: u64,
    pub frames_dropped: u64,
}

/// 正在收集 slice 的图像
#[derive(Debug)]
struct PictureAssembly {
    /// 首个 slice 的 header
    header: SliceHeader,
    sps: Sps,
    pps: Pps,
    pts: i64,
    /// 依次拼接的 slice, 每个都以起始码开头
    data: Vec<u8>,
    slice_offsets: Vec<u32>,
    intra_only: bool,
}

impl PictureAssembly {
    fn new(header: SliceHeader, sps: Sps, pps: Pps, pts: i64) -> Self {
        Self {
            intra_only: true,
            header,
            sps,
            pps,
            pts,
            data: Vec::new(),
            slice_offsets: Vec::new(),
        }
    }

    fn push_slice(&mut self, nal: &NalUnit<'_>, header: &SliceHeader) {
        self.slice_offsets.push(self.data.len() as u32);
        if nal.header_offset() == 0 {
            self.data.extend_from_slice(&[0x00, 0x00, 0x01]);
        }
        self.data.extend_from_slice(nal.with_start_code());
        self.intra_only &= header.slice_type.is_intra();
    }

    /// `next` 是否是同一图像的后续 slice
    ///
    /// 比较 H.264 7.4.1.2.4 中区分新图像的字段.
    fn continues_with(&self, next: &SliceHeader) -> bool {
        let first = &self.header;
        next.first_mb_in_slice != 0
            && next.pps_id == first.pps_id
            && next.frame_num == first.frame_num
            && next.field_pic == first.field_pic
            && next.bottom_field == first.bottom_field
            && (next.nal_ref_idc == 0) == (first.nal_ref_idc == 0)
            && next.is_idr() == first.is_idr()
            && (!next.is_idr() || next.idr_pic_id == first.idr_pic_id)
            && next.pic_order_cnt_lsb == first.pic_order_cnt_lsb
            && next.delta_pic_order_cnt_bottom == first.delta_pic_order_cnt_bottom
            && next.delta_pic_order_cnt == first.delta_pic_order_cnt
    }
}

/// H.264 slice 解码状态机, 通过 [`DecodeBackend`] 驱动硬件
pub struct SliceDecoder<B: DecodeBackend> {
    backend: B,
    config: SliceDecoderConfig,
    sets: ParameterSets,
    session: Option<DecodeSession<B::Picture>>,
    poc: PocCalculator,
    marker: ReferenceMarker,
    reorder: ReorderBuffer,
    stats: DecoderStats,
    output_size: (u32, u32),
    picture: Option<PictureAssembly>,
}

impl<B: DecodeBackend> SliceDecoder<B> {
    pub fn new(backend: B, config: SliceDecoderConfig) -> Self {
        Self {
            backend,
            config,
            sets: ParameterSets::new(),
            session: None,
            poc: PocCalculator::new(),
            marker: ReferenceMarker::new(),
            reorder: ReorderBuffer::new(config.reorder_capacity),
            stats: DecoderStats::default(),
            output_size: (0, 0),
            picture: None,
        }
    }

    pub fn config(&self) -> &SliceDecoderConfig {
        &self.config
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.sets
    }

    pub fn poc_state(&self) -> &PocCalculator {
        &self.poc
    }

    pub fn reorder_buffer(&self) -> &ReorderBuffer {
        &self.reorder
    }

    /// 当前会话的 DPB
    pub fn dpb(&self) -> Option<&DpbManager<B::Picture>> {
        self.session.as_ref().map(|s| &s.dpb)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// 解码一段 Annex B 数据 (可包含多个 NAL)
    ///
    /// 单个 NAL 的解析或提交失败只记入统计并跳过, 只有会话创建失败会返回错误.
    /// 返回前提交其中收集到的图像.
    pub fn decode(&mut self, data: &[u8], pts: i64) -> MirraResult<Vec<OutputPicture>> {
        self.decode_access_unit(&[data], pts)
    }

    /// 解码同一访问单元的多个 NAL 缓冲, 分散在各缓冲中的 slice 合并为一次提交
    pub fn decode_access_unit(
        &mut self,
        buffers: &[&[u8]],
        pts: i64,
    ) -> MirraResult<Vec<OutputPicture>> {
        let mut outputs = Vec::new();
        for buffer in buffers {
            for nal in split_annex_b(buffer) {
                self.decode_nal_tolerant(&nal, pts, &mut outputs)?;
            }
        }
        let finished = self.end_picture();
        self.absorb(finished, "图像", &mut outputs)?;
        Ok(outputs)
    }

    fn decode_nal_tolerant(
        &mut self,
        nal: &NalUnit<'_>,
        pts: i64,
        outputs: &mut Vec<OutputPicture>,
    ) -> MirraResult<()> {
        if starts_new_picture(nal.nal_type) {
            let finished = self.end_picture();
            self.absorb(finished, "图像", outputs)?;
        }
        let result = self.decode_nal(nal, pts);
        self.absorb(result, nal.nal_type, outputs)
    }

    /// 收下成功的输出, 可恢复的错误只记入统计
    fn absorb(
        &mut self,
        result: MirraResult<Vec<OutputPicture>>,
        what: impl fmt::Display,
        outputs: &mut Vec<OutputPicture>,
    ) -> MirraResult<()> {
        match result {
            Ok(frames) => {
                outputs.extend(frames);
                Ok(())
            }
            Err(err) if err.is_parse_error() => {
                self.stats.parse_errors += 1;
                warn!("H.264: 跳过 {} NAL: {}", what, err);
                Ok(())
            }
            Err(MirraError::Submission(msg)) => {
                warn!("H.264: 丢弃{}: {}", what, msg);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 解码单个 NAL, slice 只进入当前图像
    fn decode_nal(&mut self, nal: &NalUnit<'_>, pts: i64) -> MirraResult<Vec<OutputPicture>> {
        self.stats.nals_parsed += 1;
        match nal.nal_type {
            NalUnitType::Sps => {
                self.handle_sps(nal)?;
                Ok(Vec::new())
            }
            NalUnitType::Pps => {
                self.handle_pps(nal)?;
                Ok(Vec::new())
            }
            NalUnitType::Slice | NalUnitType::SliceIdr => self.queue_slice(nal, pts),
            NalUnitType::SliceDpa | NalUnitType::SliceDpb | NalUnitType::SliceDpc => Err(
                MirraError::Unsupported("H.264: 不支持数据分区 slice".into()),
            ),
            other => {
                debug!("H.264: 忽略 {} NAL", other);
                Ok(Vec::new())
            }
        }
    }

    fn handle_sps(&mut self, nal: &NalUnit<'_>) -> MirraResult<()> {
        let sps = parse_sps(&nal.rbsp())?;
        let sps_id = sps.sps_id;
        self.sets.insert_sps(sps);
        let Some(sps) = self.sets.sps(sps_id) else {
            return Ok(());
        };

        let accepts = self
            .session
            .as_ref()
            .map(|session| session.descriptor.accepts(sps));
        match accepts {
            Some(true) => Ok(()),
            Some(false) => {
                let descriptor = self.descriptor_for(sps_id)?;
                self.teardown_session();
                self.create_session(descriptor)
            }
            None => {
                let descriptor = self.descriptor_for(sps_id)?;
                self.create_session(descriptor)
            }
        }
    }

    fn descriptor_for(&self, sps_id: u32) -> MirraResult<SessionDescriptor> {
        let sps = self
            .sets
            .sps(sps_id)
            .ok_or_else(|| MirraError::MissingParameterSet(format!("SPS id={}", sps_id)))?;
        Ok(SessionDescriptor::from_sps(
            sps,
            self.config.max_width,
            self.config.max_height,
            self.config.dpb_slots,
        ))
    }

    fn create_session(&mut self, descriptor: SessionDescriptor) -> MirraResult<()> {
        let mut session = open_session(&mut self.backend, descriptor).map_err(|err| match err {
            MirraError::Gpu(_) => err,
            other => MirraError::Gpu(format!("创建解码会话失败: {}", other)),
        })?;
        if self.sets.active_pps().is_some() {
            session.has_parameters = self.rebuild_parameters();
        }
        self.session = Some(session);
        Ok(())
    }

    fn rebuild_parameters(&mut self) -> bool {
        match self.backend.update_parameters(&self.sets) {
            Ok(()) => true,
            Err(err) => {
                warn!("H.264: 重建会话参数失败, 继续使用旧参数: {}", err);
                false
            }
        }
    }

    fn handle_pps(&mut self, nal: &NalUnit<'_>) -> MirraResult<()> {
        let pps = parse_pps(&nal.rbsp(), &self.sets)?;
        self.sets.insert_pps(pps);
        if self.session.is_none() {
            debug!("H.264: 会话尚未创建, 暂存 PPS");
            return Ok(());
        }
        let rebuilt = self.rebuild_parameters();
        if let Some(session) = self.session.as_mut() {
            session.has_parameters |= rebuilt;
        }
        Ok(())
    }

    /// 把 slice 加入当前图像; 属于新图像时先提交上一幅
    fn queue_slice(&mut self, nal: &NalUnit<'_>, pts: i64) -> MirraResult<Vec<OutputPicture>> {
        let header = parse_slice_header(nal, &self.sets)?;

        if let Some(picture) = self.picture.as_mut() {
            if picture.continues_with(&header) {
                picture.push_slice(nal, &header);
                return Ok(Vec::new());
            }
        }
        if header.first_mb_in_slice != 0 {
            return Err(MirraError::InvalidData(format!(
                "slice 所属图像的首个 slice 缺失, first_mb_in_slice={}",
                header.first_mb_in_slice
            )));
        }

        let (sps, pps) = self.sets.resolve(header.pps_id)?;
        let (sps, pps) = (sps.clone(), pps.clone());
        let mut picture = PictureAssembly::new(header.clone(), sps, pps, pts);
        picture.push_slice(nal, &header);
        match self.picture.replace(picture) {
            Some(previous) => self.submit_picture(previous),
            None => Ok(Vec::new()),
        }
    }

    /// 提交当前正在收集的图像
    fn end_picture(&mut self) -> MirraResult<Vec<OutputPicture>> {
        match self.picture.take() {
            Some(picture) => self.submit_picture(picture),
            None => Ok(Vec::new()),
        }
    }

    fn submit_picture(&mut self, picture: PictureAssembly) -> MirraResult<Vec<OutputPicture>> {
        let PictureAssembly {
            header,
            sps,
            pps,
            pts,
            data,
            slice_offsets,
            intra_only,
        } = picture;
        if slice_offsets.len() > 1 {
            debug!(
                "H.264: 图像 frame_num={} 含 {} 个 slice",
                header.frame_num,
                slice_offsets.len()
            );
        }

        let Some(session) = self.session.as_mut() else {
            return Err(MirraError::MissingParameterSet("解码会话尚未创建".into()));
        };
        if !session.descriptor.accepts(&sps) {
            return Err(MirraError::MissingParameterSet(format!(
                "slice 引用的 SPS id={} 与当前会话不匹配",
                sps.sps_id
            )));
        }
        if !session.has_parameters {
            session.has_parameters = match self.backend.update_parameters(&self.sets) {
                Ok(()) => true,
                Err(err) => {
                    return Err(MirraError::MissingParameterSet(format!(
                        "会话参数不可用: {}",
                        err
                    )));
                }
            };
        }

        // 帧资源与码流上传
        let bitstream = match self.backend.upload_bitstream(&data) {
            Ok(slot) => slot,
            Err(err) => {
                self.stats.submit_errors += 1;
                return Err(MirraError::Submission(format!("码流上传失败: {}", err)));
            }
        };

        // 输出槽位与 POC 在提交成功后才生效, 失败的图像不改变解码状态
        let (slot_idx, kind) = session.dpb.select();
        let mut poc_state = self.poc.clone();
        let poc = poc_state.compute(&sps, &header);

        // 参考列表 (IDR 不引用任何图像)
        let reference_indices = if header.is_idr() {
            Vec::new()
        } else {
            session.dpb.reference_indices_except(slot_idx)
        };

        let submit_result = {
            let dpb = &session.dpb;
            let references = reference_indices
                .iter()
                .filter_map(|&idx| reference_slot(dpb, idx))
                .collect();
            match dpb.slot(slot_idx) {
                Some(target) => {
                    let submission = DecodeSubmission {
                        sps: &sps,
                        pps: &pps,
                        header: &header,
                        bitstream,
                        slice_offsets: &slice_offsets,
                        intra_only,
                        poc,
                        target: ReferenceSlot {
                            slot_index: slot_idx,
                            picture: target.resource(),
                            frame_num: header.frame_num,
                            poc,
                            is_long_term: false,
                            long_term_frame_idx: 0,
                        },
                        references,
                    };
                    self.backend.submit(&submission)
                }
                None => Err(MirraError::Internal(format!("DPB 槽位越界, idx={}", slot_idx))),
            }
        };
        if let Err(err) = submit_result {
            self.stats.submit_errors += 1;
            return Err(MirraError::Submission(format!("解码提交失败: {}", err)));
        }
        self.stats.frames_submitted += 1;
        self.poc = poc_state;
        session.dpb.claim(slot_idx);
        if kind != AcquireKind::Free && self.reorder.remove_slot(slot_idx).is_some() {
            self.stats.frames_dropped += 1;
            debug!("H.264: 槽位 {} 被复用, 丢弃未输出的图像", slot_idx);
        }

        // 更新槽位与参考标记
        if let Some(slot) = session.dpb.slot_mut(slot_idx) {
            slot.frame_num = header.frame_num;
            slot.poc = poc;
            slot.pts = pts;
            slot.is_reference = header.is_reference();
        }
        let outcome = self.marker.apply(&mut session.dpb, slot_idx, &sps, &header);

        let mut ready = Vec::new();
        let mut output_poc = poc;
        if header.is_idr() {
            if header.dec_ref_pic_marking.no_output_of_prior_pics {
                let discarded = self.reorder.discard();
                self.stats.frames_dropped += discarded.len() as u64;
            } else {
                ready.extend(self.reorder.drain());
            }
            self.reorder.reset_sequence();
        } else if outcome.mmco5 {
            ready.extend(self.reorder.drain());
            self.reorder.reset_sequence();
            self.poc.on_mmco5();
            output_poc = 0;
            if let Some(slot) = session.dpb.slot_mut(slot_idx) {
                slot.frame_num = 0;
                slot.poc = 0;
            }
        }

        self.reorder.push(PendingFrame {
            slot_index: slot_idx,
            poc: output_poc,
            pts,
        });
        ready.extend(self.reorder.pop_ready(header.is_idr()));

        // 既不是参考帧也不在重排缓冲中的槽位归还到空闲池
        for idx in 0..session.dpb.len() {
            let releasable = session
                .dpb
                .slot(idx)
                .is_some_and(|s| s.in_use && !s.is_reference && !self.reorder.contains_slot(idx));
            if releasable {
                session.dpb.release(idx);
            }
        }

        self.output_size = (sps.width(), sps.height());
        Ok(self.to_outputs(ready))
    }

    fn to_outputs(&mut self, frames: Vec<PendingFrame>) -> Vec<OutputPicture> {
        self.stats.frames_emitted += frames.len() as u64;
        let (width, height) = self.output_size;
        frames
            .into_iter()
            .map(|f| OutputPicture {
                slot_index: f.slot_index,
                poc: f.poc,
                pts: f.pts,
                width,
                height,
            })
            .collect()
    }

    /// 提交未结束的图像, 然后按 POC 顺序输出全部缓冲中的图像
    pub fn flush(&mut self) -> Vec<OutputPicture> {
        let mut outputs = Vec::new();
        let finished = self.end_picture();
        if let Err(err) = self.absorb(finished, "图像", &mut outputs) {
            warn!("H.264: 刷新时提交图像失败: {}", err);
        }
        let frames = self.reorder.drain();
        if let Some(session) = self.session.as_mut() {
            for frame in &frames {
                let still_ref = session
                    .dpb
                    .slot(frame.slot_index)
                    .is_some_and(|s| s.is_reference);
                if !still_ref {
                    session.dpb.release(frame.slot_index);
                }
            }
        }
        outputs.extend(self.to_outputs(frames));
        outputs
    }

    fn teardown_session(&mut self) {
        self.picture = None;
        let dropped = self.reorder.discard();
        self.stats.frames_dropped += dropped.len() as u64;
        self.reorder.clear();
        self.poc.reset();
        self.marker.reset();
        if let Some(session) = self.session.take() {
            close_session(&mut self.backend, session);
        }
    }

    /// 销毁会话并清空全部状态
    pub fn destroy(&mut self) {
        self.teardown_session();
        self.sets.clear();
        self.output_size = (0, 0);
    }
}

/// 这些 NAL 出现时当前图像已经结束
fn starts_new_picture(nal_type: NalUnitType) -> bool {
    !matches!(
        nal_type,
        NalUnitType::Slice
            | NalUnitType::SliceIdr
            | NalUnitType::SliceDpa
            | NalUnitType::SliceDpb
            | NalUnitType::SliceDpc
            | NalUnitType::FillerData
    )
}

fn reference_slot<P>(dpb: &DpbManager<P>, idx: usize) -> Option<ReferenceSlot<'_, P>> {
    let slot = dpb.slot(idx)?;
    Some(ReferenceSlot {
        slot_index: idx,
        picture: slot.resource(),
        frame_num: slot.frame_num,
        poc: slot.poc,
        is_long_term: slot.is_long_term,
        long_term_frame_idx: slot.long_term_frame_idx,
    })
}
