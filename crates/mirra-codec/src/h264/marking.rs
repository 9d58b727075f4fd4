//! 参考图像标记: IDR, 自适应标记 (MMCO 1-6) 与滑动窗口.

use log::debug;

use super::dpb::DpbManager;
use super::slice::{MmcoCommand, SliceHeader};
use super::sps::Sps;

/// 一次标记的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingOutcome {
    /// 当前图像包含 MMCO 5
    pub mmco5: bool,
    /// 被取消参考标记的槽位数量 (不含当前槽位)
    pub unmarked: usize,
}

/// 参考标记状态
#[derive(Debug, Clone, Default)]
pub struct ReferenceMarker {
    /// MaxLongTermFrameIdx, None 表示 "no long-term frame indices"
    max_long_term_frame_idx: Option<u32>,
}

impl ReferenceMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_long_term_frame_idx(&self) -> Option<u32> {
        self.max_long_term_frame_idx
    }

    pub fn reset(&mut self) {
        self.max_long_term_frame_idx = None;
    }

    /// 对刚写入 `current` 槽位的图像执行参考标记
    ///
    /// 非参考图像只清除自身的参考标记.
    pub fn apply<P>(
        &mut self,
        dpb: &mut DpbManager<P>,
        current: usize,
        sps: &Sps,
        header: &SliceHeader,
    ) -> MarkingOutcome {
        let mut outcome = MarkingOutcome::default();
        if current >= dpb.len() {
            return outcome;
        }

        if !header.is_reference() {
            if let Some(slot) = dpb.slot_mut(current) {
                slot.unmark();
            }
            return outcome;
        }

        if header.is_idr() {
            outcome.unmarked = dpb.reference_indices_except(current).len();
            dpb.clear_references_except(current);
            let long_term = header.dec_ref_pic_marking.long_term_reference;
            if let Some(slot) = dpb.slot_mut(current) {
                slot.is_reference = true;
                slot.is_long_term = long_term;
                slot.long_term_frame_idx = 0;
            }
            self.max_long_term_frame_idx = if long_term { Some(0) } else { None };
            return outcome;
        }

        if let Some(slot) = dpb.slot_mut(current) {
            slot.is_reference = true;
            slot.is_long_term = false;
        }

        if header.dec_ref_pic_marking.adaptive {
            for cmd in &header.dec_ref_pic_marking.ops {
                let unmarked = self.apply_mmco(dpb, current, sps, header.frame_num, cmd);
                outcome.unmarked += unmarked;
                if cmd.operation == 5 {
                    outcome.mmco5 = true;
                }
            }
        } else {
            outcome.unmarked += sliding_window(dpb, current, sps, header.frame_num);
        }
        outcome
    }

    fn apply_mmco<P>(
        &mut self,
        dpb: &mut DpbManager<P>,
        current: usize,
        sps: &Sps,
        curr_frame_num: u32,
        cmd: &MmcoCommand,
    ) -> usize {
        let pic_num_x =
            i64::from(curr_frame_num) - i64::from(cmd.difference_of_pic_nums_minus1) - 1;
        match cmd.operation {
            1 => {
                let target = find_short_term(dpb, current, sps, curr_frame_num, pic_num_x);
                unmark_slots(dpb, target)
            }
            2 => {
                let target = find_long_term(dpb, current, cmd.long_term_pic_num);
                unmark_slots(dpb, target)
            }
            3 => {
                let mut unmarked = 0;
                let target = find_short_term(dpb, current, sps, curr_frame_num, pic_num_x);
                if let Some(idx) = target {
                    let holder = find_long_term(dpb, current, cmd.long_term_frame_idx)
                        .filter(|&holder| holder != idx);
                    unmarked += unmark_slots(dpb, holder);
                    if let Some(slot) = dpb.slot_mut(idx) {
                        slot.is_long_term = true;
                        slot.long_term_frame_idx = cmd.long_term_frame_idx;
                    }
                } else {
                    debug!("H.264: MMCO 3 目标短期参考帧不存在, picNumX={}", pic_num_x);
                }
                unmarked
            }
            4 => {
                let max_plus1 = cmd.max_long_term_frame_idx_plus1;
                let targets: Vec<usize> = dpb
                    .slots()
                    .iter()
                    .enumerate()
                    .filter(|(idx, s)| {
                        *idx != current && s.is_long_term_ref() && s.long_term_frame_idx >= max_plus1
                    })
                    .map(|(idx, _)| idx)
                    .collect();
                self.max_long_term_frame_idx = max_plus1.checked_sub(1);
                targets
                    .into_iter()
                    .map(|idx| unmark_slots(dpb, Some(idx)))
                    .sum()
            }
            5 => {
                let unmarked = dpb.reference_indices_except(current).len();
                dpb.clear_references_except(current);
                self.max_long_term_frame_idx = None;
                unmarked
            }
            6 => {
                let holder = find_long_term(dpb, current, cmd.long_term_frame_idx);
                let unmarked = unmark_slots(dpb, holder);
                if let Some(slot) = dpb.slot_mut(current) {
                    slot.is_reference = true;
                    slot.is_long_term = true;
                    slot.long_term_frame_idx = cmd.long_term_frame_idx;
                }
                unmarked
            }
            other => {
                debug!("H.264: 忽略未知 MMCO 操作, operation={}", other);
                0
            }
        }
    }
}

/// FrameNumWrap (帧编码时 PicNum 与之相同)
fn frame_num_wrap(frame_num: u32, curr_frame_num: u32, max_frame_num: u32) -> i64 {
    if frame_num > curr_frame_num {
        i64::from(frame_num) - i64::from(max_frame_num)
    } else {
        i64::from(frame_num)
    }
}

fn find_short_term<P>(
    dpb: &DpbManager<P>,
    current: usize,
    sps: &Sps,
    curr_frame_num: u32,
    pic_num: i64,
) -> Option<usize> {
    let max_frame_num = sps.max_frame_num();
    dpb.slots().iter().enumerate().find_map(|(idx, s)| {
        (idx != current
            && s.is_short_term_ref()
            && frame_num_wrap(s.frame_num, curr_frame_num, max_frame_num) == pic_num)
            .then_some(idx)
    })
}

fn find_long_term<P>(dpb: &DpbManager<P>, current: usize, long_term_idx: u32) -> Option<usize> {
    dpb.slots().iter().enumerate().find_map(|(idx, s)| {
        (idx != current && s.is_long_term_ref() && s.long_term_frame_idx == long_term_idx)
            .then_some(idx)
    })
}

fn unmark_slots<P>(dpb: &mut DpbManager<P>, target: Option<usize>) -> usize {
    match target.and_then(|idx| dpb.slot_mut(idx)) {
        Some(slot) => {
            slot.unmark();
            1
        }
        None => 0,
    }
}

/// 滑动窗口: 参考帧总数超过 max(max_num_ref_frames, 1) 时,
/// 逐个取消 FrameNumWrap 最小的短期参考帧
fn sliding_window<P>(dpb: &mut DpbManager<P>, current: usize, sps: &Sps, curr_frame_num: u32) -> usize {
    let limit = sps.max_num_ref_frames.max(1) as usize;
    let max_frame_num = sps.max_frame_num();
    let mut unmarked = 0;
    while dpb.reference_count() > limit {
        let oldest = dpb
            .slots()
            .iter()
            .enumerate()
            .filter(|(idx, s)| *idx != current && s.is_short_term_ref())
            .min_by_key(|(_, s)| frame_num_wrap(s.frame_num, curr_frame_num, max_frame_num))
            .map(|(idx, _)| idx);
        match oldest {
            Some(idx) => unmarked += unmark_slots(dpb, Some(idx)),
            None => break,
        }
    }
    unmarked
}
