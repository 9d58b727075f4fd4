//! 图像顺序计数 (POC) 推导, 支持 pic_order_cnt_type 0/1/2.
//!
//! 状态随 slice 逐步推进, 每个解码器实例持有独立的 [`PocCalculator`].

use super::slice::SliceHeader;
use super::sps::Sps;

/// POC 推导器
#[derive(Debug, Clone, Default)]
pub struct PocCalculator {
    prev_poc_msb: i64,
    prev_poc_lsb: i64,
    prev_frame_num_offset: i64,
    prev_frame_num: u32,
}

impl PocCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 上一参考帧的 POC MSB
    pub fn prev_poc_msb(&self) -> i32 {
        self.prev_poc_msb as i32
    }

    /// 上一参考帧的 POC LSB
    pub fn prev_poc_lsb(&self) -> i32 {
        self.prev_poc_lsb as i32
    }

    /// 重置全部延续状态
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 当前图像携带 MMCO 5 时, 解码完成后调用
    ///
    /// MMCO 5 之后的图像被视为 frame_num=0, POC=0 的参考帧.
    pub fn on_mmco5(&mut self) {
        self.reset();
    }

    /// 计算当前 slice 的 POC (帧 POC, 即顶场与底场的较小值)
    pub fn compute(&mut self, sps: &Sps, header: &SliceHeader) -> i32 {
        if header.is_idr() {
            self.reset();
        }
        let poc = match sps.poc_type {
            0 => self.compute_type0(sps, header),
            1 => self.compute_type1(sps, header),
            2 => self.compute_type2(sps, header),
            _ => i64::from(header.frame_num),
        };
        poc.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }

    fn compute_type0(&mut self, sps: &Sps, header: &SliceHeader) -> i64 {
        let max_lsb = i64::from(sps.max_poc_lsb());
        let lsb = i64::from(header.pic_order_cnt_lsb);
        let prev_lsb = self.prev_poc_lsb;

        let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
            self.prev_poc_msb + max_lsb
        } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
            self.prev_poc_msb - max_lsb
        } else {
            self.prev_poc_msb
        };

        let top = msb + lsb;
        let bottom = top + i64::from(header.delta_pic_order_cnt_bottom);

        if header.is_reference() {
            self.prev_poc_msb = msb;
            self.prev_poc_lsb = lsb;
        }
        top.min(bottom)
    }

    fn frame_num_offset(&self, sps: &Sps, header: &SliceHeader) -> i64 {
        if header.is_idr() {
            0
        } else if self.prev_frame_num > header.frame_num {
            self.prev_frame_num_offset + i64::from(sps.max_frame_num())
        } else {
            self.prev_frame_num_offset
        }
    }

    fn compute_type1(&mut self, sps: &Sps, header: &SliceHeader) -> i64 {
        let frame_num_offset = self.frame_num_offset(sps, header);
        let cycle_len = sps.offset_for_ref_frame.len() as i64;

        let mut abs_frame_num = if cycle_len != 0 {
            frame_num_offset + i64::from(header.frame_num)
        } else {
            0
        };
        if !header.is_reference() && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected = 0i64;
        if abs_frame_num > 0 {
            let delta_per_cycle: i64 = sps.offset_for_ref_frame.iter().map(|&v| i64::from(v)).sum();
            let cycle_cnt = (abs_frame_num - 1) / cycle_len;
            let in_cycle = ((abs_frame_num - 1) % cycle_len) as usize;
            expected = cycle_cnt * delta_per_cycle;
            expected += sps.offset_for_ref_frame[..=in_cycle]
                .iter()
                .map(|&v| i64::from(v))
                .sum::<i64>();
        }
        if !header.is_reference() {
            expected += i64::from(sps.offset_for_non_ref_pic);
        }

        let top = expected + i64::from(header.delta_pic_order_cnt[0]);
        let bottom = top
            + i64::from(sps.offset_for_top_to_bottom_field)
            + i64::from(header.delta_pic_order_cnt[1]);

        self.prev_frame_num_offset = frame_num_offset;
        self.prev_frame_num = header.frame_num;
        top.min(bottom)
    }

    fn compute_type2(&mut self, sps: &Sps, header: &SliceHeader) -> i64 {
        let frame_num_offset = self.frame_num_offset(sps, header);
        let poc = if header.is_idr() {
            0
        } else if !header.is_reference() {
            2 * (frame_num_offset + i64::from(header.frame_num)) - 1
        } else {
            2 * (frame_num_offset + i64::from(header.frame_num))
        };

        self.prev_frame_num_offset = frame_num_offset;
        self.prev_frame_num = header.frame_num;
        poc
    }
}
