//! 显示顺序重排缓冲.
//!
//! 已解码图像按 POC 排序保存, 满足条件时从头部按显示顺序输出.
//! 传输中可能丢帧, 因此输出条件带有间隙容忍: 只要缓冲中存在 POC 更大的图像就输出头部.

use log::debug;

/// 等待输出的图像
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFrame {
    pub slot_index: usize,
    pub poc: i32,
    pub pts: i64,
}

/// 重排缓冲
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    /// 按 POC 升序, 相同 POC 保持插入顺序
    frames: Vec<PendingFrame>,
    capacity: usize,
    last_emitted: Option<i32>,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Vec::with_capacity(capacity + 1),
            capacity,
            last_emitted: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 最近一次输出的 POC
    pub fn last_emitted(&self) -> Option<i32> {
        self.last_emitted
    }

    pub fn push(&mut self, frame: PendingFrame) {
        let pos = self.frames.partition_point(|f| f.poc <= frame.poc);
        self.frames.insert(pos, frame);
    }

    /// 输出所有满足条件的头部图像, `force` 为真时全部输出
    pub fn pop_ready(&mut self, force: bool) -> Vec<PendingFrame> {
        let mut ready = Vec::new();
        while let Some(head) = self.frames.first().copied() {
            if !(force || self.can_emit_head(head.poc)) {
                break;
            }
            self.frames.remove(0);
            self.last_emitted = Some(head.poc);
            ready.push(head);
        }
        ready
    }

    fn can_emit_head(&self, head_poc: i32) -> bool {
        let Some(last) = self.last_emitted else {
            return true;
        };
        if i64::from(head_poc) == i64::from(last) + 1 {
            return true;
        }
        if self.frames.len() >= self.capacity {
            debug!(
                "重排缓冲已满, 强制输出 poc={} (上次输出 {})",
                head_poc, last
            );
            return true;
        }
        // 存在 POC 更大的图像时认为前瞻足够
        self.frames.iter().any(|f| f.poc > head_poc)
    }

    /// 按 POC 顺序输出全部图像
    pub fn drain(&mut self) -> Vec<PendingFrame> {
        self.pop_ready(true)
    }

    /// 丢弃全部图像, 返回被丢弃的图像以便释放槽位
    pub fn discard(&mut self) -> Vec<PendingFrame> {
        std::mem::take(&mut self.frames)
    }

    /// POC 重新计数 (IDR / MMCO 5) 时调用
    pub fn reset_sequence(&mut self) {
        self.last_emitted = None;
    }

    /// 移除占用指定槽位的图像
    pub fn remove_slot(&mut self, slot_index: usize) -> Option<PendingFrame> {
        let pos = self.frames.iter().position(|f| f.slot_index == slot_index)?;
        Some(self.frames.remove(pos))
    }

    pub fn contains_slot(&self, slot_index: usize) -> bool {
        self.frames.iter().any(|f| f.slot_index == slot_index)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.last_emitted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(slot_index: usize, poc: i32) -> PendingFrame {
        PendingFrame {
            slot_index,
            poc,
            pts: i64::from(poc) * 10,
        }
    }

    fn pocs(frames: &[PendingFrame]) -> Vec<i32> {
        frames.iter().map(|f| f.poc).collect()
    }

    #[test]
    fn test_reorder_emits_in_poc_order() {
        let mut buf = ReorderBuffer::new(8);
        let mut out = Vec::new();
        for (slot, poc) in [0, 2, 1, 4, 3].into_iter().enumerate() {
            buf.push(frame(slot, poc));
            out.extend(buf.pop_ready(false));
        }
        out.extend(buf.drain());
        assert_eq!(pocs(&out), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reorder_waits_for_missing_poc() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(frame(0, 0));
        assert_eq!(pocs(&buf.pop_ready(false)), vec![0]);
        buf.push(frame(1, 4));
        assert!(buf.pop_ready(false).is_empty(), "单帧且存在间隙时应等待");
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_reorder_gap_tolerance() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(frame(0, 0));
        buf.pop_ready(false);
        buf.push(frame(1, 4));
        buf.push(frame(2, 8));
        // 4 之后存在更大的 POC, 头部按间隙容忍输出
        assert_eq!(pocs(&buf.pop_ready(false)), vec![4]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_reorder_capacity_forces_output() {
        let mut buf = ReorderBuffer::new(2);
        buf.push(frame(0, 0));
        buf.pop_ready(false);
        buf.push(frame(1, 10));
        assert!(buf.pop_ready(false).is_empty());
        buf.push(frame(2, 10));
        let out = buf.pop_ready(false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].slot_index, 1, "相同 POC 按插入顺序输出");
        assert!(buf.len() < buf.capacity());
    }

    #[test]
    fn test_reorder_force_flush_and_discard() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(frame(0, 0));
        buf.pop_ready(false);
        buf.push(frame(1, 6));
        buf.push(frame(2, 3));
        assert_eq!(pocs(&buf.pop_ready(true)), vec![3, 6]);

        buf.push(frame(3, 20));
        buf.push(frame(4, 30));
        buf.clear();
        buf.push(frame(5, 40));
        let discarded = buf.discard();
        assert_eq!(discarded.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reorder_remove_slot() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(frame(3, 5));
        buf.push(frame(4, 7));
        assert!(buf.contains_slot(3));
        assert_eq!(buf.remove_slot(3).map(|f| f.poc), Some(5));
        assert!(!buf.contains_slot(3));
        assert!(buf.remove_slot(9).is_none());
    }
}
