//! 解码图像缓冲 (DPB) 槽位池.
//!
//! 槽位数量在初始化时固定, 运行期间只复用不释放. 每个槽位持有后端资源
//! (例如 GPU 图像) 以及参考帧元数据.

use log::debug;
use mirra_core::{MirraError, MirraResult};

/// 单个 DPB 槽位
#[derive(Debug)]
pub struct DpbSlot<P> {
    resource: P,
    pub frame_num: u32,
    pub poc: i32,
    pub pts: i64,
    pub is_reference: bool,
    pub is_long_term: bool,
    pub long_term_frame_idx: u32,
    pub in_use: bool,
}

impl<P> DpbSlot<P> {
    fn new(resource: P) -> Self {
        Self {
            resource,
            frame_num: 0,
            poc: 0,
            pts: 0,
            is_reference: false,
            is_long_term: false,
            long_term_frame_idx: 0,
            in_use: false,
        }
    }

    /// 后端资源
    pub fn resource(&self) -> &P {
        &self.resource
    }

    /// 是否为短期参考帧
    pub fn is_short_term_ref(&self) -> bool {
        self.is_reference && !self.is_long_term
    }

    /// 是否为长期参考帧
    pub fn is_long_term_ref(&self) -> bool {
        self.is_reference && self.is_long_term
    }

    /// 取消参考标记
    pub fn unmark(&mut self) {
        self.is_reference = false;
        self.is_long_term = false;
        self.long_term_frame_idx = 0;
    }

    fn reset(&mut self) {
        self.unmark();
        self.frame_num = 0;
        self.poc = 0;
        self.pts = 0;
        self.in_use = true;
    }
}

/// 获取槽位的途径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    /// 空闲槽位
    Free,
    /// 复用了非参考槽位
    NonReference,
    /// 强制淘汰了 POC 最小的槽位
    Evicted,
}

/// DPB 槽位池
#[derive(Debug)]
pub struct DpbManager<P> {
    slots: Vec<DpbSlot<P>>,
}

impl<P> DpbManager<P> {
    /// 分配 `count` 个槽位
    ///
    /// `create` 任意一次失败时, 已创建的资源按逆序交给 `destroy` 释放后返回错误.
    pub fn allocate<T, C, D>(
        count: usize,
        owner: &mut T,
        mut create: C,
        mut destroy: D,
    ) -> MirraResult<Self>
    where
        T: ?Sized,
        C: FnMut(&mut T, usize) -> MirraResult<P>,
        D: FnMut(&mut T, P),
    {
        if count == 0 {
            return Err(MirraError::InvalidArgument("DPB 槽位数量不能为 0".into()));
        }
        let mut resources = Vec::with_capacity(count);
        for idx in 0..count {
            match create(owner, idx) {
                Ok(resource) => resources.push(resource),
                Err(err) => {
                    while let Some(resource) = resources.pop() {
                        destroy(owner, resource);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            slots: resources.into_iter().map(DpbSlot::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> Option<&DpbSlot<P>> {
        self.slots.get(idx)
    }

    pub fn slot_mut(&mut self, idx: usize) -> Option<&mut DpbSlot<P>> {
        self.slots.get_mut(idx)
    }

    pub fn slots(&self) -> &[DpbSlot<P>] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [DpbSlot<P>] {
        &mut self.slots
    }

    /// 获取一个输出槽位并重置其元数据
    ///
    /// 顺序: 第一个空闲槽位, 其次第一个非参考槽位, 最后是 POC 最小的槽位.
    pub fn acquire(&mut self) -> (usize, AcquireKind) {
        let (idx, kind) = self.select();
        self.claim(idx);
        (idx, kind)
    }

    /// 按 [`acquire`](Self::acquire) 的顺序选出槽位, 不修改任何状态
    pub fn select(&self) -> (usize, AcquireKind) {
        if let Some(idx) = self.slots.iter().position(|s| !s.in_use) {
            (idx, AcquireKind::Free)
        } else if let Some(idx) = self.slots.iter().position(|s| !s.is_reference) {
            (idx, AcquireKind::NonReference)
        } else {
            let idx = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.poc)
                .map_or(0, |(idx, _)| idx);
            (idx, AcquireKind::Evicted)
        }
    }

    /// 占用 `select` 选出的槽位, 原有元数据被清除
    pub fn claim(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.in_use {
            debug!(
                "DPB: 槽位不足, 复用槽位 {} (reference={}, poc={})",
                idx, slot.is_reference, slot.poc
            );
        }
        slot.reset();
    }

    /// 释放槽位, 只清除 in_use, 参考与 POC 元数据保留到下一次获取
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.in_use = false;
        }
    }

    /// 按 POC 线性查找正在使用的槽位
    pub fn find_by_poc(&self, poc: i32) -> Option<usize> {
        self.slots.iter().position(|s| s.in_use && s.poc == poc)
    }

    /// 除 `current` 外所有参考槽位的索引
    pub fn reference_indices_except(&self, current: usize) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(idx, s)| *idx != current && s.is_reference)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// 清除除 `current` 外所有槽位的参考标记
    pub fn clear_references_except(&mut self, current: usize) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if idx != current {
                slot.unmark();
            }
        }
    }

    /// 参考帧数量
    pub fn reference_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_reference).count()
    }

    /// 正在使用的槽位数量
    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// 清空全部元数据
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.unmark();
            slot.in_use = false;
        }
    }

    /// 拆出全部后端资源 (用于销毁)
    pub fn into_resources(self) -> Vec<P> {
        self.slots.into_iter().map(|s| s.resource).collect()
    }
}
