//! 帧资源环 (frame-in-flight).
//!
//! 每个环槽位持有一块主机可见的码流缓冲. 提交时分配单调递增的时间线值:
//! 同步模式下提交后立即等待并释放槽位; 异步模式下等待推迟到同一槽位被再次获取时,
//! 流水线深度等于环长度.
//!
//! 等待先尝试 100ms, 超时后输出诊断日志再无限等待, 不会中止操作.

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use log::{debug, warn};

use mirra_core::{MirraError, MirraResult};

use crate::context::VulkanContext;
use crate::error::VulkanError;
use crate::session::VideoProfile;

/// 有界等待时长
pub const BOUNDED_WAIT: Duration = Duration::from_millis(100);

/// 码流缓冲初始容量
pub const INITIAL_BITSTREAM_CAPACITY: u64 = 512 * 1024;

/// 帧资源环的底层实现 (缓冲与时间线)
pub trait RingBackend {
    type Buffer;

    fn create_buffer(&mut self, size: u64) -> MirraResult<Self::Buffer>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    /// 写入 `data`, 并把 `[data.len(), padded)` 清零
    fn write(&mut self, buffer: &mut Self::Buffer, data: &[u8], padded: u64) -> MirraResult<()>;

    /// 等待时间线达到 `value`; 超时返回 `Ok(false)`, `timeout` 为 None 时无限等待
    fn wait(&mut self, value: u64, timeout: Option<Duration>) -> MirraResult<bool>;
}

/// 向上对齐
pub fn align_up(size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    size.div_ceil(alignment) * alignment
}

struct RingSlot<B> {
    buffer: Option<B>,
    capacity: u64,
    /// 尚未确认完成的提交
    pending: Option<u64>,
}

/// 一次获取的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLease {
    pub index: usize,
    /// 已对齐的数据长度
    pub size: u64,
}

/// 帧资源环
pub struct FrameRing<B> {
    slots: Vec<RingSlot<B>>,
    next: usize,
    alignment: u64,
    sync: bool,
    timeline: u64,
    resizes: u64,
}

impl<B> FrameRing<B> {
    /// 创建 `count` 个槽位, 每个预分配 `initial_capacity` 字节; 失败时回收已创建的缓冲
    pub fn create<R: RingBackend<Buffer = B>>(
        backend: &mut R,
        count: usize,
        alignment: u64,
        initial_capacity: u64,
        sync: bool,
    ) -> MirraResult<Self> {
        if count == 0 {
            return Err(MirraError::InvalidArgument("帧资源环长度不能为 0".into()));
        }
        let capacity = align_up(initial_capacity.max(1), alignment);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match backend.create_buffer(capacity) {
                Ok(buffer) => slots.push(RingSlot {
                    buffer: Some(buffer),
                    capacity,
                    pending: None,
                }),
                Err(err) => {
                    for slot in slots.into_iter().rev() {
                        if let Some(buffer) = slot.buffer {
                            backend.destroy_buffer(buffer);
                        }
                    }
                    return Err(err);
                }
            }
        }
        debug!(
            "帧资源环: {} 个槽位, 容量 {} 字节, {}模式",
            count,
            capacity,
            if sync { "同步" } else { "异步" }
        );
        Ok(Self {
            slots,
            next: 0,
            alignment: alignment.max(1),
            sync,
            timeline: 0,
            resizes: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// 扩容次数
    pub fn resize_count(&self) -> u64 {
        self.resizes
    }

    /// 最近分配的时间线值
    pub fn timeline_value(&self) -> u64 {
        self.timeline
    }

    pub fn buffer(&self, index: usize) -> Option<&B> {
        self.slots.get(index).and_then(|s| s.buffer.as_ref())
    }

    pub fn capacity(&self, index: usize) -> u64 {
        self.slots.get(index).map_or(0, |s| s.capacity)
    }

    /// 槽位是否仍有未完成的提交
    pub fn is_pending(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.pending.is_some())
    }

    /// 获取下一个槽位并拷入 `data`
    ///
    /// 槽位上一轮的提交会先被等待; 容量不足时按对齐后的大小重建缓冲.
    pub fn acquire<R: RingBackend<Buffer = B>>(
        &mut self,
        backend: &mut R,
        data: &[u8],
    ) -> MirraResult<RingLease> {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();
        let alignment = self.alignment;
        let slot = &mut self.slots[index];

        if let Some(value) = slot.pending.take() {
            wait_value(backend, value)?;
        }

        let size = align_up(data.len() as u64, alignment);
        if size > slot.capacity || slot.buffer.is_none() {
            if let Some(old) = slot.buffer.take() {
                backend.destroy_buffer(old);
            }
            slot.capacity = 0;
            let buffer = backend.create_buffer(size)?;
            slot.buffer = Some(buffer);
            slot.capacity = size;
            self.resizes += 1;
            debug!("帧资源环: 槽位 {} 扩容到 {} 字节", index, size);
        }

        let buffer = slot
            .buffer
            .as_mut()
            .ok_or_else(|| MirraError::Internal("帧资源环槽位缺少缓冲".into()))?;
        backend.write(buffer, data, size)?;
        Ok(RingLease { index, size })
    }

    /// 分配下一个时间线值
    pub fn next_value(&mut self) -> u64 {
        self.timeline += 1;
        self.timeline
    }

    /// 记录槽位的提交; 同步模式下立即等待完成
    pub fn submitted<R: RingBackend<Buffer = B>>(
        &mut self,
        backend: &mut R,
        index: usize,
        value: u64,
    ) -> MirraResult<()> {
        if self.sync {
            return wait_value(backend, value);
        }
        if let Some(slot) = self.slots.get_mut(index) {
            slot.pending = Some(value);
        }
        Ok(())
    }

    /// 等待全部未完成的提交
    pub fn wait_all<R: RingBackend<Buffer = B>>(&mut self, backend: &mut R) -> MirraResult<()> {
        for slot in &mut self.slots {
            if let Some(value) = slot.pending.take() {
                wait_value(backend, value)?;
            }
        }
        Ok(())
    }

    /// 销毁全部缓冲 (调用方需保证设备空闲)
    pub fn destroy<R: RingBackend<Buffer = B>>(&mut self, backend: &mut R) {
        for slot in &mut self.slots {
            slot.pending = None;
            slot.capacity = 0;
            if let Some(buffer) = slot.buffer.take() {
                backend.destroy_buffer(buffer);
            }
        }
    }
}

fn wait_value<R: RingBackend + ?Sized>(backend: &mut R, value: u64) -> MirraResult<()> {
    if backend.wait(value, Some(BOUNDED_WAIT))? {
        return Ok(());
    }
    warn!(
        "帧资源环: 等待时间线值 {} 超过 {}ms, 继续等待",
        value,
        BOUNDED_WAIT.as_millis()
    );
    if backend.wait(value, None)? {
        Ok(())
    } else {
        Err(MirraError::Submission(format!(
            "时间线值 {} 未完成",
            value
        )))
    }
}

// ============================================================
// Vulkan 实现
// ============================================================

/// 主机可见的码流缓冲 (持久映射)
pub struct HostBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    size: u64,
}

// SAFETY: 映射指针只在持有 &mut HostBuffer 时写入, 不跨线程共享
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// 以 Vulkan 缓冲和时间线信号量实现的帧资源环后端
pub struct VulkanRing {
    ctx: Arc<VulkanContext>,
    profile: VideoProfile,
    timeline: vk::Semaphore,
}

impl VulkanRing {
    pub fn new(ctx: Arc<VulkanContext>, profile: VideoProfile) -> MirraResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let timeline = unsafe { ctx.device().create_semaphore(&info, None) }
            .map_err(VulkanError::call("vkCreateSemaphore"))?;
        Ok(Self {
            ctx,
            profile,
            timeline,
        })
    }

    /// 解码提交使用的时间线信号量
    pub fn semaphore(&self) -> vk::Semaphore {
        self.timeline
    }

    fn free(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        let device = self.ctx.device();
        unsafe {
            // SAFETY: 缓冲不再被任何命令引用
            if memory != vk::DeviceMemory::null() {
                device.free_memory(memory, None);
            }
            device.destroy_buffer(buffer, None);
        }
    }
}

impl RingBackend for VulkanRing {
    type Buffer = HostBuffer;

    fn create_buffer(&mut self, size: u64) -> MirraResult<HostBuffer> {
        let device = self.ctx.device().clone();
        let families = self.ctx.queue_family_indices();
        let buffer = self
            .profile
            .with_info(|info| {
                let mut profile_list =
                    vk::VideoProfileListInfoKHR::default().profiles(std::slice::from_ref(info));
                let create_info = vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .queue_family_indices(&families[..1])
                    .push_next(&mut profile_list);
                unsafe { device.create_buffer(&create_info, None) }
            })
            .map_err(VulkanError::call("vkCreateBuffer"))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match self.ctx.allocate_memory(
            requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                self.free(buffer, vk::DeviceMemory::null());
                return Err(err.into());
            }
        };
        let mapped = unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };
        match mapped {
            Ok(mapped) => Ok(HostBuffer {
                buffer,
                memory,
                mapped: mapped.cast::<u8>(),
                size,
            }),
            Err(result) => {
                self.free(buffer, memory);
                Err(VulkanError::call("vkMapMemory")(result).into())
            }
        }
    }

    fn destroy_buffer(&mut self, buffer: HostBuffer) {
        unsafe { self.ctx.device().unmap_memory(buffer.memory) };
        self.free(buffer.buffer, buffer.memory);
    }

    fn write(&mut self, buffer: &mut HostBuffer, data: &[u8], padded: u64) -> MirraResult<()> {
        if padded > buffer.size || (data.len() as u64) > padded {
            return Err(MirraError::Internal(format!(
                "码流缓冲越界: len={}, padded={}, size={}",
                data.len(),
                padded,
                buffer.size
            )));
        }
        unsafe {
            // SAFETY: 已检查范围, 映射区域长度为 buffer.size
            ptr::copy_nonoverlapping(data.as_ptr(), buffer.mapped, data.len());
            buffer
                .mapped
                .add(data.len())
                .write_bytes(0, (padded as usize) - data.len());
        }
        Ok(())
    }

    fn wait(&mut self, value: u64, timeout: Option<Duration>) -> MirraResult<bool> {
        let semaphores = [self.timeline];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |d| d.as_nanos() as u64);
        match unsafe { self.ctx.device().wait_semaphores(&info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(MirraError::Submission(
                VulkanError::call("vkWaitSemaphores")(result).to_string(),
            )),
        }
    }
}

impl Drop for VulkanRing {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_semaphore(self.timeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 内存缓冲 + 脚本化时间线
    #[derive(Default)]
    struct MockRing {
        created: Vec<u64>,
        destroyed: usize,
        completed: u64,
        /// 有界等待期间视为完成的值上限 (模拟慢设备)
        slow_until: u64,
        waits: Vec<(u64, Option<Duration>)>,
        fail_create_at: Option<usize>,
    }

    impl RingBackend for MockRing {
        type Buffer = Vec<u8>;

        fn create_buffer(&mut self, size: u64) -> MirraResult<Vec<u8>> {
            if self.fail_create_at == Some(self.created.len()) {
                return Err(MirraError::Gpu("显存不足".into()));
            }
            self.created.push(size);
            Ok(vec![0xEE; size as usize])
        }

        fn destroy_buffer(&mut self, _buffer: Vec<u8>) {
            self.destroyed += 1;
        }

        fn write(&mut self, buffer: &mut Vec<u8>, data: &[u8], padded: u64) -> MirraResult<()> {
            buffer[..data.len()].copy_from_slice(data);
            buffer[data.len()..padded as usize].fill(0);
            Ok(())
        }

        fn wait(&mut self, value: u64, timeout: Option<Duration>) -> MirraResult<bool> {
            self.waits.push((value, timeout));
            if timeout.is_some() && value <= self.slow_until {
                return Ok(false);
            }
            self.completed = self.completed.max(value);
            Ok(true)
        }
    }

    fn ring(backend: &mut MockRing, count: usize, sync: bool) -> FrameRing<Vec<u8>> {
        FrameRing::create(backend, count, 256, 1024, sync).unwrap()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(1000, 0), 1000);
    }

    #[test]
    fn test_create_rolls_back_on_failure() {
        let mut backend = MockRing {
            fail_create_at: Some(2),
            ..Default::default()
        };
        assert!(FrameRing::create(&mut backend, 3, 256, 1024, false).is_err());
        assert_eq!(backend.destroyed, 2);
        assert!(FrameRing::<Vec<u8>>::create(&mut backend, 0, 256, 1024, false).is_err());
    }

    #[test]
    fn test_large_nal_resizes_once() {
        let mut backend = MockRing::default();
        let mut ring = ring(&mut backend, 1, true);
        let nal: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let lease = ring.acquire(&mut backend, &nal).unwrap();
        assert_eq!(ring.resize_count(), 1);
        assert_eq!(lease.size, 3072);
        assert!(ring.capacity(0) >= 3072);
        let buffer = ring.buffer(0).unwrap();
        assert_eq!(&buffer[..nal.len()], &nal[..]);
        assert!(buffer[nal.len()..3072].iter().all(|&b| b == 0));

        // 较小的 NAL 复用现有缓冲
        ring.acquire(&mut backend, &nal[..100]).unwrap();
        assert_eq!(ring.resize_count(), 1);
        assert_eq!(backend.created, vec![1024, 3072]);
    }

    #[test]
    fn test_async_waits_on_slot_reuse() {
        let mut backend = MockRing::default();
        let mut ring = ring(&mut backend, 2, false);

        for _ in 0..2 {
            let lease = ring.acquire(&mut backend, &[1, 2, 3]).unwrap();
            let value = ring.next_value();
            ring.submitted(&mut backend, lease.index, value).unwrap();
        }
        assert!(backend.waits.is_empty(), "异步模式提交时不等待");
        assert!(ring.is_pending(0) && ring.is_pending(1));

        // 第三次获取复用槽位 0, 等待其时间线值 1
        let lease = ring.acquire(&mut backend, &[4]).unwrap();
        assert_eq!(lease.index, 0);
        assert_eq!(backend.waits, vec![(1, Some(BOUNDED_WAIT))]);
        assert!(!ring.is_pending(0));
    }

    #[test]
    fn test_sync_waits_immediately() {
        let mut backend = MockRing::default();
        let mut ring = ring(&mut backend, 2, true);
        let lease = ring.acquire(&mut backend, &[0, 0, 1]).unwrap();
        let value = ring.next_value();
        ring.submitted(&mut backend, lease.index, value).unwrap();
        assert_eq!(backend.completed, 1);
        assert!(!ring.is_pending(lease.index));
    }

    #[test]
    fn test_slow_device_falls_back_to_unbounded_wait() {
        let mut backend = MockRing {
            slow_until: 1,
            ..Default::default()
        };
        let mut ring = ring(&mut backend, 1, true);
        let lease = ring.acquire(&mut backend, &[9]).unwrap();
        let value = ring.next_value();
        ring.submitted(&mut backend, lease.index, value).unwrap();
        assert_eq!(backend.waits, vec![(1, Some(BOUNDED_WAIT)), (1, None)]);
    }

    #[test]
    fn test_destroy_releases_buffers() {
        let mut backend = MockRing::default();
        let mut ring = ring(&mut backend, 3, false);
        let lease = ring.acquire(&mut backend, &[1]).unwrap();
        let value = ring.next_value();
        ring.submitted(&mut backend, lease.index, value).unwrap();
        ring.wait_all(&mut backend).unwrap();
        assert_eq!(backend.completed, 1);
        ring.destroy(&mut backend);
        assert_eq!(backend.destroyed, 3);
        assert!(ring.buffer(0).is_none());
    }
}
