//! GPU 设备上下文与解码器接口.
//!
//! 设备与队列由集成方创建并传入 ([`VulkanContext::new`]), 本 crate 不拥有
//! instance/device 的生命周期. 上层通过 [`GpuVideoDevice`] 判断设备能力并创建解码器,
//! 测试中可以用不依赖真实设备的实现替代.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use log::{debug, info};

use mirra_codec::DecoderStats;
use mirra_core::MirraResult;

use crate::error::{VulkanError, VulkanResult};

/// H.264 硬件解码所需的设备扩展
pub const H264_DECODE_EXTENSION: &str = "VK_KHR_video_decode_h264";

/// GPU 解码所需的全部设备扩展
pub const REQUIRED_EXTENSIONS: [&str; 3] = [
    "VK_KHR_video_queue",
    "VK_KHR_video_decode_queue",
    H264_DECODE_EXTENSION,
];

// ============================================================
// 解码器接口
// ============================================================

/// GPU 解码器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDecoderConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub dpb_slots: u32,
    /// 帧资源环长度
    pub frames_in_flight: usize,
    pub reorder_capacity: usize,
    /// 同步模式: 每次提交后立即等待完成
    pub sync_decode: bool,
}

impl Default for GpuDecoderConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1088,
            dpb_slots: 8,
            frames_in_flight: 3,
            reorder_capacity: 8,
            sync_decode: false,
        }
    }
}

/// GPU 层输出的一帧
///
/// `image`/`view` 为转换后的 RGBA 图像, 在同一 DPB 槽位被下一次输出覆盖前有效.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuFrame {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub poc: i32,
}

/// 支持视频解码的 GPU 设备
pub trait GpuVideoDevice: Send + Sync {
    /// 设备名称 (日志用)
    fn name(&self) -> String;

    /// 设备是否支持某个扩展
    fn supports_extension(&self, name: &str) -> bool;

    /// 创建 H.264 解码器
    fn create_decoder(self: Arc<Self>, config: &GpuDecoderConfig)
    -> MirraResult<Box<dyn GpuDecoder>>;
}

/// GPU 解码器
pub trait GpuDecoder: Send {
    /// 解码一段 Annex B 数据, 返回按显示顺序就绪的帧
    fn decode(&mut self, data: &[u8], pts: i64) -> MirraResult<Vec<GpuFrame>>;

    /// 解码同一访问单元的多个 NAL 缓冲
    fn decode_access_unit(&mut self, buffers: &[&[u8]], pts: i64) -> MirraResult<Vec<GpuFrame>>;

    /// 输出全部缓冲中的帧
    fn flush(&mut self) -> MirraResult<Vec<GpuFrame>>;

    fn stats(&self) -> DecoderStats;

    /// 等待设备空闲并释放全部资源
    fn destroy(&mut self);
}

// ============================================================
// Vulkan 上下文
// ============================================================

/// 队列族与队列句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub family_index: u32,
    pub queue: vk::Queue,
}

/// 集成方提供的 Vulkan 设备
///
/// 设备创建时需启用 [`REQUIRED_EXTENSIONS`] 以及 timeline semaphore 与 synchronization2 特性.
pub struct VulkanContext {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    decode_queue: QueueInfo,
    compute_queue: QueueInfo,
    video_queue_instance: ash::khr::video_queue::Instance,
    video_queue: ash::khr::video_queue::Device,
    video_decode_queue: ash::khr::video_decode_queue::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    extensions: Vec<String>,
}

impl fmt::Debug for VulkanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanContext")
            .field("device", &self.device_name)
            .field("decode_queue", &self.decode_queue)
            .field("compute_queue", &self.compute_queue)
            .finish()
    }
}

impl VulkanContext {
    /// 由已创建的 instance/device 构造上下文
    pub fn new(
        entry: &ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        decode_queue: QueueInfo,
        compute_queue: QueueInfo,
    ) -> VulkanResult<Self> {
        let extensions = unsafe {
            // SAFETY: physical_device 来自同一个 instance
            instance.enumerate_device_extension_properties(physical_device)
        }
        .map_err(VulkanError::call("vkEnumerateDeviceExtensionProperties"))?
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .map(|name| name.to_string_lossy().into_owned())
        .collect::<Vec<_>>();

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let video_queue_instance = ash::khr::video_queue::Instance::new(entry, &instance);
        let video_queue = ash::khr::video_queue::Device::new(&instance, &device);
        let video_decode_queue = ash::khr::video_decode_queue::Device::new(&instance, &device);

        info!(
            "Vulkan: 设备 {}, 解码队列族 {}, 计算队列族 {}",
            device_name, decode_queue.family_index, compute_queue.family_index
        );
        debug!("Vulkan: 设备扩展 {} 个", extensions.len());

        Ok(Self {
            instance,
            physical_device,
            device,
            decode_queue,
            compute_queue,
            video_queue_instance,
            video_queue,
            video_decode_queue,
            memory_properties,
            device_name,
            extensions,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn decode_queue(&self) -> QueueInfo {
        self.decode_queue
    }

    pub fn compute_queue(&self) -> QueueInfo {
        self.compute_queue
    }

    pub fn video_queue_instance(&self) -> &ash::khr::video_queue::Instance {
        &self.video_queue_instance
    }

    pub fn video_queue(&self) -> &ash::khr::video_queue::Device {
        &self.video_queue
    }

    pub fn video_decode_queue(&self) -> &ash::khr::video_decode_queue::Device {
        &self.video_decode_queue
    }

    /// 解码与计算是否使用不同队列族
    pub fn split_queue_families(&self) -> bool {
        self.decode_queue.family_index != self.compute_queue.family_index
    }

    /// 图像与缓冲共享时涉及的队列族
    pub fn queue_family_indices(&self) -> Vec<u32> {
        if self.split_queue_families() {
            vec![self.decode_queue.family_index, self.compute_queue.family_index]
        } else {
            vec![self.decode_queue.family_index]
        }
    }

    /// 分配并返回满足要求的设备内存
    pub fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> VulkanResult<vk::DeviceMemory> {
        let type_index =
            find_memory_type(&self.memory_properties, requirements.memory_type_bits, flags)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        unsafe {
            // SAFETY: device 有效, 分配信息由驱动返回的需求构造
            self.device.allocate_memory(&info, None)
        }
        .map_err(VulkanError::call("vkAllocateMemory"))
    }

    /// 检查必需扩展, 返回缺失的第一个
    pub fn check_required_extensions(&self) -> VulkanResult<()> {
        match REQUIRED_EXTENSIONS
            .iter()
            .find(|ext| !self.supports_extension(ext))
        {
            Some(missing) => Err(VulkanError::MissingExtension((*missing).to_string())),
            None => Ok(()),
        }
    }
}

impl GpuVideoDevice for VulkanContext {
    fn name(&self) -> String {
        self.device_name.clone()
    }

    fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }

    fn create_decoder(
        self: Arc<Self>,
        config: &GpuDecoderConfig,
    ) -> MirraResult<Box<dyn GpuDecoder>> {
        let decoder = crate::decoder::VulkanDecoder::new(self, config)?;
        Ok(Box::new(decoder))
    }
}

/// 在 `type_bits` 中选择满足 `flags` 的内存类型
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    (0..properties.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
        .ok_or(VulkanError::NoMemoryType(type_bits))
}
