//! # mirra-vulkan
//!
//! 基于 Vulkan Video (`VK_KHR_video_decode_h264`) 的 H.264 硬件解码层.
//!
//! - [`VulkanContext`]: 集成方提供的设备与队列
//! - [`VulkanBackend`]: 实现 [`mirra_codec::DecodeBackend`], 管理会话、DPB 图像与帧资源环
//! - [`ComputeConverter`]: 计算着色器 YUV → RGBA
//! - [`VulkanDecoder`]: 以上组合, 通过 [`GpuDecoder`] 对外提供

pub mod backend;
pub mod context;
pub mod convert;
pub mod decoder;
pub mod dpb_image;
pub mod error;
pub mod frame_ring;
pub mod session;
pub mod shader;

pub use ash::vk;

pub use backend::VulkanBackend;
pub use context::{
    GpuDecoder, GpuDecoderConfig, GpuFrame, GpuVideoDevice, H264_DECODE_EXTENSION, QueueInfo,
    REQUIRED_EXTENSIONS, VulkanContext,
};
pub use convert::ComputeConverter;
pub use decoder::VulkanDecoder;
pub use error::{VulkanError, VulkanResult};
pub use frame_ring::{FrameRing, RingBackend};
