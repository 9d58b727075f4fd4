//! 回调收到的统一帧结构.

use std::fmt;
use std::sync::Arc;

use mirra_vulkan::vk;

/// 当前生效的解码层
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// 尚未初始化或已销毁
    #[default]
    None,
    /// Vulkan Video 硬件解码
    Vulkan,
    /// 外部库 (硬件加速)
    HardwareLibrary,
    /// 外部库 (软件)
    SoftwareLibrary,
}

impl BackendKind {
    /// 是否为外部库回退层
    pub fn is_library(&self) -> bool {
        matches!(self, Self::HardwareLibrary | Self::SoftwareLibrary)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Vulkan => "vulkan",
            Self::HardwareLibrary => "hw-lib",
            Self::SoftwareLibrary => "sw-lib",
        };
        f.write_str(name)
    }
}

/// 帧数据
#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    /// GPU 层: RGBA 图像与视图
    Gpu {
        image: vk::Image,
        view: vk::ImageView,
    },
    /// 回退层: RGBA 像素, 只在回调期间有效
    Cpu { rgba: &'a [u8], stride: usize },
}

/// 解码输出的一帧
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub payload: FramePayload<'a>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    /// 显示顺序 POC, 回退层不提供
    pub poc: Option<i32>,
    pub backend: BackendKind,
}

impl DecodedFrame<'_> {
    /// CPU 像素 (仅回退层)
    pub fn rgba(&self) -> Option<&[u8]> {
        match self.payload {
            FramePayload::Cpu { rgba, .. } => Some(rgba),
            FramePayload::Gpu { .. } => None,
        }
    }
}

/// 帧回调
pub type FrameCallback = Arc<dyn Fn(&DecodedFrame<'_>) + Send + Sync>;

/// 锁内产生, 锁外交给回调的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OwnedPayload {
    Gpu {
        image: vk::Image,
        view: vk::ImageView,
    },
    Cpu {
        rgba: Vec<u8>,
        stride: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingOutput {
    pub payload: OwnedPayload,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub poc: Option<i32>,
}

impl PendingOutput {
    pub(crate) fn as_frame(&self, backend: BackendKind) -> DecodedFrame<'_> {
        let payload = match &self.payload {
            OwnedPayload::Gpu { image, view } => FramePayload::Gpu {
                image: *image,
                view: *view,
            },
            OwnedPayload::Cpu { rgba, stride } => FramePayload::Cpu {
                rgba,
                stride: *stride,
            },
        };
        DecodedFrame {
            payload,
            width: self.width,
            height: self.height,
            pts: self.pts,
            poc: self.poc,
            backend,
        }
    }
}
