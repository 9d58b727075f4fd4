//! # Mirra
//!
//! 低延迟 H.264 解码核心, 用于设备镜像的实时视频流.
//!
//! - **GPU 层**: Vulkan Video 硬件解码, 自行管理 DPB、参考帧与显示重排, 计算着色器输出 RGBA
//! - **回退层**: 外部解码库 (硬件加速或 OpenH264 软件解码), CPU 转换为 RGBA
//! - **统一外观**: [`UnifiedDecoder`] 选择可用的层并通过同一个回调输出帧
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use mirra::{DecoderConfig, UnifiedDecoder};
//!
//! let decoder = UnifiedDecoder::new(DecoderConfig::default(), None)?;
//! decoder.set_callback(|frame| {
//!     println!("{}x{} pts={} ({})", frame.width, frame.height, frame.pts, frame.backend);
//! });
//! let annex_b: &[u8] = &[0, 0, 0, 1, 0x67];
//! decoder.decode(annex_b, 0)?;
//! # Ok::<(), mirra::core::MirraError>(())
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `mirra-core` | 错误类型与位读取器 |
//! | `mirra-codec` | H.264 解析、POC、参考标记、DPB 与 slice 状态机 |
//! | `mirra-scale` | YUV → RGBA 转换 |
//! | `mirra-vulkan` | Vulkan Video 解码层 |

pub mod config;
pub mod fallback;
pub mod frame;
pub mod logging;
pub mod unified;

/// 错误类型与位读取器
pub use mirra_core as core;

/// H.264 解码核心
pub use mirra_codec as codec;

/// 像素格式转换
pub use mirra_scale as scale;

/// Vulkan Video 解码层
pub use mirra_vulkan as vulkan;

pub use config::{DecoderConfig, VideoCodec};
pub use fallback::{LibraryDecoder, LibraryFactory, LibraryFrame};
pub use frame::{BackendKind, DecodedFrame, FrameCallback, FramePayload};
pub use unified::UnifiedDecoder;

/// 获取 Mirra 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
