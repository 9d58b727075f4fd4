//! 解码器配置.
//!
//! 可序列化部分 ([`DecoderConfig`]) 可以从 JSON 加载; GPU 设备句柄不属于配置,
//! 构造 [`UnifiedDecoder`](crate::UnifiedDecoder) 时单独传入.

use std::path::Path;

use serde::{Deserialize, Serialize};

use mirra_core::{MirraError, MirraResult};
use mirra_vulkan::GpuDecoderConfig;

/// DPB 槽位配置上限 (设备上限会进一步收紧)
pub const MAX_DPB_SLOTS: u32 = 16;

/// 视频编码格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
}

/// 解码器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    pub max_width: u32,
    pub max_height: u32,
    pub dpb_slots: u32,
    /// 帧资源环长度 (GPU 层流水线深度)
    pub frames_in_flight: usize,
    pub reorder_capacity: usize,
    /// 每次提交后等待 GPU 完成
    pub sync_decode: bool,
    /// 提供了 GPU 设备时优先尝试 Vulkan Video
    pub prefer_vulkan_video: bool,
    /// 允许回退到外部解码库
    pub allow_ffmpeg_fallback: bool,
    /// 外部解码库优先尝试硬件加速实现
    pub enable_hw_accel: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            max_width: 1920,
            max_height: 1088,
            dpb_slots: 8,
            frames_in_flight: 3,
            reorder_capacity: 8,
            sync_decode: false,
            prefer_vulkan_video: true,
            allow_ffmpeg_fallback: true,
            enable_hw_accel: true,
        }
    }
}

impl DecoderConfig {
    /// 检查取值范围
    pub fn validate(&self) -> MirraResult<()> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err(MirraError::InvalidArgument(format!(
                "最大尺寸非法: {}x{}",
                self.max_width, self.max_height
            )));
        }
        if self.dpb_slots == 0 || self.dpb_slots > MAX_DPB_SLOTS {
            return Err(MirraError::InvalidArgument(format!(
                "DPB 槽位数必须在 1..={} 之间, 实际 {}",
                MAX_DPB_SLOTS, self.dpb_slots
            )));
        }
        if self.frames_in_flight == 0 {
            return Err(MirraError::InvalidArgument("帧资源环长度不能为 0".into()));
        }
        if self.reorder_capacity == 0 {
            return Err(MirraError::InvalidArgument("重排缓冲容量不能为 0".into()));
        }
        Ok(())
    }

    /// 从 JSON 文本解析, 缺省字段取默认值
    pub fn from_json_str(text: &str) -> MirraResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| MirraError::InvalidArgument(format!("解析解码器配置失败: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn load(path: impl AsRef<Path>) -> MirraResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// GPU 层使用的配置子集
    pub fn gpu_config(&self) -> GpuDecoderConfig {
        GpuDecoderConfig {
            max_width: self.max_width,
            max_height: self.max_height,
            dpb_slots: self.dpb_slots,
            frames_in_flight: self.frames_in_flight,
            reorder_capacity: self.reorder_capacity,
            sync_decode: self.sync_decode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gpu_config(), GpuDecoderConfig::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = DecoderConfig::from_json_str(
            r#"{ "codec": "h264", "dpb_slots": 4, "allow_ffmpeg_fallback": false }"#,
        )
        .unwrap();
        assert_eq!(config.dpb_slots, 4);
        assert!(!config.allow_ffmpeg_fallback);
        assert_eq!(config.max_width, 1920);
        assert!(config.prefer_vulkan_video);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = DecoderConfig::default();
        config.dpb_slots = MAX_DPB_SLOTS + 1;
        assert!(config.validate().is_err());

        let mut config = DecoderConfig::default();
        config.max_height = 0;
        assert!(config.validate().is_err());

        let mut config = DecoderConfig::default();
        config.frames_in_flight = 0;
        assert!(config.validate().is_err());

        assert!(DecoderConfig::from_json_str(r#"{ "codec": "vp9" }"#).is_err());
    }
}
