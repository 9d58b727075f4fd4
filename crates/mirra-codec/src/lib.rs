//! # mirra-codec
//!
//! Mirra 的 H.264 解码核心, 不依赖任何 GPU API.
//!
//! - Annex B 分割, 防竞争字节处理
//! - SPS / PPS / slice header 解析
//! - POC 计算, 参考帧标记 (滑动窗口与 MMCO), 显示顺序重排
//! - DPB 槽位池与 slice 解码状态机, 通过 [`h264::DecodeBackend`] 对接具体的硬件后端
//!
//! ## 使用示例
//!
//! ```rust
//! use mirra_codec::h264::{NalUnitType, parse_annex_b};
//!
//! let data = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x01, 0x68, 0xCE];
//! let nalus = parse_annex_b(&data);
//! assert_eq!(nalus.len(), 2);
//! assert_eq!(nalus[0].nal_type, NalUnitType::Sps);
//! assert_eq!(nalus[1].nal_type, NalUnitType::Pps);
//! ```

pub mod h264;

pub use h264::{DecodeBackend, DecoderStats, OutputPicture, SliceDecoder, SliceDecoderConfig};
