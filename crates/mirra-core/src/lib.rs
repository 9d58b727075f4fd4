//! # mirra-core
//!
//! Mirra 镜像解码库的基础设施: 统一错误类型与比特流读取器.
//!
//! 上层 crate (mirra-codec, mirra-scale, mirra-vulkan) 共用本 crate 的错误类型.

pub mod bitreader;
pub mod error;

// 重导出常用类型
pub use bitreader::BitstreamReader;
pub use error::{MirraError, MirraResult};
