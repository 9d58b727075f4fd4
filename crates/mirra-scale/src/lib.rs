//! # mirra-scale
//!
//! 解码输出的像素格式转换.
//!
//! - NV12 / I420 → RGBA, BT.601 与 BT.709, 有限范围与全范围
//! - 行级并行 (rayon)
//! - 与 GPU 计算着色器共用同一组色彩矩阵系数

pub mod convert;

pub use convert::{
    ColorMatrix, ColorSpec, ConvertCoefficients, YuvLayout, YuvPlanes, yuv_to_rgba,
    yuv_to_rgba_vec,
};
