//! Vulkan 层错误类型.

use ash::vk;
use thiserror::Error;

use mirra_core::MirraError;

/// Vulkan 层错误, 在 crate 边界转换为 [`MirraError::Gpu`]
#[derive(Debug, Error)]
pub enum VulkanError {
    /// Vulkan 调用返回失败码
    #[error("{op} 失败: {result}")]
    Call {
        op: &'static str,
        result: vk::Result,
    },

    /// 设备缺少必需的扩展
    #[error("设备不支持扩展 {0}")]
    MissingExtension(String),

    /// 设备没有满足要求的内存类型
    #[error("没有可用的内存类型 (type_bits=0x{0:08x})")]
    NoMemoryType(u32),

    /// 设备能力不足
    #[error("设备能力不足: {0}")]
    Capability(String),

    /// SPIR-V 着色器不可用或非法
    #[error("着色器不可用: {0}")]
    Shader(String),

    /// 构建会话参数时缺少 SPS/PPS
    #[error("没有可用的 SPS/PPS")]
    MissingParameters,

    /// 等待时间线信号量超时
    #[error("等待时间线值 {0} 超时")]
    Timeout(u64),
}

impl VulkanError {
    /// 构造调用失败错误
    pub fn call(op: &'static str) -> impl FnOnce(vk::Result) -> VulkanError {
        move |result| VulkanError::Call { op, result }
    }
}

impl From<VulkanError> for MirraError {
    fn from(err: VulkanError) -> Self {
        MirraError::Gpu(err.to_string())
    }
}

pub type VulkanResult<T> = Result<T, VulkanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_to_gpu_error() {
        let err: MirraError = VulkanError::Call {
            op: "vkCreateVideoSessionKHR",
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        }
        .into();
        match err {
            MirraError::Gpu(msg) => assert!(msg.contains("vkCreateVideoSessionKHR")),
            other => panic!("错误类型不符: {:?}", other),
        }
    }

    #[test]
    fn test_call_helper() {
        let err = VulkanError::call("vkQueueSubmit")(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(
            err,
            VulkanError::Call {
                op: "vkQueueSubmit",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));
    }
}
