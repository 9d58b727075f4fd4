//! 统一错误类型定义.
//!
//! 所有 Mirra crate 共用的错误类型, 支持跨模块传播.
//! 错误按恢复方式划分: 解析类错误跳过当前 NAL, 初始化类错误终止构造,
//! 提交类错误计数后丢弃当前 slice.

use thiserror::Error;

/// Mirra 统一错误类型
#[derive(Debug, Error)]
pub enum MirraError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的码流特性或配置
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 数据不足, 需要更多输入
    #[error("数据不足, 需要更多输入")]
    NeedMoreData,

    /// 已到达比特流末尾
    #[error("已到达比特流末尾")]
    Eof,

    /// slice 引用的 SPS/PPS 尚未收到
    #[error("缺少参数集: {0}")]
    MissingParameterSet(String),

    /// GPU 会话或资源创建失败
    #[error("GPU 错误: {0}")]
    Gpu(String),

    /// 解码提交或同步失败
    #[error("解码提交失败: {0}")]
    Submission(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl MirraError {
    /// 是否属于码流解析类错误 (跳过当前 NAL 后可继续解码)
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidData(_)
                | Self::NeedMoreData
                | Self::Eof
                | Self::MissingParameterSet(_)
                | Self::Unsupported(_)
        )
    }
}

/// Mirra 统一 Result 类型
pub type MirraResult<T> = Result<T, MirraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_classification() {
        assert!(MirraError::InvalidData("x".into()).is_parse_error());
        assert!(MirraError::MissingParameterSet("pps_id=3".into()).is_parse_error());
        assert!(MirraError::Eof.is_parse_error());
        assert!(!MirraError::Gpu("oom".into()).is_parse_error());
        assert!(!MirraError::Submission("lost".into()).is_parse_error());
    }

    #[test]
    fn test_error_message_format() {
        let err = MirraError::MissingParameterSet("pps_id=7".into());
        assert_eq!(err.to_string(), "缺少参数集: pps_id=7");
    }
}
