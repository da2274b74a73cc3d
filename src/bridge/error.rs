//! 桥的错误分类

use std::fmt::Display;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// 桥操作失败的原因
///
/// 发送失败由各个桥自行区分：`Transient` 会被路由重试，`Permanent` 记录日志后丢弃。
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// 连接失败，只影响当前桥实例
    #[error("连接失败: {0}")]
    Connect(String),

    /// 限流、超时、网络抖动
    #[error("暂时无法发送: {0}")]
    Transient(String),

    /// 频道无效、凭证失效等
    #[error("发送失败: {0}")]
    Permanent(String),

    /// 该平台不支持此操作
    #[error("不支持的操作: {0}")]
    Unsupported(&'static str),
}

impl BridgeError {
    pub fn connect(message: impl Display) -> Self {
        BridgeError::Connect(message.to_string())
    }

    pub fn transient(message: impl Display) -> Self {
        BridgeError::Transient(message.to_string())
    }

    pub fn permanent(message: impl Display) -> Self {
        BridgeError::Permanent(message.to_string())
    }

    /// 根据平台返回的 http 状态码分类
    pub fn from_status(status: u16, message: impl Display) -> Self {
        match status {
            408 | 425 | 429 | 500..=599 => BridgeError::Transient(format!("{status}: {message}")),
            _ => BridgeError::Permanent(format!("{status}: {message}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return BridgeError::from_status(status.as_u16(), err);
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return BridgeError::transient(err);
        }
        BridgeError::permanent(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_status() {
        assert!(BridgeError::from_status(429, "Too Many Requests").is_transient());
        assert!(BridgeError::from_status(502, "Bad Gateway").is_transient());
        assert!(!BridgeError::from_status(403, "Forbidden").is_transient());
        assert!(!BridgeError::from_status(400, "chat not found").is_transient());
    }

    #[test]
    fn display() {
        let err = BridgeError::from_status(404, "Not Found");
        assert_eq!(err.to_string(), "发送失败: 404: Not Found");
        assert!(!BridgeError::Unsupported("edit").is_transient());
    }
}
