// 上传引擎错误定义
//
// 错误分类：
// - 网络/瞬时错误（超时、连接重置、响应截断）：默认策略重试
// - 平台限流（HTTP 429/406、601、"上传视频过快"）：可重试，调用方应改用长退避策略
// - 网关错误（502/503）：按关键字走默认策略
// - 预上传/合并被拒（服务端 OK 标志缺失或为假）：与瞬时错误一样重试
// - 认证/参数错误：致命，绝不重试
// - 队列已满：仅影响本次入队调用

use thiserror::Error;

/// 上传引擎统一结果类型
pub type Result<T> = std::result::Result<T, UploadError>;

/// 平台"上传过快"业务码
const THROTTLE_CODE: i64 = 601;

/// 平台限流提示文本
const THROTTLE_PHRASE: &str = "上传视频过快";

/// 响应体是否表示平台限流：JSON 业务码为 601，或带有限流提示
///
/// 只匹配 code 字段，正文里偶然出现的 "601"（文件名、节点名）不算
pub fn is_throttle_body(body: &str) -> bool {
    if body.contains(THROTTLE_PHRASE) {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(|c| c.as_i64()))
        == Some(THROTTLE_CODE)
}

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 网络错误（连接失败、超时、读取响应失败）
    #[error("网络错误: {0}")]
    Network(String),

    /// 非 2xx 的 HTTP 响应
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// 平台限流（速率限制或"上传视频过快"）
    #[error("平台限流 {status}: {message}")]
    Throttled { status: u16, message: String },

    /// 预上传协商被拒（OK 标志缺失或为假）
    #[error("预上传失败: {0}")]
    NegotiationFailed(String),

    /// 合并/完成上传被拒（OK 标志缺失或为假）
    #[error("完成上传失败: {0}")]
    CompletionFailed(String),

    /// 认证失败（凭证过期、缺少必需令牌），调用方应触发重新登录
    #[error("认证失败: {0}")]
    Auth(String),

    /// 参数校验失败
    #[error("参数错误: {0}")]
    Validation(String),

    /// 账号上传队列已满
    #[error("账号 {account_id} 的上传队列已满（容量 {capacity}）")]
    QueueFull { account_id: String, capacity: usize },

    /// 未知的上传后端/线路
    #[error("未知的上传线路: {0}")]
    UnknownBackend(String),

    /// 响应解析失败
    #[error("解析响应失败: {0}")]
    Decode(String),

    /// 本地文件读写错误
    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    /// 已取消
    #[error("上传已取消")]
    Cancelled,

    /// 任务执行过程中出现异常（如工作者 panic）
    #[error("内部错误: {0}")]
    Internal(String),
}

impl UploadError {
    /// 致命错误：无论消息内容如何都不重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UploadError::Auth(_)
                | UploadError::Validation(_)
                | UploadError::QueueFull { .. }
                | UploadError::UnknownBackend(_)
                | UploadError::Cancelled
                | UploadError::Internal(_)
        )
    }

    /// 是否为认证类错误
    pub fn is_auth(&self) -> bool {
        matches!(self, UploadError::Auth(_))
    }

    /// 是否为平台限流
    pub fn is_throttled(&self) -> bool {
        match self {
            UploadError::Throttled { .. } => true,
            UploadError::Http { status, body } => {
                matches!(status, 406 | 429) || is_throttle_body(body)
            }
            other => {
                // 协商/合并失败的消息形如 "OK=0, code=601, message=..."
                let msg = other.to_string();
                let code = format!("code={}", THROTTLE_CODE);
                msg.contains(THROTTLE_PHRASE) || msg.split([',', ' ']).any(|part| part == code)
            }
        }
    }

    /// 服务端拒绝（OK 标志为假）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::NegotiationFailed(_) | UploadError::CompletionFailed(_)
        )
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UploadError::Network(format!("request timeout: {}", e))
        } else if e.is_connect() {
            UploadError::Network(format!("connection failed: {}", e))
        } else if e.is_decode() {
            UploadError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UploadError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            UploadError::Network(format!("connection error: {}", e))
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        // 截断的响应体按瞬时错误处理
        if e.is_eof() {
            UploadError::Network(format!("unexpected EOF: {}", e))
        } else {
            UploadError::Decode(e.to_string())
        }
    }
}
