// B站上传 HTTP 客户端
//
// 每个上传任务一个实例：持有账号凭证和所选线路。
// Cookie 只附加在 member 站点请求上，上传节点使用预上传返回的令牌鉴权。

use super::types::{AccountCredentials, PreUploadResponse};
use crate::error::{is_throttle_body, Result, UploadError};
use reqwest::header::{COOKIE, REFERER};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// 与 Web 端投稿页保持一致的 UA
pub const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
);

/// 错误消息中保留的响应体长度
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct BiliClient {
    client: Client,
    credentials: AccountCredentials,
    member_base_url: String,
    /// 上传线路，如 cs_txa、kodo
    line: String,
}

impl BiliClient {
    pub fn new(
        credentials: AccountCredentials,
        member_base_url: impl Into<String>,
        line: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            credentials,
            member_base_url: member_base_url.into().trim_end_matches('/').to_string(),
            line: line.into(),
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn credentials(&self) -> &AccountCredentials {
        &self.credentials
    }

    /// 底层 HTTP 客户端（上传节点请求使用）
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// 预上传
    ///
    /// `referer` 用于线路选择（UPOS 专用）
    pub async fn preupload(
        &self,
        params: &[(&str, String)],
        referer: Option<&str>,
    ) -> Result<PreUploadResponse> {
        let url = format!("{}/preupload", self.member_base_url);
        let mut request = self.client.get(&url).query(params);
        if !self.credentials.cookies.is_empty() {
            request = request.header(COOKIE, self.credentials.cookies.as_str());
        }
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let body = self.send(request).await?;
        let resp: PreUploadResponse = decode(&body)?;
        if resp.is_not_logged_in() {
            return Err(UploadError::Auth(format!(
                "账号未登录或登录已过期 (code={}, message={})",
                resp.code, resp.message
            )));
        }
        Ok(resp)
    }

    /// 发送请求，按状态码和响应内容分类错误，成功时返回响应体
    pub async fn send(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            debug!("HTTP {} 响应: {}", status.as_u16(), truncate(&body));
            return Ok(body);
        }

        let code = status.as_u16();
        let message = truncate(&body);
        warn!("HTTP 错误: status={}, body={}", code, message);

        let err = if code == 406 || code == 429 || is_throttle_body(&body) {
            UploadError::Throttled {
                status: code,
                message,
            }
        } else if code == 401 {
            UploadError::Auth(format!("HTTP 401: {}", message))
        } else {
            UploadError::Http {
                status: code,
                body: message,
            }
        };
        Err(err)
    }
}

/// 解析 JSON 响应体
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

/// 补全协议头并去掉末尾斜杠：//upos-xx.bilivideo.com -> https://upos-xx.bilivideo.com
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http") {
        endpoint.to_string()
    } else {
        format!("https:{}", endpoint)
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
