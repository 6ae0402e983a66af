// 上传接口数据类型

use serde::{Deserialize, Serialize};

/// 账号凭证
///
/// Web 端接口使用 Cookie，APP 端接口使用 access_key，二者至少要有一个
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountCredentials {
    /// 账号 UID
    #[serde(default)]
    pub uid: u64,
    /// APP 端 access_key
    #[serde(default)]
    pub access_key: String,
    /// Web 端 Cookie
    #[serde(default)]
    pub cookies: String,
}

impl AccountCredentials {
    pub fn new(uid: u64, access_key: impl Into<String>, cookies: impl Into<String>) -> Self {
        Self {
            uid,
            access_key: access_key.into(),
            cookies: cookies.into(),
        }
    }

    /// 是否带有可用凭证：Cookie 中有 SESSDATA，或有 access_key
    pub fn is_present(&self) -> bool {
        let has_session = self
            .cookie_value("SESSDATA")
            .is_some_and(|v| !v.trim().is_empty());
        has_session || !self.access_key.trim().is_empty()
    }

    /// 从 Cookie 中取指定字段
    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookies.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }
}

/// 预上传响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreUploadResponse {
    #[serde(rename = "OK", default)]
    pub ok: i64,
    /// 上传凭证（UPOS 为 X-Upos-Auth，Kodo 为 UpToken）
    #[serde(default)]
    pub auth: String,
    /// 默认上传地址
    #[serde(default)]
    pub endpoint: String,
    /// 备选上传地址
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// 稿件关联 ID
    #[serde(default)]
    pub biz_id: i64,
    #[serde(default)]
    pub upload_id: String,
    /// upos://ugcboss/xxx.mp4
    #[serde(default)]
    pub upos_uri: String,
    /// 服务端改写后的文件名
    #[serde(rename = "bilifilename", default)]
    pub bili_filename: String,
    /// 出错时的业务码（-101 表示未登录）
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl PreUploadResponse {
    pub fn is_ok(&self) -> bool {
        self.ok == 1
    }

    pub fn is_not_logged_in(&self) -> bool {
        self.code == -101
    }
}

/// UPOS 线路初始化响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineUploadResponse {
    #[serde(rename = "OK", default)]
    pub ok: i64,
    #[serde(default)]
    pub upload_id: String,
    /// 对象 key，形如 /ugcboss/n230101xxx.mp4
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub bucket: String,
}

/// 仅关心 OK 标志的响应（合并分片）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OkResponse {
    #[serde(rename = "OK", default)]
    pub ok: Option<i64>,
    #[serde(default)]
    pub key: Option<String>,
}

impl OkResponse {
    pub fn is_ok(&self) -> bool {
        self.ok == Some(1)
    }
}

/// Kodo mkblk 响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KodoBlockResponse {
    #[serde(default)]
    pub ctx: String,
}

/// UPOS 合并分片请求中的单个分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    #[serde(rename = "partNumber")]
    pub part_number: u64,
    #[serde(rename = "eTag")]
    pub etag: String,
}
