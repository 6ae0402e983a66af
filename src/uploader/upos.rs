// UPOS 分片直传
//
// 流程：预上传 -> 选择线路节点 -> 线路初始化（?uploads）-> PUT 分片 -> 合并
// 分片 5MB，序号从 1 开始，鉴权头 X-Upos-Auth

use super::backend::{
    ensure_preupload_ok, file_stem, BackendProfile, FileHashTiming, PreUploadSession,
    TransferReceipt, UploadBackend, UploadContext,
};
use super::chunk::{ChunkPlan, UploadChunk};
use super::task::UploadResult;
use crate::bili::client::{decode, normalize_endpoint};
use crate::bili::{parse_line_params, CompletePart, LineUploadResponse, OkResponse};
use crate::error::{Result, UploadError};
use crate::limiter::ApiClass;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::info;

/// 合并请求中每个分片的 eTag
///
/// 分片 PUT 的响应里没有可用的 eTag，沿用平台网页端提交的固定值
pub const PART_ETAG_PLACEHOLDER: &str = "etag";

const PROBE_VERSION: &str = "20221109";

pub struct UposBackend {
    profile: BackendProfile,
}

impl UposBackend {
    pub fn new() -> Self {
        Self {
            profile: BackendProfile {
                name: "upos",
                chunk_size: 5 * 1024 * 1024,
                index_base: 1,
                auth_header: "X-Upos-Auth",
                auth_prefix: "",
                preupload_r: "upos",
                preupload_profile: "ugcupos/bup",
                version: "2.14.0",
                build: "2140000",
                chunk_hash: false,
                file_hash: FileHashTiming::None,
            },
        }
    }

    fn object_url(&self, session: &PreUploadSession) -> String {
        format!("{}/{}", session.endpoint, session.object_path)
    }
}

impl Default for UposBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// upos://ugcboss/n1.mp4 -> ugcboss/n1.mp4
pub fn object_path(upos_uri: &str) -> &str {
    let path = match upos_uri.strip_prefix("upos://") {
        Some(rest) => rest,
        None => match upos_uri.find('/') {
            Some(idx) if idx + 1 < upos_uri.len() => &upos_uri[idx + 1..],
            _ => upos_uri,
        },
    };
    path.trim_start_matches('/')
}

/// 默认节点不属于目标 CDN 时，从备选节点中挑选
pub fn select_endpoint<'a>(default: &'a str, endpoints: &'a [String], upcdn: &str) -> &'a str {
    let marker = format!("upcdn{}", upcdn);
    if default.contains(&marker) {
        return default;
    }
    endpoints
        .iter()
        .find(|e| e.contains(&marker))
        .map(|e| {
            info!("[UPOS] 已切换endpoint: {}", e);
            e.as_str()
        })
        .unwrap_or(default)
}

#[async_trait]
impl UploadBackend for UposBackend {
    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn negotiate(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        file_size: u64,
    ) -> Result<PreUploadSession> {
        let (zone, upcdn) = parse_line_params(ctx.client.line());
        info!(
            "[UPOS] 开始预上传: file={}, size={}, line={}, zone={}, upcdn={}",
            file_name,
            file_size,
            ctx.client.line(),
            zone,
            upcdn
        );

        let mut params = self.profile.preupload_params(file_name, file_size);
        params.push(("zone", zone.clone()));
        params.push(("upcdn", upcdn.clone()));
        params.push(("probe_version", PROBE_VERSION.to_string()));
        let referer = format!("?os=upos&zone={}&upcdn={}", zone, upcdn);

        let (params, referer) = (&params, referer.as_str());
        let pre = ctx
            .call(ApiClass::Negotiate, || async move {
                let resp = ctx.client.preupload(params, Some(referer)).await?;
                ensure_preupload_ok(resp)
            })
            .await?;

        let path = object_path(&pre.upos_uri);
        if path.is_empty() {
            return Err(UploadError::NegotiationFailed("upos_uri 为空或无效".to_string()));
        }

        let endpoint = normalize_endpoint(select_endpoint(&pre.endpoint, &pre.endpoints, &upcdn));
        let mut session = PreUploadSession {
            auth: pre.auth.clone(),
            endpoint,
            upload_id: pre.upload_id.clone(),
            object_path: path.to_string(),
            object_key: String::new(),
            asset_id: pre.biz_id,
            server_filename: pre.bili_filename.clone(),
            file_name: file_name.to_string(),
        };
        info!(
            "[UPOS] 预上传成功: biz_id={}, endpoint={}",
            session.asset_id, session.endpoint
        );

        // 线路初始化，拿到 upload_id
        let init_url = format!("{}?uploads&output=json", self.object_url(&session));
        let (init_url, auth) = (init_url.as_str(), session.auth.as_str());
        let line = ctx
            .call(ApiClass::General, || async move {
                let request = ctx
                    .client
                    .http()
                    .post(init_url)
                    .header(self.profile.auth_header, auth);
                let resp: LineUploadResponse = decode(&ctx.client.send(request).await?)?;
                if resp.ok != 1 {
                    return Err(UploadError::NegotiationFailed(format!(
                        "线路上传初始化返回失败: OK={}",
                        resp.ok
                    )));
                }
                Ok(resp)
            })
            .await?;

        info!("[UPOS] 线路上传初始化成功: upload_id={}", line.upload_id);
        session.upload_id = line.upload_id;
        session.object_key = line.key;
        Ok(session)
    }

    async fn send_chunk(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        plan: &ChunkPlan,
        chunk: &UploadChunk,
        data: &[u8],
        _checksum: Option<&str>,
    ) -> Result<String> {
        let size = data.len() as u64;
        let start = chunk.range.start;
        let end = start + size.saturating_sub(1);

        let request = ctx
            .client
            .http()
            .put(self.object_url(session))
            .query(&[
                ("partNumber", chunk.seq.to_string()),
                ("uploadId", session.upload_id.clone()),
                ("chunk", chunk.index.to_string()),
                ("chunks", plan.chunk_count().to_string()),
                ("size", size.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("total", plan.total_size().to_string()),
            ])
            .header(self.profile.auth_header, session.auth.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());

        ctx.client.send(request).await?;
        Ok(String::new())
    }

    async fn finalize(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        receipt: &TransferReceipt,
        _file_size: u64,
    ) -> Result<UploadResult> {
        info!("[UPOS] 开始合并分片: total_parts={}", receipt.chunk_count);

        let parts: Vec<CompletePart> = (1..=receipt.chunk_count)
            .map(|part_number| CompletePart {
                part_number,
                etag: PART_ETAG_PLACEHOLDER.to_string(),
            })
            .collect();
        let body = serde_json::json!({ "parts": parts });
        let params = [
            ("output", "json".to_string()),
            ("name", session.server_filename.clone()),
            ("profile", self.profile.preupload_profile.to_string()),
            ("uploadId", session.upload_id.clone()),
            ("biz_id", session.asset_id.to_string()),
        ];

        let (params, body) = (&params, &body);
        ctx.call(ApiClass::Finalize, || async move {
            let request = ctx
                .client
                .http()
                .post(self.object_url(session))
                .query(params)
                .header(self.profile.auth_header, session.auth.as_str())
                .json(body);
            let resp: OkResponse = decode(&ctx.client.send(request).await?)?;
            if resp.is_ok() {
                Ok(())
            } else {
                Err(UploadError::CompletionFailed(format!(
                    "合并分片返回失败: OK={:?}",
                    resp.ok
                )))
            }
        })
        .await?;

        let server_filename = match file_stem(&session.object_key) {
            "" => session.file_name.clone(),
            stem => stem.to_string(),
        };
        info!(
            "[UPOS] 上传完成: file={}, biz_id={}, server_filename={}",
            session.file_name, session.asset_id, server_filename
        );

        Ok(UploadResult {
            asset_id: session.asset_id,
            server_filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::test_support::{context, write_temp_file, TestProgress};
    use mockito::Matcher;
    use std::sync::Arc;
    use tokio::fs::File;

    #[test]
    fn test_object_path() {
        assert_eq!(object_path("upos://ugcboss/n1.mp4"), "ugcboss/n1.mp4");
        assert_eq!(object_path("upos:/ugcever/x.flv"), "ugcever/x.flv");
        assert_eq!(object_path("/ugcbup/x.mp4"), "ugcbup/x.mp4");
        assert_eq!(object_path(""), "");
    }

    #[test]
    fn test_select_endpoint() {
        let endpoints = vec![
            "//upos-cs-upcdnbda2.bilivideo.com".to_string(),
            "//upos-cs-upcdntx.bilivideo.com".to_string(),
        ];
        assert_eq!(
            select_endpoint("//upos-cs-upcdnbda2.bilivideo.com", &endpoints, "tx"),
            "//upos-cs-upcdntx.bilivideo.com"
        );
        assert_eq!(
            select_endpoint("//upos-cs-upcdnbda2.bilivideo.com", &endpoints, "bda2"),
            "//upos-cs-upcdnbda2.bilivideo.com"
        );
        // 找不到时保留默认节点
        assert_eq!(
            select_endpoint("//upos-cs-upcdnbda2.bilivideo.com", &endpoints, "alia"),
            "//upos-cs-upcdnbda2.bilivideo.com"
        );
    }

    #[tokio::test]
    async fn test_negotiate_rejection_is_retried_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let pre = server
            .mock("GET", "/preupload")
            .match_query(Matcher::Any)
            .with_body(r#"{"OK":0}"#)
            .expect(4)
            .create_async()
            .await;

        let ctx = context(&server.url(), "cs_bda2", Arc::new(TestProgress::default()));
        let err = UposBackend::new()
            .negotiate(&ctx, "a.mp4", 100)
            .await
            .unwrap_err();

        pre.assert_async().await;
        assert!(matches!(err, UploadError::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn test_full_upload_protocol() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let pre_body = serde_json::json!({
            "OK": 1,
            "auth": "upos-auth-token",
            "endpoint": base,
            "endpoints": [base],
            "biz_id": 4242,
            "upos_uri": "upos://ugcboss/n230101abc.mp4",
            "bilifilename": "n230101abc",
        });

        let pre = server
            .mock("GET", "/preupload")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("r".into(), "upos".into()),
                Matcher::UrlEncoded("zone".into(), "cs".into()),
                Matcher::UrlEncoded("upcdn".into(), "bda2".into()),
            ]))
            .match_header("referer", "?os=upos&zone=cs&upcdn=bda2")
            .with_body(pre_body.to_string())
            .create_async()
            .await;
        let init = server
            .mock("POST", "/ugcboss/n230101abc.mp4")
            .match_query(Matcher::Regex("uploads".into()))
            .match_header("x-upos-auth", "upos-auth-token")
            .with_body(r#"{"OK":1,"upload_id":"up-1","key":"/n230101abc.mp4","bucket":"ugc"}"#)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/ugcboss/n230101abc.mp4")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadId".into(), "up-1".into()),
                Matcher::UrlEncoded("chunks".into(), "1".into()),
                Matcher::UrlEncoded("partNumber".into(), "1".into()),
                Matcher::UrlEncoded("end".into(), "99".into()),
            ]))
            .match_header("x-upos-auth", "upos-auth-token")
            .with_body("MULTIPART_PUT_SUCCESS")
            .expect(1)
            .create_async()
            .await;
        let complete = server
            .mock("POST", "/ugcboss/n230101abc.mp4")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadId".into(), "up-1".into()),
                Matcher::UrlEncoded("biz_id".into(), "4242".into()),
            ]))
            .match_body(Matcher::Json(serde_json::json!({
                "parts": [{"partNumber": 1, "eTag": "etag"}]
            })))
            .with_body(r#"{"OK":1}"#)
            .create_async()
            .await;

        let (tmp, _) = write_temp_file(100);
        let ctx = context(&base, "cs_bda2", Arc::new(TestProgress::default()));
        let backend = UposBackend::new();

        let session = backend.negotiate(&ctx, "a.mp4", 100).await.unwrap();
        assert_eq!(session.upload_id, "up-1");

        let plan = ChunkPlan::new(100, backend.profile().chunk_size, 1);
        let mut file = File::open(tmp.path()).await.unwrap();
        let receipt = backend
            .transfer_chunks(&ctx, &session, &mut file, &plan)
            .await
            .unwrap();
        let result = backend.finalize(&ctx, &session, &receipt, 100).await.unwrap();

        pre.assert_async().await;
        init.assert_async().await;
        put.assert_async().await;
        complete.assert_async().await;
        assert_eq!(result.asset_id, 4242);
        assert_eq!(result.server_filename, "n230101abc");
    }
}
