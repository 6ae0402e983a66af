// APP 端小文件上传
//
// 分片 2MB，序号从 0 开始，每个分片带 Content-MD5；
// 上传前先算整文件 MD5，合并时通过查询参数提交。

use super::backend::{
    ensure_preupload_ok, file_stem, BackendProfile, FileHashTiming, PreUploadSession,
    TransferReceipt, UploadBackend, UploadContext,
};
use super::chunk::{ChunkPlan, UploadChunk};
use super::task::UploadResult;
use crate::bili::client::{decode, normalize_endpoint};
use crate::bili::OkResponse;
use crate::error::{Result, UploadError};
use crate::limiter::ApiClass;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::info;

pub struct AppBackend {
    profile: BackendProfile,
}

impl AppBackend {
    pub fn new() -> Self {
        Self {
            profile: BackendProfile {
                name: "app",
                chunk_size: 2 * 1024 * 1024,
                index_base: 0,
                auth_header: "",
                auth_prefix: "",
                preupload_r: "ugcfr/pc3",
                preupload_profile: "ugcfr/pc3",
                version: "2.3.0",
                build: "2030000",
                chunk_hash: true,
                file_hash: FileHashTiming::BeforeTransfer,
            },
        }
    }
}

impl Default for AppBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadBackend for AppBackend {
    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn negotiate(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        file_size: u64,
    ) -> Result<PreUploadSession> {
        info!("[APP] 开始预上传: file={}, size={}", file_name, file_size);

        let params = self.profile.preupload_params(file_name, file_size);
        let params = &params;
        let pre = ctx
            .call(ApiClass::Negotiate, || async move {
                ensure_preupload_ok(ctx.client.preupload(params, None).await?)
            })
            .await?;

        info!("[APP] 预上传成功: biz_id={}", pre.biz_id);
        Ok(PreUploadSession {
            auth: pre.auth,
            endpoint: normalize_endpoint(&pre.endpoint),
            upload_id: pre.upload_id,
            object_path: String::new(),
            object_key: String::new(),
            asset_id: pre.biz_id,
            server_filename: pre.bili_filename,
            file_name: file_name.to_string(),
        })
    }

    async fn send_chunk(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        plan: &ChunkPlan,
        chunk: &UploadChunk,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<String> {
        let mut request = ctx
            .client
            .http()
            .post(&session.endpoint)
            .query(&[
                ("chunk", chunk.seq.to_string()),
                ("chunks", plan.chunk_count().to_string()),
                ("name", session.file_name.clone()),
            ])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());
        if let Some(md5) = checksum {
            request = request.header("Content-MD5", md5);
        }

        ctx.client.send(request).await?;
        Ok(checksum.unwrap_or_default().to_string())
    }

    async fn finalize(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        receipt: &TransferReceipt,
        file_size: u64,
    ) -> Result<UploadResult> {
        let file_md5 = receipt
            .file_md5
            .as_deref()
            .ok_or_else(|| UploadError::Validation("APP 上传缺少文件 MD5".to_string()))?;
        info!(
            "[APP] 开始合并分片: total_chunks={}, md5={}",
            receipt.chunk_count, file_md5
        );

        let params = [
            ("chunks", receipt.chunk_count.to_string()),
            ("filesize", file_size.to_string()),
            ("md5", file_md5.to_string()),
            ("name", session.file_name.clone()),
            ("version", self.profile.version.to_string()),
        ];
        let params = &params;

        ctx.call(ApiClass::Finalize, || async move {
            let request = ctx.client.http().post(&session.endpoint).query(params);
            let resp: OkResponse = decode(&ctx.client.send(request).await?)?;
            if resp.is_ok() {
                Ok(())
            } else {
                Err(UploadError::CompletionFailed(format!(
                    "APP上传未成功: OK={:?}",
                    resp.ok
                )))
            }
        })
        .await?;

        let server_filename = match file_stem(&session.server_filename) {
            "" => session.file_name.clone(),
            stem => stem.to_string(),
        };
        info!(
            "[APP] 上传完成: file={}, biz_id={}",
            session.file_name, session.asset_id
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
    use crate::uploader::chunk::{chunk_md5, file_md5};
    use crate::uploader::test_support::{context, write_temp_file, TestProgress};
    use mockito::Matcher;
    use std::sync::Arc;
    use tokio::fs::File;

    #[tokio::test]
    async fn test_stream_upload_with_hashes() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let (tmp, content) = write_temp_file(3000);
        let whole_md5 = file_md5(tmp.path()).await.unwrap();

        let pre = server
            .mock("GET", "/preupload")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("r".into(), "ugcfr/pc3".into()),
                Matcher::UrlEncoded("version".into(), "2.3.0".into()),
                Matcher::UrlEncoded("build".into(), "2030000".into()),
            ]))
            .with_body(
                serde_json::json!({
                    "OK": 1,
                    "endpoint": format!("{}/ugcfr", base),
                    "biz_id": 5,
                })
                .to_string(),
            )
            .create_async()
            .await;
        let chunk = server
            .mock("POST", "/ugcfr")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("chunk".into(), "0".into()),
                Matcher::UrlEncoded("chunks".into(), "1".into()),
                Matcher::UrlEncoded("name".into(), "c.mp4".into()),
            ]))
            .match_header("content-md5", chunk_md5(&content).as_str())
            .with_body("{}")
            .create_async()
            .await;
        let complete = server
            .mock("POST", "/ugcfr")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filesize".into(), "3000".into()),
                Matcher::UrlEncoded("md5".into(), whole_md5.clone()),
            ]))
            .with_body(r#"{"OK":1}"#)
            .create_async()
            .await;

        let ctx = context(&base, "app", Arc::new(TestProgress::default()));
        let backend = AppBackend::new();
        let session = backend.negotiate(&ctx, "c.mp4", 3000).await.unwrap();

        let plan = ChunkPlan::new(3000, backend.profile().chunk_size, 0);
        let mut file = File::open(tmp.path()).await.unwrap();
        let mut receipt = backend
            .transfer_chunks(&ctx, &session, &mut file, &plan)
            .await
            .unwrap();
        receipt.file_md5 = Some(whole_md5);

        let result = backend.finalize(&ctx, &session, &receipt, 3000).await.unwrap();

        pre.assert_async().await;
        chunk.assert_async().await;
        complete.assert_async().await;
        assert_eq!(result.asset_id, 5);
        // 服务端未改写文件名时使用本地文件名
        assert_eq!(result.server_filename, "c.mp4");
    }

    #[tokio::test]
    async fn test_finalize_requires_file_md5() {
        let ctx = context("http://127.0.0.1:9", "app", Arc::new(TestProgress::default()));
        let err = AppBackend::new()
            .finalize(&ctx, &PreUploadSession::default(), &TransferReceipt::default(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }
}
