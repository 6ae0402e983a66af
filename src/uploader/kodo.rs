// 七牛 Kodo 块上传
//
// 每个分片通过 mkblk 创建一个块并返回 ctx，最后 mkfile 按顺序提交全部 ctx 拼接成文件。
// 分片 4MB，序号从 0 开始，鉴权头 Authorization: UpToken <auth>

use super::backend::{
    ensure_preupload_ok, file_stem, BackendProfile, FileHashTiming, PreUploadSession,
    TransferReceipt, UploadBackend, UploadContext,
};
use super::chunk::{ChunkPlan, UploadChunk};
use super::task::UploadResult;
use crate::bili::client::{decode, normalize_endpoint};
use crate::bili::{KodoBlockResponse, OkResponse};
use crate::error::{Result, UploadError};
use crate::limiter::ApiClass;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::info;

pub struct KodoBackend {
    profile: BackendProfile,
}

impl KodoBackend {
    pub fn new() -> Self {
        Self {
            profile: BackendProfile {
                name: "kodo",
                chunk_size: 4 * 1024 * 1024,
                index_base: 0,
                auth_header: "Authorization",
                auth_prefix: "UpToken ",
                preupload_r: "kodo",
                preupload_profile: "ugcupos/bupfetch",
                version: "2.14.0",
                build: "2140000",
                chunk_hash: false,
                file_hash: FileHashTiming::None,
            },
        }
    }
}

impl Default for KodoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadBackend for KodoBackend {
    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn negotiate(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        file_size: u64,
    ) -> Result<PreUploadSession> {
        info!("[KODO] 开始预上传: file={}, size={}", file_name, file_size);

        let params = self.profile.preupload_params(file_name, file_size);
        let params = &params;
        let pre = ctx
            .call(ApiClass::Negotiate, || async move {
                ensure_preupload_ok(ctx.client.preupload(params, None).await?)
            })
            .await?;

        info!("[KODO] 预上传成功: biz_id={}", pre.biz_id);
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
        _plan: &ChunkPlan,
        _chunk: &UploadChunk,
        data: &[u8],
        _checksum: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}/mkblk/{}", session.endpoint, data.len());
        let request = ctx
            .client
            .http()
            .post(url)
            .header(self.profile.auth_header, self.profile.auth_value(&session.auth))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());

        let resp: KodoBlockResponse = decode(&ctx.client.send(request).await?)?;
        if resp.ctx.is_empty() {
            return Err(UploadError::Decode("mkblk 响应缺少 ctx".to_string()));
        }
        Ok(resp.ctx)
    }

    async fn finalize(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        receipt: &TransferReceipt,
        file_size: u64,
    ) -> Result<UploadResult> {
        info!("[KODO] 开始合并分片: total_chunks={}", receipt.chunk_count);

        let url = format!(
            "{}/mkfile/{}/key/{}",
            session.endpoint, file_size, session.server_filename
        );
        let body = receipt.part_tags.join(",");
        let (url, body) = (url.as_str(), body.as_str());

        ctx.call(ApiClass::Finalize, || async move {
            let request = ctx
                .client
                .http()
                .post(url)
                .header(self.profile.auth_header, self.profile.auth_value(&session.auth))
                .header(CONTENT_TYPE, "text/plain")
                .body(body.to_string());
            let text = ctx.client.send(request).await?;
            // mkfile 成功时返回 key/hash，没有 OK 字段
            let resp: OkResponse = decode(&text).unwrap_or_default();
            let has_key = resp.key.as_deref().is_some_and(|k| !k.is_empty());
            if resp.is_ok() || has_key {
                Ok(())
            } else {
                Err(UploadError::CompletionFailed(format!(
                    "mkfile 返回失败: {}",
                    text
                )))
            }
        })
        .await?;

        let server_filename = match file_stem(&session.server_filename) {
            "" => session.file_name.clone(),
            stem => stem.to_string(),
        };
        info!(
            "[KODO] 上传完成: file={}, biz_id={}",
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
    use crate::uploader::test_support::{context, write_temp_file, TestProgress};
    use mockito::Matcher;
    use std::sync::Arc;
    use tokio::fs::File;

    const MB: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_block_upload_and_mkfile() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let size = 4 * MB + 10;

        let pre = server
            .mock("GET", "/preupload")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("r".into(), "kodo".into()),
                Matcher::UrlEncoded("profile".into(), "ugcupos/bupfetch".into()),
            ]))
            .with_body(
                serde_json::json!({
                    "OK": 1,
                    "auth": "kodo-token",
                    "endpoint": base,
                    "biz_id": 77,
                    "bilifilename": "n2401kodo",
                })
                .to_string(),
            )
            .create_async()
            .await;
        let block0 = server
            .mock("POST", format!("/mkblk/{}", 4 * MB).as_str())
            .match_header("authorization", "UpToken kodo-token")
            .with_body(r#"{"ctx":"ctx-0"}"#)
            .create_async()
            .await;
        let block1 = server
            .mock("POST", "/mkblk/10")
            .match_header("authorization", "UpToken kodo-token")
            .with_body(r#"{"ctx":"ctx-1"}"#)
            .create_async()
            .await;
        let mkfile = server
            .mock("POST", format!("/mkfile/{}/key/n2401kodo", size).as_str())
            .match_body("ctx-0,ctx-1")
            .with_body(r#"{"key":"n2401kodo","hash":"abc"}"#)
            .create_async()
            .await;

        let (tmp, _) = write_temp_file(size);
        let ctx = context(&base, "kodo", Arc::new(TestProgress::default()));
        let backend = KodoBackend::new();

        let session = backend.negotiate(&ctx, "b.flv", size as u64).await.unwrap();
        let plan = ChunkPlan::new(size as u64, backend.profile().chunk_size, 0);
        let mut file = File::open(tmp.path()).await.unwrap();
        let receipt = backend
            .transfer_chunks(&ctx, &session, &mut file, &plan)
            .await
            .unwrap();
        assert_eq!(receipt.part_tags, vec!["ctx-0", "ctx-1"]);

        let result = backend
            .finalize(&ctx, &session, &receipt, size as u64)
            .await
            .unwrap();

        pre.assert_async().await;
        block0.assert_async().await;
        block1.assert_async().await;
        mkfile.assert_async().await;
        assert_eq!(result.asset_id, 77);
        assert_eq!(result.server_filename, "n2401kodo");
    }

    #[tokio::test]
    async fn test_mkfile_without_key_fails() {
        let mut server = mockito::Server::new_async().await;
        let mkfile = server
            .mock("POST", "/mkfile/10/key/n1")
            .with_body(r#"{"error":"bad ctx"}"#)
            .expect(4)
            .create_async()
            .await;

        let ctx = context(&server.url(), "kodo", Arc::new(TestProgress::default()));
        let session = PreUploadSession {
            endpoint: server.url(),
            server_filename: "n1".into(),
            ..Default::default()
        };
        let receipt = TransferReceipt {
            chunk_count: 1,
            part_tags: vec!["ctx-0".into()],
            file_md5: None,
        };

        let err = KodoBackend::new()
            .finalize(&ctx, &session, &receipt, 10)
            .await
            .unwrap_err();

        mkfile.assert_async().await;
        assert!(matches!(err, UploadError::CompletionFailed(_)));
    }
}
