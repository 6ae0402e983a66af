// 配置管理模块

use crate::bili::AccountCredentials;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// API 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 重试策略
    #[serde(default)]
    pub retry: RetrySettings,
    /// 上传账号（仅命令行工具使用）
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 预上传接口所在站点
    #[serde(default = "default_member_base_url")]
    pub member_base_url: String,
    /// 默认上传线路
    #[serde(default = "default_line")]
    pub default_line: String,
    /// 每个账号的队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 进度记录无更新多久后过期（秒）
    #[serde(default = "default_progress_expire_secs")]
    pub progress_expire_secs: u64,
    /// 上传成功后进度记录保留多久（毫秒），给轮询方看到 100%
    #[serde(default = "default_success_linger_ms")]
    pub success_linger_ms: u64,
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 全局上传限速（MB/s），0 表示不限速
    #[serde(default)]
    pub speed_limit_mbps: f64,
    /// 单文件允许的最大分片数，超过需要先切分文件
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: u64,
}

fn default_member_base_url() -> String {
    "https://member.bilibili.com".to_string()
}

fn default_line() -> String {
    "cs_bda2".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_progress_expire_secs() -> u64 {
    10 * 60
}

fn default_success_linger_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_chunks_per_file() -> u64 {
    10_000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            member_base_url: default_member_base_url(),
            default_line: default_line(),
            queue_capacity: default_queue_capacity(),
            progress_expire_secs: default_progress_expire_secs(),
            success_linger_ms: default_success_linger_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            speed_limit_mbps: 0.0,
            max_chunks_per_file: default_max_chunks_per_file(),
        }
    }
}

impl UploadConfig {
    pub fn progress_expire(&self) -> Duration {
        Duration::from_secs(self.progress_expire_secs)
    }

    pub fn success_linger(&self) -> Duration {
        Duration::from_millis(self.success_linger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 单个令牌桶规则：每 interval_ms 发放一个令牌，最多累积 burst 个
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub interval_ms: u64,
    pub burst: u32,
}

impl LimitRule {
    pub const fn new(interval_ms: u64, burst: u32) -> Self {
        Self { interval_ms, burst }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// API 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 预上传：1 次/秒
    #[serde(default = "default_negotiate_rule")]
    pub negotiate: LimitRule,
    /// 分片上传：间隔 350ms，突发 3
    #[serde(default = "default_chunk_rule")]
    pub chunk_transfer: LimitRule,
    /// 合并/投稿：5 次/分钟
    #[serde(default = "default_finalize_rule")]
    pub finalize: LimitRule,
    /// 弹幕：22 秒 1 条
    #[serde(default = "default_danmaku_rule")]
    pub danmaku: LimitRule,
    /// 通用：2 次/秒
    #[serde(default = "default_general_rule")]
    pub general: LimitRule,
}

fn default_negotiate_rule() -> LimitRule {
    LimitRule::new(1_000, 1)
}

fn default_chunk_rule() -> LimitRule {
    LimitRule::new(350, 3)
}

fn default_finalize_rule() -> LimitRule {
    LimitRule::new(12_000, 5)
}

fn default_danmaku_rule() -> LimitRule {
    LimitRule::new(22_000, 1)
}

fn default_general_rule() -> LimitRule {
    LimitRule::new(500, 2)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            negotiate: default_negotiate_rule(),
            chunk_transfer: default_chunk_rule(),
            finalize: default_finalize_rule(),
            danmaku: default_danmaku_rule(),
            general: default_general_rule(),
        }
    }
}

impl RateLimitConfig {
    fn rules(&self) -> [(&'static str, &LimitRule); 5] {
        [
            ("negotiate", &self.negotiate),
            ("chunk_transfer", &self.chunk_transfer),
            ("finalize", &self.finalize),
            ("danmaku", &self.danmaku),
            ("general", &self.general),
        ]
    }
}

/// 两套重试策略：默认（短）与限流（长）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetryPolicy::default_policy")]
    pub default: RetryPolicy,
    #[serde(default = "RetryPolicy::rate_limit")]
    pub rate_limit: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            default: RetryPolicy::default_policy(),
            rate_limit: RetryPolicy::rate_limit(),
        }
    }
}

/// 上传账号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// 账号标识（队列按此串行）
    pub id: String,
    /// B站 UID
    #[serde(default)]
    pub uid: u64,
    /// APP 端 access_key
    #[serde(default)]
    pub access_key: String,
    /// Web 端 Cookie（SESSDATA=...; bili_jct=...）
    #[serde(default)]
    pub cookies: String,
    /// 该账号使用的上传线路，为空时使用 upload.default_line
    #[serde(default)]
    pub line: Option<String>,
}

impl AccountConfig {
    pub fn credentials(&self) -> AccountCredentials {
        AccountCredentials::new(self.uid, &self.access_key, &self.cookies)
    }
}

impl AppConfig {
    /// 检查明显不合理的配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.queue_capacity == 0 {
            anyhow::bail!("upload.queue_capacity 必须大于 0");
        }
        if self.upload.max_chunks_per_file == 0 {
            anyhow::bail!("upload.max_chunks_per_file 必须大于 0");
        }
        for (name, rule) in self.rate_limit.rules() {
            if rule.burst == 0 {
                anyhow::bail!("rate_limit.{}.burst 必须大于 0", name);
            }
        }
        for (name, policy) in [
            ("default", &self.retry.default),
            ("rate_limit", &self.retry.rate_limit),
        ] {
            if policy.backoff_factor < 1.0 {
                anyhow::bail!("retry.{}.backoff_factor 不能小于 1.0", name);
            }
            if policy.max_delay_ms < policy.initial_delay_ms {
                anyhow::bail!("retry.{}.max_delay_ms 不能小于 initial_delay_ms", name);
            }
        }
        Ok(())
    }

    /// 查找账号
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写出
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }
                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.queue_capacity, 100);
        assert_eq!(config.upload.progress_expire(), Duration::from_secs(600));
        assert_eq!(config.upload.success_linger(), Duration::from_secs(1));
        assert_eq!(config.rate_limit.chunk_transfer, LimitRule::new(350, 3));
        assert_eq!(config.retry.default.max_retries, 3);
        assert_eq!(config.retry.rate_limit.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [upload]
            default_line = "kodo"
            speed_limit_mbps = 4.0

            [rate_limit.negotiate]
            interval_ms = 2000
            burst = 1

            [[accounts]]
            id = "main"
            uid = 10086
            cookies = "SESSDATA=abc; bili_jct=def"
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.upload.default_line, "kodo");
        assert_eq!(config.upload.queue_capacity, 100);
        assert_eq!(config.rate_limit.negotiate.interval_ms, 2000);
        assert_eq!(config.rate_limit.general, LimitRule::new(500, 2));
        assert_eq!(config.account("main").unwrap().uid, 10086);
        assert!(config.account("other").is_none());
        assert!(config.log.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.upload.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rate_limit.finalize.burst = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.default.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.default_line = "cs_tx".to_string();
        config.retry.default.max_retries = 7;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.default_line, "cs_tx");
        assert_eq!(loaded.retry.default.max_retries, 7);
        assert_eq!(loaded.retry.default.retryable_errors.len(), 11);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.upload.queue_capacity, 100);
        assert!(std::path::Path::new(path).exists());
    }
}
