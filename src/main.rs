use anyhow::Context;
use bili_upload_rust::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, UploadRuntime,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// B站多线路视频上传
#[derive(Parser, Debug)]
#[command(name = "bili-upload", version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 使用的账号ID，缺省为配置中的第一个账号
    #[arg(short, long)]
    account: Option<String>,

    /// 批次ID，缺省为当前时间
    #[arg(short, long)]
    batch: Option<String>,

    /// 待上传的文件，按顺序作为 P1、P2 ...
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = AppConfig::load_or_default(&args.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Bili Upload Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));
    config.validate().context("配置校验失败")?;

    let account = match &args.account {
        Some(id) => config
            .account(id)
            .with_context(|| format!("配置中不存在账号: {}", id))?,
        None => config
            .accounts
            .first()
            .context("配置中没有任何上传账号")?,
    };
    let batch_id = args
        .batch
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d%H%M%S").to_string());

    let runtime = UploadRuntime::from_config(&config);

    let mut tickets = Vec::new();
    for (idx, file) in args.files.iter().enumerate() {
        match runtime
            .submit_file(account, file, &batch_id, idx as u32 + 1)
            .await
        {
            Ok(ticket) => tickets.push((file.clone(), ticket)),
            Err(e) => error!("✗ 提交失败: {} ({})", file.display(), e),
        }
    }
    info!(
        "已提交 {} 个文件: account={}, batch={}",
        tickets.len(),
        account.id,
        batch_id
    );

    // 定期输出批次进度
    let progress = runtime.progress().clone();
    let reporter_batch = batch_id.clone();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            for record in progress.list_by_batch(&reporter_batch) {
                info!(
                    "P{} {:?} {}% ({}/{})",
                    record.page,
                    record.state,
                    record.percent,
                    record.chunk_done,
                    record.chunk_total
                );
            }
        }
    });

    let wait_all = async {
        let mut failed = 0usize;
        for (file, ticket) in tickets {
            match ticket.wait().await {
                Ok(result) => info!(
                    "✓ {} -> {} (biz_id={})",
                    file.display(),
                    result.server_filename,
                    result.asset_id
                ),
                Err(e) => {
                    failed += 1;
                    error!("✗ {} 上传失败: {}", file.display(), e);
                }
            }
        }
        failed
    };

    let failed = tokio::select! {
        failed = wait_all => failed,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到 Ctrl+C，取消剩余上传...");
            0
        }
    };

    reporter.abort();
    runtime.shutdown().await;
    info!("上传程序已退出");

    if failed > 0 {
        anyhow::bail!("{} 个文件上传失败", failed);
    }
    Ok(())
}
