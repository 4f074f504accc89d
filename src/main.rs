//! QAReport 报表查询服务
//!
//! 集成功能：
//! 1. 汇总表增量同步 (工作线程池)
//! 2. 日期分区迁移 (后台线程)
//! 3. 查询路由 (ROLLUP / PARTITION)
//! 4. HTTP 运维接口 + Prometheus 指标
//!
//! 运行: cargo run --bin qareport-server -- --config config/report.toml

use anyhow::Context;
use qareport::observability::metrics;
use qareport::service::http::HttpServer;
use qareport::service::ReportService;
use qareport::utils::config::ReportConfig;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "config/report.toml";

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 命令行参数
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut http_override = None;
    for i in 0..args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                }
            }
            "--http" | "-h" => {
                if i + 1 < args.len() {
                    http_override = Some(args[i + 1].clone());
                }
            }
            _ => {}
        }
    }

    // 1. 加载配置
    let config = ReportConfig::load_or_default(&config_path);
    log::info!("Configuration loaded from {}", config_path);
    log::info!("  Schemas: {}", config.schemas.len());
    log::info!("  Switch threshold: {}", config.router.switch_threshold);
    log::info!("  Partition root: {}", config.partition.root.display());

    let http_enabled = config.http.enabled;
    let bind_address = http_override.unwrap_or_else(|| config.http.bind_address());

    // 2. 指标
    metrics::init_metrics();

    // 3. 组装并启动服务
    let service = Arc::new(ReportService::build(config).context("failed to build report service")?);
    service.start().context("failed to start report service")?;

    // 4. HTTP
    if http_enabled {
        HttpServer::new(service.clone(), bind_address)
            .run()
            .await
            .context("HTTP server failed")?;
    } else {
        log::info!("HTTP disabled, running background workers until stdin closes");
        let (tx, rx) = crossbeam::channel::bounded::<()>(1);
        wait_for_stdin_close(tx);
        let _ = rx.recv();
    }

    service.shutdown();
    log::info!("QAReport server stopped");
    Ok(())
}

/// 无 HTTP 时阻塞主线程，直到标准输入关闭
fn wait_for_stdin_close(tx: crossbeam::channel::Sender<()>) {
    std::thread::spawn(move || {
        let mut sink = String::new();
        while let Ok(n) = std::io::stdin().read_line(&mut sink) {
            if n == 0 {
                break;
            }
            sink.clear();
        }
        let _ = tx.send(());
    });
}
