//! HTTP API 路由配置

use super::handlers;
use actix_web::web;

/// 配置所有路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // 健康检查
        .route("/health", web::get().to(handlers::health_check))
        // Prometheus
        .route("/metrics", web::get().to(handlers::prometheus_metrics))
        // 查询
        .service(
            web::scope("/api/query")
                .route("", web::post().to(handlers::query))
                .route("/verify", web::post().to(handlers::verify)),
        )
        // 路由运维
        .service(
            web::scope("/api/router")
                .route("/status", web::get().to(handlers::router_status))
                .route("/refresh", web::post().to(handlers::router_refresh))
                .route("/force/{engine}", web::post().to(handlers::router_force)),
        )
        // 同步与缓存
        .route("/api/mutations", web::post().to(handlers::notify_mutations))
        .route("/api/sync/stats", web::get().to(handlers::sync_stats))
        .route("/api/cache/stats", web::get().to(handlers::cache_stats));
}
