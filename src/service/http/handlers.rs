//! HTTP API 请求处理器

use actix_web::{http::StatusCode, web, HttpResponse, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::models::*;
use crate::observability::metrics;
use crate::router::{Engine, MetricRequest};
use crate::service::ReportService;
use crate::ReportError;

/// 应用状态
pub type AppState = ReportService;

fn error_response(error: &ReportError) -> HttpResponse {
    let code = status_code_of(error);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(ApiResponse::<()>::error(code as u32, error.to_string()))
}

fn blocking_error(e: actix_web::error::BlockingError) -> HttpResponse {
    log::error!("Blocking task failed: {}", e);
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(500, e.to_string()))
}

/// 健康检查
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "qareport",
        "engine": state.status().engine,
    }))
}

/// 路由状态
pub async fn router_status(state: web::Data<Arc<AppState>>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ApiResponse::success(state.status())))
}

/// 重新评估引擎 (清除强制指定)
pub async fn router_refresh(state: web::Data<Arc<AppState>>) -> Result<HttpResponse> {
    match state.refresh() {
        Ok(engine) => {
            log::info!("Router refreshed via HTTP: {}", engine);
            Ok(HttpResponse::Ok().json(ApiResponse::success(EngineResponse {
                engine: engine.to_string(),
                forced: false,
            })))
        }
        Err(e) => {
            log::error!("Router refresh failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// 强制指定引擎
pub async fn router_force(
    engine: web::Path<String>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse> {
    let engine: Engine = match engine.parse() {
        Ok(engine) => engine,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(400, e)));
        }
    };

    match state.force(engine) {
        Ok(()) => Ok(HttpResponse::Ok().json(ApiResponse::success(EngineResponse {
            engine: engine.to_string(),
            forced: true,
        }))),
        Err(e) => {
            log::warn!("Force engine {} rejected: {}", engine, e);
            Ok(error_response(&e))
        }
    }
}

/// 缓存统计
pub async fn cache_stats(state: web::Data<Arc<AppState>>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ApiResponse::success(state.cache_stats())))
}

/// 同步统计
pub async fn sync_stats(state: web::Data<Arc<AppState>>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ApiResponse::success(state.sync_stats())))
}

/// 变更通知 (异步重建)
pub async fn notify_mutations(
    req: web::Json<MutationRequest>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse> {
    let keys: BTreeSet<String> = req.into_inner().keys.into_iter().collect();
    match state.notify_mutation(&keys) {
        Ok(()) => Ok(HttpResponse::Accepted().json(ApiResponse::success(MutationAccepted {
            accepted: keys.len(),
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// 指标查询
pub async fn query(
    req: web::Json<MetricRequest>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse> {
    let request = req.into_inner();
    let service = state.get_ref().clone();

    // 分区读取会阻塞，放到线程池
    let outcome = match web::block(move || service.query(&request)).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(blocking_error(e)),
    };

    match outcome {
        Ok(routed) => Ok(HttpResponse::Ok().json(ApiResponse::success(routed))),
        Err(e) => {
            log::warn!("Query failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// 双引擎校验
pub async fn verify(
    req: web::Json<MetricRequest>,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse> {
    let request = req.into_inner();
    let service = state.get_ref().clone();

    match web::block(move || service.verify(&request)).await {
        Ok(Ok(result)) => Ok(HttpResponse::Ok().json(ApiResponse::success(result))),
        Ok(Err(e)) => Ok(error_response(&e)),
        Err(e) => Ok(blocking_error(e)),
    }
}

/// Prometheus 指标
pub async fn prometheus_metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::export_metrics())
}
