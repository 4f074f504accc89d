//! HTTP API 服务模块
//!
//! 提供运维与查询接口：路由状态/刷新/强制切换、缓存统计、变更通知、指标查询

pub mod handlers;
pub mod models;
pub mod routes;

use actix_web::{middleware, web, App, HttpServer as ActixHttpServer};
use std::io;
use std::sync::Arc;

use handlers::AppState;

/// HTTP 服务器
pub struct HttpServer {
    app_state: Arc<AppState>,
    bind_address: String,
}

impl HttpServer {
    pub fn new(app_state: Arc<AppState>, bind_address: String) -> Self {
        Self {
            app_state,
            bind_address,
        }
    }

    /// 启动 HTTP 服务器
    pub async fn run(self) -> io::Result<()> {
        log::info!("Starting HTTP server at {}", self.bind_address);

        let app_state = self.app_state.clone();

        ActixHttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .app_data(web::JsonConfig::default().limit(1 << 20))
                .wrap(middleware::Logger::default())
                .configure(routes::configure)
        })
        .bind(&self.bind_address)?
        .run()
        .await
    }
}
