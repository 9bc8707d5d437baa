pub mod handlers;

use crate::config::AppConfig;
use crate::error::Result;
use crate::service::{AssistantService, InvoiceService, SavingsService, VisionClient};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::*;

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub invoices: Arc<InvoiceService>,
    pub savings: Arc<SavingsService>,
    pub assistant: Arc<AssistantService>,
}

impl AppState {
    pub fn new(config: &AppConfig, pool: PgPool) -> Result<Self> {
        let savings = Arc::new(SavingsService::new(pool.clone()));
        let vision = VisionClient::new(config.vision.clone())?;
        let invoices = Arc::new(InvoiceService::new(pool.clone(), vision, savings.clone()));
        let assistant = Arc::new(AssistantService::new(
            config.assistant.clone(),
            pool.clone(),
        )?);

        Ok(Self {
            pool,
            invoices,
            savings,
            assistant,
        })
    }
}

/// 构建路由
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/db", get(health_db))
        .route("/api/invoices/parse", post(parse_invoice))
        .route("/api/invoices", get(list_invoices))
        .route("/api/invoices/export.csv", get(export_csv))
        .route("/api/invoices/:id", get(get_invoice))
        .route("/api/invoices/:id/savings", post(recompute_savings))
        .route("/api/chat", post(chat))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .with_state(state)
}
