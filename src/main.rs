use rental_audit_rust::{create_pool, router, AppConfig, AppState};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式, RUST_LOG 可覆盖级别
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    // 创建数据库连接池
    let pool = create_pool(&config.database).await?;
    info!("Database pool created");

    let state = AppState::new(&config, pool)?;
    let app = router(state, config.server.max_upload_bytes);

    // 启动服务器
    let addr = config.bind_addr();
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices/parse          - 上传发票图片并解析");
    info!("  GET  /api/invoices                - 最近的发票");
    info!("  GET  /api/invoices/:id            - 发票详情");
    info!("  POST /api/invoices/:id/savings    - 重新做市场对比");
    info!("  GET  /api/invoices/export.csv     - CSV 导出");
    info!("  POST /api/chat                    - assistant 聊天");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
