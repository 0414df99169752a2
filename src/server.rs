//! Server entry points: MCP over stdio and the combined HTTP listener
//! (MCP streamable HTTP under `/mcp` plus the maintenance control plane).

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PalaceConfig;
use crate::core::PalaceCore;
use crate::db;
use crate::governance::GovernanceLoop;
use crate::store::Store;
use crate::tools::PalaceTools;

/// Open the store and wire the full component graph.
pub fn build_core(config: PalaceConfig) -> Result<Arc<PalaceCore>> {
    let config = Arc::new(config);
    let db_path = config.resolved_db_path();
    let lock_path = config.migration_lock_path();
    let conn = db::open_database(
        &db_path,
        &db::OpenOptions {
            embedding_dim: config.embedding.dim,
            embedding_model: &config.embedding.model,
            migration_lock_file: &lock_path,
            migration_lock_timeout: Duration::from_secs_f64(
                config.storage.migration_lock_timeout_secs.max(0.0),
            ),
        },
    )?;
    tracing::info!(db = %db_path.display(), "store ready");

    let store = Arc::new(Store::new(conn, Arc::clone(&config)));
    Ok(PalaceCore::new(store))
}

fn start_governance(core: &Arc<PalaceCore>) -> GovernanceLoop {
    GovernanceLoop::spawn(
        Arc::clone(&core.decay),
        Arc::clone(&core.sleep),
        Arc::clone(&core.worker),
    )
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: PalaceConfig) -> Result<()> {
    tracing::info!("starting Memory Palace MCP server on stdio");

    let core = build_core(config)?;
    let governance = start_governance(&core);

    let tools = PalaceTools::new(Arc::clone(&core));
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");
    server.waiting().await?;

    governance.shutdown();
    core.shutdown();
    tracing::info!("MCP server shut down");
    Ok(())
}

/// Start the combined HTTP listener: `/mcp` (streamable HTTP transport) plus
/// the maintenance control plane and browse endpoints.
pub async fn serve_http(config: PalaceConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting Memory Palace HTTP server");

    let core = build_core(config)?;
    let governance = start_governance(&core);

    let mcp_core = Arc::clone(&core);
    let mcp_service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(PalaceTools::new(Arc::clone(&mcp_core))),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = crate::http::control_plane(Arc::clone(&core)).nest_service("/mcp", mcp_service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening — MCP at /mcp, control plane at /maintenance");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        tracing::info!("shutting down HTTP server");
    })
    .await?;

    governance.shutdown();
    core.shutdown();
    Ok(())
}
