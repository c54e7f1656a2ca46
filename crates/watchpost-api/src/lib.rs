//! watchpost-api — read-only JSON API over the check history.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/groups` | List groups with history |
//! | GET | `/api/v1/checks` | Every series, grouped by group and name |
//! | GET | `/api/v1/checks/{group}/{name}` | One series, newest first |
//! | GET | `/api/v1/stats` | Store statistics |
//!
//! All responses use the `{ success, data?, error? }` envelope.

pub mod handlers;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use watchpost_history::HistoryStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: HistoryStore,
    /// Status page title.
    pub name: String,
}

/// Build the API router.
pub fn build_router(store: HistoryStore, name: &str) -> Router {
    let state = ApiState {
        store,
        name: name.to_string(),
    };

    let api_routes = Router::new()
        .route("/groups", get(handlers::list_groups))
        .route("/checks", get(handlers::list_checks))
        .route("/checks/{group}/{name}", get(handlers::get_check))
        .route("/stats", get(handlers::get_stats))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// Serve `router` on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "API server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
