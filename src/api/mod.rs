mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::raft::Consensus;

pub use handlers::{ApiError, AppState};

/// Creates the API router.
pub fn create_router<C: Consensus + 'static>(state: Arc<AppState<C>>) -> Router {
    Router::new()
        .route("/doracle", post(handlers::allocate::<C>))
        .route("/join", post(handlers::join::<C>))
        .route("/health", get(handlers::health_check::<C>))
        .with_state(state)
}

/// Binds `addr` and serves the API until `shutdown` resolves.
pub async fn start_server<C, F>(
    addr: SocketAddr,
    state: Arc<AppState<C>>,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    C: Consensus + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serves the API on an already bound listener.
pub async fn serve<C, F>(
    listener: TcpListener,
    state: Arc<AppState<C>>,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    C: Consensus + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("Listening at: http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
