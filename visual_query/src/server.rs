use crate::{
    config::StreamsConfig, frame::FrameStore, publisher::StreamPublisher, routes::api_routes,
    telemetry::Metrics,
};
use axum::Router;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::broadcast::{Receiver, Sender},
    task::JoinHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub frames: Arc<FrameStore>,
    pub publisher: StreamPublisher,
    pub metrics: Arc<Metrics>,
    pub shutdown: Sender<()>,
}

/// Serves the input stream, both output streams, health and metrics.
pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &StreamsConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let router = Router::new().merge(api_routes(config)).with_state(state);

        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Stream server listening on {}", addr),
            Err(e) => tracing::warn!("Stream server address unknown: {}", e),
        }

        let listener = self.listener;
        let router = self.router;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            tracing::info!("Stream server stopped");
            Ok(())
        })
    }
}
