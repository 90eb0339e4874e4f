use crate::{
    annotation::Annotator,
    command::CommandInterpreter,
    command_service::CommandEndpoint,
    config::{Config, ModelConfig},
    frame::{FrameStore, Resolution},
    grounding_client::GroundingClient,
    model_service::{Backend, Capabilities, ModelService},
    ort_service::OrtModelService,
    pipeline::VisionCore,
    publisher::StreamPublisher,
    query::{QueryMode, QueryState},
    scheduler::Scheduler,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use query_proto::command_service_server::CommandServiceServer;
use std::{error::Error, net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};
use tonic::transport::Server;

async fn build_backend(config: &ModelConfig) -> Result<Backend, Box<dyn Error>> {
    match config {
        ModelConfig::Yolo(yolo) => {
            let service = OrtModelService::new(yolo).inspect_err(|e| {
                tracing::error!("Failed to initialize ort model service: {:?}", e)
            })?;
            Ok(Backend::Yolo(service))
        }
        ModelConfig::Grounding(grounding) => {
            let client = GroundingClient::new(grounding).await.inspect_err(|e| {
                tracing::error!("Failed to initialize grounding client: {:?}", e)
            })?;
            Ok(Backend::Grounding(client))
        }
    }
}

/// Checks the configured startup query against what the backend can answer.
fn resolve_initial_mode(mode: QueryMode, capabilities: &Capabilities) -> Result<QueryMode, String> {
    match (mode, capabilities) {
        (QueryMode::Idle, _) => Ok(QueryMode::Idle),
        (QueryMode::Label(label), Capabilities::FixedVocabulary(vocabulary)) => {
            if vocabulary.contains(&label) {
                Ok(QueryMode::Label(label))
            } else {
                Err(format!("Default label `{}` is not in the vocabulary", label))
            }
        }
        (QueryMode::Caption(caption), Capabilities::FixedVocabulary(_)) => Err(format!(
            "Default caption `{}` needs a caption backend",
            caption
        )),
        (QueryMode::Label(text) | QueryMode::Caption(text), Capabilities::Caption) => {
            Ok(QueryMode::Caption(text))
        }
    }
}

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let backend = build_backend(&config.model).await?;
    let capabilities = backend.capabilities();

    let initial_mode = resolve_initial_mode(config.service.initial_mode(), &capabilities)?;
    tracing::info!("Starting with query {}", initial_mode);

    let vocabulary = match &capabilities {
        Capabilities::FixedVocabulary(vocabulary) => Some(vocabulary.clone()),
        Capabilities::Caption => None,
    };
    let mut annotator = Annotator::new(vocabulary, config.annotation.thickness);
    if let Some(font_file) = &config.annotation.font_file {
        annotator = annotator.with_font_file(font_file).inspect_err(|e| {
            tracing::error!("Failed to load font {:?}: {}", font_file, e)
        })?;
    }

    let frames = Arc::new(FrameStore::new(Resolution::new(
        config.service.image_width,
        config.service.image_height,
    )));
    let metrics = Arc::new(Metrics::new());
    let publisher = StreamPublisher::new();
    let core = Arc::new(VisionCore::new(
        frames.clone(),
        Arc::new(QueryState::new(initial_mode, config.service.min_confidence)),
        Arc::new(backend),
        annotator,
        publisher.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, mut quit_rx) = broadcast::channel(1);

    let http_server = HttpServer::new(
        SharedState {
            frames,
            publisher,
            metrics,
            shutdown: shutdown_tx.clone(),
        },
        &config.streams,
    )
    .await?;
    let http_handle = http_server.run(shutdown_tx.subscribe()).await;

    let scheduler_handle = Scheduler::new(
        core.clone(),
        config.service.period(),
        config.service.receive_timeout(),
    )
    .run(shutdown_tx.subscribe());

    let interpreter = CommandInterpreter::new(core.clone()).with_shutdown(shutdown_tx.clone());
    let endpoint = CommandEndpoint::new(Arc::new(interpreter));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<CommandServiceServer<CommandEndpoint<Backend>>>()
        .await;
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(query_proto::FILE_DESCRIPTOR_SET)
        .build_v1alpha()?;

    let command_addr: SocketAddr = config.command.get_address().parse()?;
    tracing::info!("Command service listening on {}", command_addr);
    let grpc_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_tx.subscribe();
        Server::builder()
            .add_service(health_service)
            .add_service(reflection_service)
            .add_service(CommandServiceServer::new(endpoint))
            .serve_with_shutdown(command_addr, async move {
                shutdown_rx.recv().await.ok();
            })
    });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        }
        _ = quit_rx.recv() => {
            tracing::info!("Quit command received, starting graceful shutdown.");
        }
    }

    core.close();
    let _ = shutdown_tx.send(());

    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    match grpc_handle.await {
        Ok(Err(e)) => tracing::error!("Command service failed: {}", e),
        Err(e) => tracing::error!("Command service task failed: {}", e),
        Ok(Ok(())) => {}
    }
    match http_handle.await {
        Ok(Err(e)) => tracing::error!("Stream server failed: {}", e),
        Err(e) => tracing::error!("Stream server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("Visual query service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::testing::coco_subset;

    #[test]
    fn default_label_must_be_in_vocabulary() {
        let capabilities = Capabilities::FixedVocabulary(coco_subset());

        assert_eq!(
            resolve_initial_mode(QueryMode::Label("cup".to_string()), &capabilities),
            Ok(QueryMode::Label("cup".to_string()))
        );
        assert!(resolve_initial_mode(QueryMode::Label("spaceship".to_string()), &capabilities).is_err());
        assert!(resolve_initial_mode(QueryMode::Caption("a cup".to_string()), &capabilities).is_err());
    }

    #[test]
    fn caption_backend_takes_any_default_text_as_caption() {
        assert_eq!(
            resolve_initial_mode(QueryMode::Label("red mug".to_string()), &Capabilities::Caption),
            Ok(QueryMode::Caption("red mug".to_string()))
        );
        assert_eq!(
            resolve_initial_mode(QueryMode::Idle, &Capabilities::Caption),
            Ok(QueryMode::Idle)
        );
    }
}
