mod annotation;
mod command;
mod command_service;
mod detection;
mod frame;
mod grounding_client;
mod model_service;
mod ort_service;
mod pipeline;
mod publisher;
mod query;
mod routes;
mod scheduler;
mod server;
mod telemetry;
mod vocabulary;

pub mod app;
pub mod config;

pub use app::start_app;
