use crate::query::QueryMode;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub service: ServiceConfig,
    pub streams: StreamsConfig,
    pub command: CommandConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.service.validate()?;
        self.streams.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_image_width")]
    pub image_width: u32,
    #[serde(default = "default_image_height")]
    pub image_height: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default)]
    pub default_query: Option<DefaultQuery>,
}

fn default_period_ms() -> u64 {
    100
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_image_width() -> u32 {
    640
}

fn default_image_height() -> u32 {
    480
}

fn default_min_confidence() -> f32 {
    0.85
}

impl ServiceConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn initial_mode(&self) -> QueryMode {
        match &self.default_query {
            Some(DefaultQuery::Label(label)) => QueryMode::Label(label.clone()),
            Some(DefaultQuery::Caption(caption)) => QueryMode::Caption(caption.clone()),
            None => QueryMode::Idle,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(format!(
                "Invalid resolution {}x{}: both dimensions must be positive",
                self.image_width, self.image_height
            ));
        }
        if self.period_ms == 0 {
            return Err("Scheduler period must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!(
                "min_confidence {} is outside [0, 1]",
                self.min_confidence
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultQuery {
    Label(String),
    Caption(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamsConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_input_stream")]
    pub input_stream: String,
    #[serde(default = "default_output_image_stream")]
    pub output_image_stream: String,
    #[serde(default = "default_output_detection_stream")]
    pub output_detection_stream: String,
}

fn default_input_stream() -> String {
    "/image".to_string()
}

fn default_output_image_stream() -> String {
    "/image/annotated".to_string()
}

fn default_output_detection_stream() -> String {
    "/detections".to_string()
}

impl StreamsConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), String> {
        let paths = [
            &self.input_stream,
            &self.output_image_stream,
            &self.output_detection_stream,
        ];
        for path in paths {
            if !path.starts_with('/') {
                return Err(format!("Stream path `{}` must start with `/`", path));
            }
            if path == "/health" || path == "/metrics" {
                return Err(format!("Stream path `{}` is reserved", path));
            }
        }
        if paths[0] == paths[1] || paths[0] == paths[2] || paths[1] == paths[2] {
            return Err("Stream paths must be distinct".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub host: String,
    pub port: u16,
}

impl CommandConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ModelConfig {
    Yolo(YoloConfig),
    Grounding(GroundingConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct YoloConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    pub labels_dir: PathBuf,
    pub labels_file: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_candidate_probability")]
    pub candidate_probability: f32,
}

fn default_model_instances() -> usize {
    1
}

fn default_candidate_probability() -> f32 {
    0.25
}

impl YoloConfig {
    pub fn get_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }

    pub fn get_labels_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.get_model_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_model_path()));
        }
        if !self.get_labels_path().exists() {
            return Err(format!(
                "Labels file not found: {:?}",
                self.get_labels_path()
            ));
        }
        if self.num_instances == 0 {
            return Err("num_instances must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroundingConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    10
}

impl GroundingConfig {
    pub fn get_address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationConfig {
    #[serde(default)]
    pub font_file: Option<PathBuf>,
    #[serde(default = "default_thickness")]
    pub thickness: u32,
}

fn default_thickness() -> u32 {
    2
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_file: None,
            thickness: default_thickness(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No working directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("VQ")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceConfig {
        ServiceConfig {
            period_ms: 100,
            receive_timeout_ms: 1000,
            image_width: 640,
            image_height: 480,
            min_confidence: 0.85,
            default_query: None,
        }
    }

    fn streams() -> StreamsConfig {
        StreamsConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            input_stream: default_input_stream(),
            output_image_stream: default_output_image_stream(),
            output_detection_stream: default_output_detection_stream(),
        }
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let mut cfg = service();
        cfg.image_height = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn confidence_floor_must_be_a_probability() {
        let mut cfg = service();
        cfg.min_confidence = 1.5;
        assert!(cfg.validate().is_err());
        cfg.min_confidence = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stream_paths_must_be_distinct_and_rooted() {
        assert!(streams().validate().is_ok());

        let mut cfg = streams();
        cfg.output_image_stream = cfg.input_stream.clone();
        assert!(cfg.validate().is_err());

        let mut cfg = streams();
        cfg.output_detection_stream = "detections".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_query_selects_initial_mode() {
        let mut cfg = service();
        assert_eq!(cfg.initial_mode(), QueryMode::Idle);
        cfg.default_query = Some(DefaultQuery::Label("person".to_string()));
        assert_eq!(cfg.initial_mode(), QueryMode::Label("person".to_string()));
    }

    #[test]
    fn model_backend_is_selected_by_tag() {
        let yaml = r#"
backend: grounding
host: localhost
port: 50051
"#;
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize::<ModelConfig>()
            .unwrap();

        match cfg {
            ModelConfig::Grounding(grounding) => {
                assert_eq!(grounding.get_address(), "http://localhost:50051");
                assert_eq!(grounding.max_retries, 10);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }
}
