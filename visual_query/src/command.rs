use crate::{
    model_service::{Capabilities, ModelService},
    pipeline::VisionCore,
    query::QueryMode,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandRequest {
    pub verb: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(verb: &str, args: &[&str]) -> Self {
        Self {
            verb: verb.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTag {
    /// The reply carries no content of its own.
    Ack,
    /// The reply is a multi-line listing.
    Many,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandReply {
    pub tag: Option<ReplyTag>,
    pub text: Vec<String>,
}

impl CommandReply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            tag: None,
            text: vec![text.into()],
        }
    }

    fn many(lines: Vec<String>) -> Self {
        Self {
            tag: Some(ReplyTag::Many),
            text: lines,
        }
    }

    /// Empty replies become an explicit acknowledgement.
    fn finish(mut self) -> Self {
        if self.text.is_empty() && self.tag.is_none() {
            self.tag = Some(ReplyTag::Ack);
        }
        self
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("{verb} requires an argument: {verb} <something>")]
    MissingArgument { verb: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Label(String),
    Caption(String),
    Detect,
    Where(String),
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Verbs are case-insensitive; arguments are joined with single spaces so
    /// multi-word labels work with or without quoting.
    pub fn parse(request: &CommandRequest) -> Result<Self, CommandError> {
        let verb = request.verb.trim().to_lowercase();
        let text = request
            .args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let argument = |verb: &'static str| {
            if text.is_empty() {
                Err(CommandError::MissingArgument { verb })
            } else {
                Ok(text.clone())
            }
        };

        Ok(match verb.as_str() {
            "label" => Command::Label(argument("label")?),
            "caption" => Command::Caption(argument("caption")?),
            "where" => Command::Where(argument("where")?),
            "detect" => Command::Detect,
            "help" => Command::Help,
            "quit" => Command::Quit,
            _ => Command::Unknown(request.verb.trim().to_string()),
        })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Label(_) => "label",
            Command::Caption(_) => "caption",
            Command::Detect => "detect",
            Command::Where(_) => "where",
            Command::Help => "help",
            Command::Quit => "quit",
            Command::Unknown(_) => "unknown",
        }
    }
}

/// Validates commands against the backend's capabilities, mutates the query
/// state and builds replies. Each command completes before its reply.
pub struct CommandInterpreter<M: ModelService> {
    core: Arc<VisionCore<M>>,
    capabilities: Capabilities,
    shutdown: Option<broadcast::Sender<()>>,
}

impl<M: ModelService> CommandInterpreter<M> {
    pub fn new(core: Arc<VisionCore<M>>) -> Self {
        let capabilities = core.capabilities();
        Self {
            core,
            capabilities,
            shutdown: None,
        }
    }

    /// Lets `quit` stop the whole service.
    pub fn with_shutdown(mut self, shutdown: broadcast::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn is_closing(&self) -> bool {
        self.core.is_closing()
    }

    pub fn help(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.capabilities.vocabulary().is_some() {
            lines.push("detect : starts detecting everything in the input image".to_string());
        }
        lines.push("label <something> : identify \"something\" in input image".to_string());
        if self.capabilities.supports_caption() {
            lines.push("caption <something> : ground the free-form caption \"something\" in input image".to_string());
        }
        lines.push(
            "where <something> : identify \"something\" in input image and return its pixel coords"
                .to_string(),
        );
        lines.push("quit : stop the service".to_string());
        lines.push("help : get this list".to_string());
        lines
    }

    #[instrument(skip(self), fields(verb = %request.verb))]
    pub async fn handle(&self, request: &CommandRequest) -> CommandReply {
        let command = match Command::parse(request) {
            Ok(command) => command,
            Err(e) => {
                tracing::info!("Rejected command: {}", e);
                return CommandReply::line(e.to_string()).finish();
            }
        };
        tracing::info!("Command '{}' received", command.verb());
        self.core.metrics().record_command(command.verb());

        let reply = match command {
            Command::Label(text) => self.label(text).await,
            Command::Caption(text) => self.caption(text).await,
            Command::Detect => self.detect().await,
            Command::Where(text) => self.locate(text).await,
            Command::Help => CommandReply::many(self.help()),
            Command::Quit => self.quit(),
            Command::Unknown(verb) => {
                tracing::info!("Command {} not recognized", verb);
                CommandReply::line(format!("Command {} not recognized", verb))
            }
        };

        reply.finish()
    }

    /// Maps query text to a mode the backend can serve, or explains why not.
    fn resolve(&self, text: String) -> Result<QueryMode, String> {
        match &self.capabilities {
            Capabilities::FixedVocabulary(vocabulary) => {
                if vocabulary.contains(&text) {
                    Ok(QueryMode::Label(text))
                } else {
                    Err(format!("cannot label (not in the available list): {}", text))
                }
            }
            Capabilities::Caption => Ok(QueryMode::Caption(text)),
        }
    }

    /// Query changes wait their turn behind passes and earlier commands.
    async fn apply(&self, mode: QueryMode, reply: CommandReply) -> CommandReply {
        if self.core.set_query(mode).await {
            reply
        } else {
            CommandReply::line("service is shutting down")
        }
    }

    async fn label(&self, text: String) -> CommandReply {
        match self.resolve(text) {
            Ok(mode) => {
                let reply = format!("labeling: {}", mode.text().unwrap_or_default());
                self.apply(mode, CommandReply::line(reply)).await
            }
            Err(reason) => CommandReply::line(reason),
        }
    }

    async fn caption(&self, text: String) -> CommandReply {
        if !self.capabilities.supports_caption() {
            return CommandReply::line(format!(
                "cannot caption (the active model has a fixed vocabulary): {}",
                text
            ));
        }
        let reply = format!("caption state activated: {}", text);
        self.apply(QueryMode::Caption(text), CommandReply::line(reply))
            .await
    }

    async fn detect(&self) -> CommandReply {
        if self.capabilities.vocabulary().is_none() {
            return CommandReply::line(
                "cannot detect (the active model needs a caption to ground)",
            );
        }
        self.apply(QueryMode::Idle, CommandReply::default()).await
    }

    async fn locate(&self, text: String) -> CommandReply {
        let mode = match self.resolve(text.clone()) {
            Ok(mode) => mode,
            Err(reason) => return CommandReply::line(reason),
        };

        let best = self
            .core
            .locate(mode)
            .await
            .and_then(|result| result.best());

        match best {
            Some(target) => {
                CommandReply::line(format!("{} is here: {} {}", text, target.x, target.y))
            }
            None => CommandReply::line("not found"),
        }
    }

    fn quit(&self) -> CommandReply {
        self.core.close();
        match &self.shutdown {
            Some(shutdown) => {
                tracing::info!("Quit requested over the command channel");
                let _ = shutdown.send(());
            }
            None => tracing::warn!("Quit requested but no shutdown channel is attached"),
        }
        CommandReply::line("quit state activated")
    }
}
