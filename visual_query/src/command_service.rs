use crate::{
    command::{self, CommandInterpreter},
    model_service::ModelService,
};
use query_proto::{command_service_server::CommandService, CommandReply, CommandRequest, ReplyTag};
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};

/// gRPC face of the command interpreter.
pub struct CommandEndpoint<M: ModelService> {
    interpreter: Arc<CommandInterpreter<M>>,
}

impl<M: ModelService> Clone for CommandEndpoint<M> {
    fn clone(&self) -> Self {
        Self {
            interpreter: self.interpreter.clone(),
        }
    }
}

impl<M: ModelService> CommandEndpoint<M> {
    pub fn new(interpreter: Arc<CommandInterpreter<M>>) -> Self {
        Self { interpreter }
    }
}

fn to_proto(reply: command::CommandReply) -> CommandReply {
    let tag = match reply.tag {
        None => ReplyTag::Unspecified,
        Some(command::ReplyTag::Ack) => ReplyTag::Ack,
        Some(command::ReplyTag::Many) => ReplyTag::Many,
    };
    CommandReply {
        text: reply.text,
        tag: tag as i32,
    }
}

#[async_trait]
impl<M: ModelService> CommandService for CommandEndpoint<M> {
    async fn respond(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandReply>, Status> {
        if self.interpreter.is_closing() {
            return Err(Status::unavailable("service is shutting down"));
        }

        let CommandRequest { verb, args } = request.into_inner();
        let reply = self
            .interpreter
            .handle(&command::CommandRequest { verb, args })
            .await;

        tracing::debug!("Replying with {} line(s)", reply.text.len());
        Ok(Response::new(to_proto(reply)))
    }
}
