//! Per-request resolver
//!
//! A resolver owns exactly one [`ProcessPipeline`] and runs as its own tokio
//! task. It walks `Starting -> Streaming -> {Ended | Errored | Aborted}`,
//! translating process output into service events and relaying caller
//! feedback into the process.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{Level, debug, info, trace, warn};
use uuid::Uuid;

use crate::io::{CommandRunner, PipelineEvent, ProcessPipeline};
use crate::protocol::{
    MessageType, ProtocolError, ProtocolMessage, ResolutionRequest, Response, ServiceEvent,
    decode, encode,
};
use crate::resolver::config::ResolverConfig;
use crate::resolver::error::ResolverError;
use crate::resolver::sink::{EventSink, GuardedSender};
use crate::{log_protocol_message, log_timing};

// ============================================================================
// Resolver State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// Process pipeline is being opened
    Starting,
    /// Process is running and its output is being consumed
    Streaming,
    /// Process completed successfully
    Ended,
    /// Start failure, process failure or malformed output
    Errored,
    /// Caller aborted the request
    Aborted,
}

impl ResolverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored | Self::Aborted)
    }
}

/// Command from the handle to the resolver task
#[derive(Debug)]
enum ResolverCommand {
    Respond(Response),
    Abort,
}

/// Final report of a resolver task, sent before its terminal event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request_id: String,
    pub instance_id: Uuid,
    pub state: ResolverState,
}

// ============================================================================
// Resolver Handle
// ============================================================================

/// Control side of a running resolver
pub struct ResolverHandle {
    request_id: String,
    instance_id: Uuid,
    commands: mpsc::UnboundedSender<ResolverCommand>,
    sender: GuardedSender,
    state: Arc<Mutex<ResolverState>>,
}

impl std::fmt::Debug for ResolverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverHandle")
            .field("request_id", &self.request_id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ResolverHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> ResolverState {
        *self.state.lock().unwrap()
    }

    /// Relay caller feedback to the process
    ///
    /// Only accepted while streaming; returns whether it was forwarded.
    pub fn respond(&self, response: Response) -> bool {
        let state = self.state();
        if state != ResolverState::Streaming {
            debug!(
                "ResolverHandle: ignoring response for {} in state {:?}",
                self.request_id, state
            );
            return false;
        }
        self.commands.send(ResolverCommand::Respond(response)).is_ok()
    }

    /// Abort the request
    ///
    /// Once this returns no further event reaches the caller. The process is
    /// killed asynchronously by the resolver task.
    pub fn abort(&self) {
        self.sender.close();
        {
            let mut state = self.state.lock().unwrap();
            if !state.is_terminal() {
                debug!(
                    "ResolverHandle: {} {:?} -> Aborted",
                    self.request_id, *state
                );
                *state = ResolverState::Aborted;
            }
        }
        // The task is gone if it already completed
        let _ = self.commands.send(ResolverCommand::Abort);
    }
}

// ============================================================================
// Resolver Task
// ============================================================================

pub struct Resolver {
    request: ResolutionRequest,
    instance_id: Uuid,
    sender: GuardedSender,
    state: Arc<Mutex<ResolverState>>,
    completions: mpsc::UnboundedSender<Completion>,
    started: Instant,
}

impl Resolver {
    /// Start a resolver task for `request` and return its handle
    pub fn spawn(
        request: ResolutionRequest,
        config: Arc<ResolverConfig>,
        runner: Arc<dyn CommandRunner>,
        sink: Arc<dyn EventSink>,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> ResolverHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let sender = GuardedSender::new(sink);
        let state = Arc::new(Mutex::new(ResolverState::Starting));
        let instance_id = Uuid::new_v4();

        let handle = ResolverHandle {
            request_id: request.request_id.clone(),
            instance_id,
            commands: commands_tx,
            sender: sender.clone(),
            state: Arc::clone(&state),
        };

        let resolver = Self {
            request,
            instance_id,
            sender,
            state,
            completions,
            started: Instant::now(),
        };
        tokio::spawn(resolver.run(config, runner, commands_rx));

        handle
    }

    async fn run(
        self,
        config: Arc<ResolverConfig>,
        runner: Arc<dyn CommandRunner>,
        mut commands: mpsc::UnboundedReceiver<ResolverCommand>,
    ) {
        let command = config.command_for(&self.request);
        debug!(
            "Resolver: starting '{}' for request {}",
            command, self.request.request_id
        );

        let open = ProcessPipeline::open(runner.as_ref(), &command, &config.pipeline);
        tokio::pin!(open);

        let mut pipeline = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(ResolverCommand::Respond(_)) => {
                        warn!(
                            "Resolver: response for {} arrived before the process started, ignoring",
                            self.request.request_id
                        );
                    }
                    Some(ResolverCommand::Abort) | None => {
                        self.complete(ResolverState::Aborted, None);
                        return;
                    }
                },

                result = &mut open => match result {
                    Ok(pipeline) => break pipeline,
                    Err(e) => {
                        warn!("Resolver: failed to start resolver for {}: {}", self.request.request_id, e);
                        let error = ResolverError::Start(e);
                        self.complete(
                            ResolverState::Errored,
                            Some(ServiceEvent::error(&self.request.request_id, error)),
                        );
                        return;
                    }
                },
            }
        };

        if !self.transition(ResolverState::Streaming) {
            pipeline.abort();
            self.complete(ResolverState::Aborted, None);
            return;
        }
        info!(
            "Resolver: request {} streaming from PID {:?}",
            self.request.request_id,
            pipeline.pid()
        );
        self.write_message(&pipeline, &self.request.handshake());

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(ResolverCommand::Respond(response)) => self.respond(&pipeline, response),
                    Some(ResolverCommand::Abort) | None => {
                        pipeline.abort();
                        self.complete(ResolverState::Aborted, None);
                        return;
                    }
                },

                event = pipeline.next() => match event {
                    Some(PipelineEvent::Line(line)) => {
                        if let Err(e) = self.dispatch(&line) {
                            warn!("Resolver: malformed output from {}: {}", self.request.request_id, e);
                            pipeline.abort();
                            let error = ResolverError::from(e);
                            self.complete(
                                ResolverState::Errored,
                                Some(ServiceEvent::error(&self.request.request_id, error)),
                            );
                            return;
                        }
                    }
                    Some(PipelineEvent::End) => {
                        self.complete(
                            ResolverState::Ended,
                            Some(ServiceEvent::end(&self.request.request_id)),
                        );
                        return;
                    }
                    Some(PipelineEvent::Error(e)) => {
                        warn!("Resolver: request {} failed: {}", self.request.request_id, e);
                        let error = ResolverError::Pipeline(e);
                        self.complete(
                            ResolverState::Errored,
                            Some(ServiceEvent::error(&self.request.request_id, error)),
                        );
                        return;
                    }
                    None => {
                        self.complete(ResolverState::Aborted, None);
                        return;
                    }
                },
            }
        }
    }

    /// Handle one stdout line from the process
    fn dispatch(&self, line: &str) -> Result<(), ProtocolError> {
        if line.trim().is_empty() {
            trace!("Resolver: skipping blank line from {}", self.request.request_id);
            return Ok(());
        }

        let message = decode(line)?;
        log_protocol_message!(Level::DEBUG, "incoming", self.request.request_id, message);

        match message.kind {
            MessageType::Maybe => {
                self.sender
                    .send(ServiceEvent::query(&self.request.request_id, message.payload));
            }
            MessageType::Log => {
                let text = match &message.payload {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                info!("Resolver[{}]: {}", self.request.request_id, text);
            }
            MessageType::Resolve => {
                debug!("Resolver: request {} acknowledged", self.request.request_id);
            }
            MessageType::Match
            | MessageType::Reject
            | MessageType::Abort
            | MessageType::End
            | MessageType::Error
            | MessageType::Query
            | MessageType::Response
            | MessageType::Unknown(_) => {
                warn!(
                    "Resolver: unrecognized {} message from {}, ignoring",
                    message.kind, self.request.request_id
                );
            }
        }
        Ok(())
    }

    fn respond(&self, pipeline: &ProcessPipeline, response: Response) {
        if self.state() != ResolverState::Streaming {
            debug!(
                "Resolver: dropping response for {} outside streaming",
                self.request.request_id
            );
            return;
        }
        self.write_message(pipeline, &response.into_message());
    }

    /// Encode and write one message to the process; failures are not terminal
    fn write_message(&self, pipeline: &ProcessPipeline, message: &ProtocolMessage) {
        let line = match encode(message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Resolver: cannot send to {}: {}", self.request.request_id, e);
                return;
            }
        };

        log_protocol_message!(Level::DEBUG, "outgoing", self.request.request_id, message);
        if let Err(e) = pipeline.write_line(&line) {
            warn!(
                "Resolver: failed to write {} to {}: {}",
                message.kind, self.request.request_id, e
            );
        }
    }

    fn state(&self) -> ResolverState {
        *self.state.lock().unwrap()
    }

    /// Move to `next` unless already terminal; returns whether it moved
    fn transition(&self, next: ResolverState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            trace!(
                "Resolver: {} already {:?}, not entering {:?}",
                self.request.request_id, *state, next
            );
            return false;
        }
        debug!(
            "Resolver: {} {:?} -> {:?}",
            self.request.request_id, *state, next
        );
        *state = next;
        true
    }

    /// Enter a terminal state, report completion, then emit `event`
    fn complete(&self, terminal: ResolverState, event: Option<ServiceEvent>) {
        let entered = self.transition(terminal);

        let completion = Completion {
            request_id: self.request.request_id.clone(),
            instance_id: self.instance_id,
            state: self.state(),
        };
        // Service gone means nobody is left to reap this resolver
        let _ = self.completions.send(completion);

        if entered && let Some(event) = event {
            self.sender.send(event);
        }
        log_timing!(Level::DEBUG, "resolve", self.started.elapsed());
    }
}

// ============================================================================
// Tests
// ============================================================================
