//! Resolver service
//!
//! Front door for resolution requests. Maps caller request ids to running
//! resolvers, routes control events to them and enforces one active resolver
//! per request id. The table is only touched through `&mut self`, so the
//! owner of the service is the single writer.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::io::{ChildProcessRunner, CommandRunner};
use crate::protocol::{ControlEvent, ResolutionRequest, Response, ServiceEvent};
use crate::resolver::config::ResolverConfig;
use crate::resolver::error::ServiceError;
use crate::resolver::instance::{Completion, Resolver, ResolverHandle, ResolverState};
use crate::resolver::sink::EventSink;

pub struct ResolverService {
    config: Arc<ResolverConfig>,
    runner: Arc<dyn CommandRunner>,
    resolvers: HashMap<String, ResolverHandle>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl ResolverService {
    /// Service that runs resolvers as child processes
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_runner(config, Arc::new(ChildProcessRunner::new()))
    }

    pub fn with_runner(config: ResolverConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            runner,
            resolvers: HashMap::new(),
            completions_tx,
            completions_rx,
        }
    }

    /// Start resolving `request`, delivering its events to `sender`
    ///
    /// A request id that is already active is rejected: the new sender gets
    /// one `ERROR` event and the running resolver is left untouched.
    pub fn resolve(
        &mut self,
        request: ResolutionRequest,
        sender: Arc<dyn EventSink>,
    ) -> Result<(), ServiceError> {
        if self.is_active(&request.request_id) {
            let error = ServiceError::duplicate_request(&request.request_id);
            warn!("ResolverService: {}", error);
            sender.send(ServiceEvent::error(&request.request_id, &error));
            return Err(error);
        }

        info!(
            "ResolverService: resolving request {} (protocol {})",
            request.request_id, request.protocol_id
        );
        let request_id = request.request_id.clone();
        let handle = Resolver::spawn(
            request,
            Arc::clone(&self.config),
            Arc::clone(&self.runner),
            sender,
            self.completions_tx.clone(),
        );
        self.resolvers.insert(request_id, handle);
        Ok(())
    }

    /// Abort a request; the entry is removed before this returns
    pub fn abort(&mut self, request_id: &str) -> bool {
        self.reap();

        match self.resolvers.remove(request_id) {
            Some(handle) => {
                info!(
                    "ResolverService: aborting request {} (instance {})",
                    handle.request_id(),
                    handle.instance_id()
                );
                handle.abort();
                true
            }
            None => {
                debug!("ResolverService: abort for inactive request {}", request_id);
                false
            }
        }
    }

    /// Forward caller feedback; silently discarded when the request is gone
    pub fn respond(&mut self, request_id: &str, response: Response) -> bool {
        self.reap();

        match self.resolvers.get(request_id) {
            Some(handle) => handle.respond(response),
            None => {
                trace!("ResolverService: discarding response for inactive request {}", request_id);
                false
            }
        }
    }

    /// Dispatch one control event
    pub fn handle(
        &mut self,
        event: ControlEvent,
        sender: Arc<dyn EventSink>,
    ) -> Result<(), ServiceError> {
        match event {
            ControlEvent::Resolve(request) => self.resolve(request, sender),
            ControlEvent::Abort(request) => {
                self.abort(&request.request_id);
                Ok(())
            }
            ControlEvent::Response(request) => {
                self.respond(&request.request_id, request.response());
                Ok(())
            }
        }
    }

    pub fn is_active(&mut self, request_id: &str) -> bool {
        self.reap();
        self.resolvers.contains_key(request_id)
    }

    pub fn active_count(&mut self) -> usize {
        self.reap();
        self.resolvers.len()
    }

    /// State of the resolver currently registered for `request_id`
    #[cfg(test)]
    pub fn state(&self, request_id: &str) -> Option<ResolverState> {
        self.resolvers.get(request_id).map(ResolverHandle::state)
    }

    /// Wait for the next resolver to finish and drop its entry
    pub async fn next_completion(&mut self) -> Option<Completion> {
        let completion = self.completions_rx.recv().await?;
        self.retire(&completion);
        Some(completion)
    }

    /// Abort every active request
    pub fn shutdown(&mut self) {
        if self.resolvers.is_empty() {
            return;
        }
        info!(
            "ResolverService: shutting down {} active request(s)",
            self.resolvers.len()
        );
        for (_, handle) in self.resolvers.drain() {
            handle.abort();
        }
    }

    fn reap(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.retire(&completion);
        }
    }

    fn retire(&mut self, completion: &Completion) {
        let is_current = self
            .resolvers
            .get(&completion.request_id)
            .is_some_and(|handle| handle.instance_id() == completion.instance_id);

        if is_current {
            self.resolvers.remove(&completion.request_id);
            debug!(
                "ResolverService: request {} finished ({:?})",
                completion.request_id, completion.state
            );
        } else {
            trace!(
                "ResolverService: stale completion for {} ignored",
                completion.request_id
            );
        }
    }
}

impl Drop for ResolverService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
