//! NDJSON control bus
//!
//! Inbound: one control event per line, `{"type": "RESOLVE", "payload": {...}}`.
//! Outbound: one frame per service event, `{"channel": "QUERY/<id>", "payload": ...}`.
//! All requests share the bus; the channel id tells them apart.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::io::{FramingError, LineFramer};
use crate::protocol::{ControlEvent, ServiceEvent};
use crate::resolver::{EventSink, ResolverService};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to read control input: {0}")]
    Input(#[source] FramingError),

    #[error("Failed to write service event: {0}")]
    Output(#[source] FramingError),

    #[error("Failed to serialize service event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Event writer task failed: {0}")]
    Writer(#[from] JoinError),
}

/// Serve control events from `input` until it closes or `shutdown` resolves
///
/// Every request still active at that point is aborted. Returns once all
/// pending events have been written to `output`.
pub async fn serve<R, W, S>(
    mut service: ResolverService,
    input: R,
    output: W,
    shutdown: S,
) -> Result<(), BusError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(events_rx, output));
    let sink: Arc<dyn EventSink> = Arc::new(events_tx);

    let mut lines = FramedRead::new(input, ControlLines::default());
    tokio::pin!(shutdown);

    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("ControlBus: shutdown requested");
                break;
            }

            line = lines.next() => match line {
                Some(Ok(Ok(line))) => handle_line(&mut service, &line, &sink),
                Some(Ok(Err(e))) => warn!("ControlBus: skipping unreadable control line: {}", e),
                Some(Err(e)) => {
                    error!("ControlBus: unreadable control input: {}", e);
                    result = Err(BusError::Input(e));
                    break;
                }
                None => {
                    info!("ControlBus: control input closed");
                    break;
                }
            },

            Some(completion) = service.next_completion() => {
                debug!(
                    "ControlBus: request {} completed ({:?})",
                    completion.request_id, completion.state
                );
            }
        }
    }

    debug!("ControlBus: {} request(s) still active", service.active_count());
    service.shutdown();
    drop(service);
    drop(sink);

    // Resolves once every resolver task has released its sink
    writer.await??;
    result
}

/// Control input framing
///
/// Lines that cannot be decoded are yielded in-band so the reader skips them
/// and keeps going. Only I/O failures end the stream.
#[derive(Debug, Default)]
struct ControlLines(LineFramer);

impl ControlLines {
    fn in_band(
        decoded: Result<Option<String>, FramingError>,
    ) -> Result<Option<Result<String, FramingError>>, FramingError> {
        match decoded {
            Ok(line) => Ok(line.map(Ok)),
            Err(e) if e.is_line_error() => Ok(Some(Err(e))),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for ControlLines {
    type Item = Result<String, FramingError>;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, FramingError> {
        Self::in_band(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, FramingError> {
        Self::in_band(self.0.decode_eof(src))
    }
}

fn handle_line(service: &mut ResolverService, line: &str, sink: &Arc<dyn EventSink>) {
    if line.trim().is_empty() {
        return;
    }

    let event = match serde_json::from_str::<ControlEvent>(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("ControlBus: ignoring malformed control event: {}", e);
            return;
        }
    };

    trace!("ControlBus: control event for request {}", event.request_id());
    if let Err(e) = service.handle(event, Arc::clone(sink)) {
        warn!("ControlBus: {}", e);
    }
}

async fn write_events<W>(
    mut events: mpsc::UnboundedReceiver<ServiceEvent>,
    output: W,
) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(output, LineFramer::new());

    while let Some(event) = events.recv().await {
        let frame = serde_json::to_string(&event.to_frame())?;
        trace!("ControlBus: sending {}", frame);
        framed.send(frame).await.map_err(BusError::Output)?;
        if event.is_terminal() {
            debug!("ControlBus: request {} closed", event.request_id());
        }
    }

    framed.close().await.map_err(BusError::Output)?;
    debug!("ControlBus: event writer finished");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
