//! Default peer: a message pump over the framed control channel.
//!
//! Flow:
//! 1. Reader task decodes envelopes and resolves pending calls by request id
//! 2. Notifications are queued to a separate task and handled in arrival order,
//!    so a handler may itself call the worker while the reader keeps running
//! 3. Worker-initiated requests are handled on their own task and answered
//! 4. Writer task drains a bounded queue into the transport
//! 5. On the first transport failure: record it, fire the stop token, fail pending calls

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{CallContext, Peer, PeerConnector, PeerError, PeerHandler};
use crate::bridge::protocol::PeerFrame;
use crate::bridge::transport::{FrameReader, FrameWriter, Transport};

type PendingCall = oneshot::Sender<Result<Bytes, PeerError>>;
type QueuedNotify = (String, Bytes);

pub struct MsgPeer {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    outbound: mpsc::Sender<PeerFrame>,
    stop: CancellationToken,
    error: OnceLock<PeerError>,
}

impl MsgPeer {
    /// Spawn the reader, writer and notification tasks. Must run inside a tokio runtime.
    pub fn start(
        transport: Transport,
        handler: Arc<dyn PeerHandler>,
        write_queue: usize,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(write_queue.max(1));
        let peer = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound,
            stop: CancellationToken::new(),
            error: OnceLock::new(),
        });

        // Unbounded: a full queue would stall the reader behind a handler that is
        // waiting on a response only the reader can deliver.
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let (reader, writer) = transport.into_parts();
        tokio::spawn(notify_loop(Arc::clone(&handler), notify_rx));
        tokio::spawn(Arc::clone(&peer).read_loop(reader, handler, notify_tx));
        tokio::spawn(Arc::clone(&peer).write_loop(writer, outbound_rx));

        peer
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn fail(&self, error: PeerError) {
        if self.error.set(error.clone()).is_ok() {
            tracing::debug!(%error, "Peer failed");
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        self.stop.cancel();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(PeerError::Stopped));
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader,
        handler: Arc<dyn PeerHandler>,
        notify_tx: mpsc::UnboundedSender<QueuedNotify>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(bytes)) => match PeerFrame::decode(&bytes) {
                    Ok(frame) => self.dispatch(frame, &handler, &notify_tx),
                    Err(e) => {
                        tracing::warn!(error = %e, frame_len = bytes.len(), "Dropping malformed frame");
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Control channel read error");
                    self.fail(PeerError::Io(e.to_string()));
                    break;
                }
                None => {
                    tracing::warn!("Control channel closed (worker exited?)");
                    self.fail(PeerError::Closed);
                    break;
                }
            }
        }
        tracing::trace!("Peer reader exiting");
    }

    fn dispatch(
        &self,
        frame: PeerFrame,
        handler: &Arc<dyn PeerHandler>,
        notify_tx: &mpsc::UnboundedSender<QueuedNotify>,
    ) {
        match frame {
            PeerFrame::Response { id, payload, error } => match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let result = match error {
                        Some(e) => Err(PeerError::Remote(e)),
                        None => Ok(payload),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    // Caller gave up (cancelled or deadline) before the worker answered.
                    tracing::debug!(id, "Response for unknown request");
                }
            },
            PeerFrame::Notify { msg_type, payload } => {
                if notify_tx.send((msg_type, payload)).is_err() {
                    tracing::debug!("Notification task gone, dropping notification");
                }
            }
            PeerFrame::Request {
                id,
                msg_type,
                payload,
            } => {
                let handler = Arc::clone(handler);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let response = match handler.process(&msg_type, payload).await {
                        Ok(payload) => PeerFrame::Response {
                            id,
                            payload,
                            error: None,
                        },
                        Err(e) => PeerFrame::Response {
                            id,
                            payload: Bytes::new(),
                            error: Some(e.to_string()),
                        },
                    };
                    if outbound.send(response).await.is_err() {
                        tracing::debug!(id, "Peer stopped before response could be sent");
                    }
                });
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: FrameWriter, mut rx: mpsc::Receiver<PeerFrame>) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode frame");
                    continue;
                }
            };

            if let Err(e) = writer.send(bytes).await {
                tracing::error!(error = %e, "Control channel write error");
                self.fail(PeerError::Io(e.to_string()));
                break;
            }
        }

        if let Err(e) = writer.close().await {
            tracing::trace!(error = %e, "Control channel close failed");
        }
        tracing::trace!("Peer writer exiting");
    }
}

/// Delivers notifications one at a time until the reader drops its sender.
async fn notify_loop(
    handler: Arc<dyn PeerHandler>,
    mut rx: mpsc::UnboundedReceiver<QueuedNotify>,
) {
    while let Some((msg_type, payload)) = rx.recv().await {
        handler.on_notify(&msg_type, payload).await;
    }
    tracing::trace!("Peer notification task exiting");
}

#[async_trait]
impl Peer for MsgPeer {
    async fn call(
        &self,
        ctx: &CallContext,
        msg_type: &str,
        payload: Bytes,
    ) -> Result<Bytes, PeerError> {
        if self.stop.is_cancelled() {
            return Err(PeerError::Stopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // shutdown() may have drained the map between the check above and the insert.
        if self.stop.is_cancelled() {
            self.pending.remove(&id);
            return Err(PeerError::Stopped);
        }

        let frame = PeerFrame::Request {
            id,
            msg_type: msg_type.to_string(),
            payload,
        };

        let result = ctx
            .bound(async {
                self.outbound
                    .send(frame)
                    .await
                    .map_err(|_| PeerError::Stopped)?;
                rx.await.map_err(|_| PeerError::Stopped)?
            })
            .await;

        if result.is_err() {
            self.pending.remove(&id);
        }
        result
    }

    fn stop(&self) {
        self.shutdown();
    }

    async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    fn error(&self) -> Option<PeerError> {
        self.error.get().cloned()
    }
}

/// Connector producing [`MsgPeer`]s.
#[derive(Debug, Clone)]
pub struct MsgPeerConnector {
    write_queue: usize,
}

impl MsgPeerConnector {
    pub fn new(write_queue: usize) -> Self {
        Self { write_queue }
    }
}

impl PeerConnector for MsgPeerConnector {
    fn connect(
        &self,
        transport: Transport,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<dyn Peer>, PeerError> {
        let peer: Arc<dyn Peer> = MsgPeer::start(transport, handler, self.write_queue);
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
    use std::time::Duration;

    /// Records notifications; rejects every worker-initiated request.
    struct RecordingHandler {
        notify_tx: mpsc::UnboundedSender<(String, Bytes)>,
    }

    #[async_trait]
    impl PeerHandler for RecordingHandler {
        async fn process(&self, msg_type: &str, _request: Bytes) -> Result<Bytes, PeerError> {
            Err(PeerError::Unsupported(msg_type.to_string()))
        }

        async fn on_notify(&self, msg_type: &str, payload: Bytes) {
            let _ = self.notify_tx.send((msg_type.to_string(), payload));
        }
    }

    /// Peer under test plus the raw framed "worker" side of the channel.
    fn setup() -> (
        Arc<MsgPeer>,
        FrameReader,
        FrameWriter,
        mpsc::UnboundedReceiver<(String, Bytes)>,
    ) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RecordingHandler { notify_tx });
        let peer = MsgPeer::start(
            Transport::new(our_read, our_write, DEFAULT_MAX_FRAME_LENGTH),
            handler,
            8,
        );

        let (worker_reader, worker_writer) =
            Transport::new(their_read, their_write, DEFAULT_MAX_FRAME_LENGTH).into_parts();
        (peer, worker_reader, worker_writer, notify_rx)
    }

    async fn next_frame(reader: &mut FrameReader) -> PeerFrame {
        let bytes = reader.next().await.unwrap().unwrap();
        PeerFrame::decode(&bytes).unwrap()
    }

    async fn send_frame(writer: &mut FrameWriter, frame: PeerFrame) {
        writer.send(frame.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let (peer, mut reader, mut writer, _notify) = setup();

        let worker = tokio::spawn(async move {
            let PeerFrame::Request { id, msg_type, payload } = next_frame(&mut reader).await else {
                panic!("expected request");
            };
            assert_eq!(msg_type, "router.create");
            assert_eq!(&payload[..], b"{\"routerId\":\"r1\"}");
            send_frame(
                &mut writer,
                PeerFrame::Response {
                    id,
                    payload: Bytes::from_static(b"{\"ok\":true}"),
                    error: None,
                },
            )
            .await;
            (reader, writer)
        });

        let response = peer
            .call(
                &CallContext::new(),
                "router.create",
                Bytes::from_static(b"{\"routerId\":\"r1\"}"),
            )
            .await
            .unwrap();

        assert_eq!(&response[..], b"{\"ok\":true}");
        assert_eq!(peer.pending_calls(), 0);
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_is_reported() {
        let (peer, mut reader, mut writer, _notify) = setup();

        let worker = tokio::spawn(async move {
            let PeerFrame::Request { id, .. } = next_frame(&mut reader).await else {
                panic!("expected request");
            };
            send_frame(
                &mut writer,
                PeerFrame::Response {
                    id,
                    payload: Bytes::new(),
                    error: Some("router not found".to_string()),
                },
            )
            .await;
            (reader, writer)
        });

        let err = peer
            .call(&CallContext::new(), "router.close", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();

        assert_eq!(err, PeerError::Remote("router not found".to_string()));
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn notifications_reach_handler_in_order() {
        let (_peer, _reader, mut writer, mut notify) = setup();

        for tag in ["running", "icestatechange", "layerschange"] {
            send_frame(
                &mut writer,
                PeerFrame::Notify {
                    msg_type: tag.to_string(),
                    payload: Bytes::from_static(b"{}"),
                },
            )
            .await;
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(notify.recv().await.unwrap().0);
        }
        assert_eq!(seen, vec!["running", "icestatechange", "layerschange"]);
    }

    #[tokio::test]
    async fn worker_request_is_answered_with_error() {
        let (_peer, mut reader, mut writer, _notify) = setup();

        send_frame(
            &mut writer,
            PeerFrame::Request {
                id: 99,
                msg_type: "worker.ping".to_string(),
                payload: Bytes::new(),
            },
        )
        .await;

        match next_frame(&mut reader).await {
            PeerFrame::Response { id, error, .. } => {
                assert_eq!(id, 99);
                assert_eq!(error.as_deref(), Some("unsupported request: worker.ping"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn channel_close_stops_peer_and_fails_pending_calls() {
        let (peer, mut reader, writer, _notify) = setup();

        let call = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                peer.call(&CallContext::new(), "transport.dump", Bytes::new())
                    .await
            })
        };

        // Wait until the request is on the wire, then hang up.
        let _ = next_frame(&mut reader).await;
        drop(writer);
        drop(reader);

        tokio::time::timeout(Duration::from_secs(5), peer.stopped())
            .await
            .unwrap();
        assert_eq!(peer.error(), Some(PeerError::Closed));
        assert_eq!(call.await.unwrap(), Err(PeerError::Stopped));

        let err = peer
            .call(&CallContext::new(), "transport.dump", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::Stopped);
    }

    #[tokio::test]
    async fn deadline_abandons_call() {
        let (peer, _reader, _writer, _notify) = setup();

        let ctx = CallContext::new().with_timeout(Duration::from_millis(30));
        let err = peer
            .call(&ctx, "consumer.getStats", Bytes::new())
            .await
            .unwrap_err();

        assert_eq!(err, PeerError::DeadlineExceeded);
        assert_eq!(peer.pending_calls(), 0);
        assert!(peer.error().is_none());
    }

    #[tokio::test]
    async fn stop_is_clean_and_idempotent() {
        let (peer, _reader, _writer, _notify) = setup();

        peer.stop();
        peer.stop();

        tokio::time::timeout(Duration::from_secs(5), peer.stopped())
            .await
            .unwrap();
        assert!(peer.error().is_none());
    }

    /// Holds every notification until the gate opens.
    struct GatedHandler {
        gate: Arc<tokio::sync::Notify>,
        notify_tx: mpsc::UnboundedSender<(String, Bytes)>,
    }

    #[async_trait]
    impl PeerHandler for GatedHandler {
        async fn process(&self, msg_type: &str, _request: Bytes) -> Result<Bytes, PeerError> {
            Err(PeerError::Unsupported(msg_type.to_string()))
        }

        async fn on_notify(&self, msg_type: &str, payload: Bytes) {
            self.gate.notified().await;
            let _ = self.notify_tx.send((msg_type.to_string(), payload));
        }
    }

    #[tokio::test]
    async fn responses_flow_while_notification_handler_is_busy() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let gate = Arc::new(tokio::sync::Notify::new());
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let peer = MsgPeer::start(
            Transport::new(our_read, our_write, DEFAULT_MAX_FRAME_LENGTH),
            Arc::new(GatedHandler {
                gate: Arc::clone(&gate),
                notify_tx,
            }),
            8,
        );
        let (mut reader, mut writer) =
            Transport::new(their_read, their_write, DEFAULT_MAX_FRAME_LENGTH).into_parts();

        send_frame(
            &mut writer,
            PeerFrame::Notify {
                msg_type: "producerclose".to_string(),
                payload: Bytes::from_static(b"{}"),
            },
        )
        .await;

        let call = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
                peer.call(&ctx, "consumer.close", Bytes::new()).await
            })
        };

        let PeerFrame::Request { id, .. } = next_frame(&mut reader).await else {
            panic!("expected request");
        };
        send_frame(
            &mut writer,
            PeerFrame::Response {
                id,
                payload: Bytes::from_static(b"closed"),
                error: None,
            },
        )
        .await;

        // The handler is still parked on the gate.
        assert_eq!(&call.await.unwrap().unwrap()[..], b"closed");
        assert!(notify_rx.try_recv().is_err());

        gate.notify_one();
        let (msg_type, _) = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg_type, "producerclose");
    }
}
