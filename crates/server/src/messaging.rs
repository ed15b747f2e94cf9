//! Streaming messaging sessions.
//!
//! A session owns one connection for its lifetime and reads frames strictly
//! one at a time. Each accepted frame becomes an [`Envelope`] that is echoed
//! to the peer first and persisted second; a failed write produces an
//! advisory notice keyed by the same message id.

use std::{fmt::Display, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream::SplitSink, SinkExt, Stream, StreamExt};
use nkata_core::{
    Envelope, FieldError, FrameRejection, Identity, Media, OutboundFrame, PersistenceNotice,
    SubmissionFrame,
};
use nkata_media::{sniff, BlobError, BlobStore};
use thiserror::Error;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{auth::Authenticated, store::MessageStore, AppState, ErrorBody};

const OUTBOUND_BUFFER: usize = 64;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// One frame as read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
    /// Ping, pong and anything else without message semantics.
    Control,
}

impl From<WsMessage> for InboundFrame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
            WsMessage::Binary(bytes) => InboundFrame::Binary(bytes.to_vec()),
            WsMessage::Close(_) => InboundFrame::Close,
            WsMessage::Ping(_) | WsMessage::Pong(_) => InboundFrame::Control,
        }
    }
}

/// Why a single frame was dropped. None of these end the session.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a valid submission: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("submission failed validation")]
    Invalid(Vec<FieldError>),
    #[error("media could not be stored: {0}")]
    Blob(#[from] BlobError),
}

impl FrameError {
    pub fn rejection(&self) -> FrameRejection {
        match self {
            FrameError::Decode(_) => FrameRejection::malformed_frame(),
            FrameError::Invalid(details) => FrameRejection::invalid_message(details.clone()),
            FrameError::Blob(BlobError::Empty) => FrameRejection::media_rejected("must not be empty"),
            FrameError::Blob(BlobError::TooLarge { .. }) => {
                FrameRejection::media_rejected("exceeds the size limit")
            }
            FrameError::Blob(_) => FrameRejection::media_rejected("could not be stored"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    TransportError,
    WriterClosed,
}

#[derive(Clone, Default)]
pub struct MessagingMetrics {
    #[cfg(feature = "metrics")]
    inner: Option<Arc<MetricsContext>>,
}

impl MessagingMetrics {
    #[cfg(feature = "metrics")]
    pub fn new(inner: Option<Arc<MetricsContext>>) -> Self {
        Self { inner }
    }

    fn echoed(&self, frame: &'static str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner {
            metrics.messages_echoed_total.with_label_values(&[frame]).inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = frame;
    }

    fn persistence_failed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner {
            metrics.persistence_failures_total.inc();
        }
    }
}

/// Bounded pool of detached persistence tasks. Tasks outlive the session
/// that submitted them; `drain` waits for every in-flight write.
#[derive(Clone)]
pub struct PersistenceWorkers {
    store: Arc<dyn MessageStore>,
    permits: Arc<Semaphore>,
    capacity: u32,
    metrics: MessagingMetrics,
}

impl PersistenceWorkers {
    pub fn new(store: Arc<dyn MessageStore>, capacity: usize, metrics: MessagingMetrics) -> Self {
        let capacity = u32::try_from(capacity.max(1)).unwrap_or(u32::MAX);
        Self {
            store,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            metrics,
        }
    }

    /// Persist `envelope` in the background. Waits for a free worker when the
    /// pool is saturated. Failures are reported on `notices`.
    pub async fn submit(&self, envelope: Envelope, notices: mpsc::Sender<OutboundFrame>) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            warn!(message_id = %envelope.message_id, "persistence pool is closed; message not persisted");
            self.metrics.persistence_failed();
            let _ = notices
                .send(OutboundFrame::NotPersisted(PersistenceNotice::not_persisted(
                    envelope.message_id,
                )))
                .await;
            return;
        };

        let store = self.store.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = store.insert(&envelope).await {
                error!(?err, message_id = %envelope.message_id, "failed to persist message");
                metrics.persistence_failed();
                let notice = OutboundFrame::NotPersisted(PersistenceNotice::not_persisted(
                    envelope.message_id,
                ));
                if notices.send(notice).await.is_err() {
                    debug!("session closed before the persistence notice could be delivered");
                }
            }
        });
    }

    /// Wait for all in-flight writes, then refuse new ones.
    pub async fn drain(&self) {
        match self.permits.acquire_many(self.capacity).await {
            Ok(_all) => self.permits.close(),
            Err(_) => debug!("persistence pool already drained"),
        }
    }
}

/// Protocol state for one open connection.
pub struct MessagingSession {
    conversation_id: String,
    sender: Identity,
    blobs: Arc<dyn BlobStore>,
    persistence: PersistenceWorkers,
    metrics: MessagingMetrics,
}

impl MessagingSession {
    pub fn new(
        conversation_id: impl Into<String>,
        sender: Identity,
        blobs: Arc<dyn BlobStore>,
        persistence: PersistenceWorkers,
        metrics: MessagingMetrics,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender,
            blobs,
            persistence,
            metrics,
        }
    }

    /// Read frames until the peer closes, the transport fails, or the writer
    /// goes away.
    pub async fn run<S, E>(self, mut inbound: S, outbound: mpsc::Sender<OutboundFrame>) -> SessionEnd
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: Display,
    {
        while let Some(frame) = inbound.next().await {
            let delivered = match frame {
                Err(err) => {
                    warn!(%err, "transport read failed; closing session");
                    return SessionEnd::TransportError;
                }
                Ok(InboundFrame::Close) => return SessionEnd::PeerClosed,
                Ok(InboundFrame::Control) => {
                    debug!("ignoring control frame");
                    true
                }
                Ok(InboundFrame::Text(raw)) => {
                    let result = self.envelope_from_text(&raw);
                    self.dispatch(result, "text", &outbound).await
                }
                Ok(InboundFrame::Binary(bytes)) => {
                    let result = self.envelope_from_binary(&bytes).await;
                    self.dispatch(result, "binary", &outbound).await
                }
            };
            if !delivered {
                return SessionEnd::WriterClosed;
            }
        }
        SessionEnd::PeerClosed
    }

    fn envelope_from_text(&self, raw: &str) -> Result<Envelope, FrameError> {
        let submission = SubmissionFrame::parse(raw)?
            .validate(&self.conversation_id, self.sender.handle())
            .map_err(FrameError::Invalid)?;
        Ok(Envelope::compose(
            self.conversation_id.clone(),
            self.sender.handle(),
            submission,
        ))
    }

    async fn envelope_from_binary(&self, bytes: &[u8]) -> Result<Envelope, FrameError> {
        if bytes.is_empty() {
            return Err(BlobError::Empty.into());
        }
        let sniffed = sniff(bytes);
        let stored = self.blobs.put(bytes, sniffed.extension).await?;
        debug!(blob = %stored.name, mime = sniffed.mime, "stored media blob");
        Ok(Envelope::media_message(
            self.conversation_id.clone(),
            self.sender.handle(),
            Media::stored(stored.url, sniffed.kind),
        ))
    }

    /// Echo first, persist second. Returns false once the writer is gone.
    async fn dispatch(
        &self,
        result: Result<Envelope, FrameError>,
        frame: &'static str,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> bool {
        let envelope = match result {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, frame, "dropping inbound frame");
                return outbound
                    .send(OutboundFrame::Rejected(err.rejection()))
                    .await
                    .is_ok();
            }
        };

        if outbound
            .send(OutboundFrame::Envelope(envelope.clone()))
            .await
            .is_err()
        {
            return false;
        }
        self.metrics.echoed(frame);
        debug!(message_id = %envelope.message_id, frame, "echoed envelope");

        self.persistence.submit(envelope, outbound.clone()).await;
        true
    }
}

/// Shared state behind every streaming session.
pub struct MessagingService {
    blobs: Arc<dyn BlobStore>,
    persistence: PersistenceWorkers,
    sessions: Arc<Semaphore>,
    metrics: MessagingMetrics,
}

impl MessagingService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        persistence: PersistenceWorkers,
        max_sessions: usize,
        metrics: MessagingMetrics,
    ) -> Self {
        Self {
            blobs,
            persistence,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
            metrics,
        }
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    pub fn persistence(&self) -> &PersistenceWorkers {
        &self.persistence
    }

    fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.sessions.clone().try_acquire_owned().ok()
    }

    async fn serve(
        self: Arc<Self>,
        socket: WebSocket,
        conversation_id: String,
        sender: Identity,
        _permit: OwnedSemaphorePermit,
    ) {
        let session_id = Uuid::new_v4();
        let span = info_span!(
            "messaging.session",
            conversation_id = %conversation_id,
            sender = %sender,
            session_id = %session_id
        );

        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer = tokio::spawn(write_frames(sink, outbound_rx).instrument(span.clone()));

        let session = MessagingSession::new(
            conversation_id,
            sender,
            self.blobs.clone(),
            self.persistence.clone(),
            self.metrics.clone(),
        );

        async move {
            info!("session opened");
            let end = session
                .run(stream.map(|message| message.map(InboundFrame::from)), outbound)
                .await;
            info!(?end, "session closed");
        }
        .instrument(span)
        .await;

        if let Err(err) = writer.await {
            warn!(?err, "session writer task failed");
        }
    }
}

/// Owns the sink half; the only place frames reach the peer.
async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut frames: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!(?err, "failed to encode outbound frame");
                continue;
            }
        };
        match timeout(SEND_TIMEOUT, sink.send(WsMessage::Text(json.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(?err, "peer stopped accepting frames");
                break;
            }
            Err(_) => {
                warn!("websocket send timeout");
                break;
            }
        }
    }
    let _ = sink.close().await;
}

pub async fn session_socket(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(conversation_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = "messages.ws";
    let conversation_id = conversation_id.trim().to_string();
    if conversation_id.is_empty() {
        let status = StatusCode::BAD_REQUEST;
        state.record_http_request(route, status.as_u16());
        return (
            status,
            Json(ErrorBody::validation(vec![FieldError::new(
                "conversation_id",
                "must be provided",
            )])),
        )
            .into_response();
    }

    let service = state.messaging();
    let Some(permit) = service.try_reserve() else {
        warn!(%conversation_id, sender = %identity, "session limit reached");
        let status = StatusCode::SERVICE_UNAVAILABLE;
        state.record_http_request(route, status.as_u16());
        return (status, Json(ErrorBody::new("session_limit_reached"))).into_response();
    };

    state.record_http_request(route, StatusCode::SWITCHING_PROTOCOLS.as_u16());
    ws.on_upgrade(move |socket| service.serve(socket, conversation_id, identity, permit))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{InMemoryMessageStore, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::stream;
    use nkata_core::{MediaKind, PageRequest, SearchQuery};
    use nkata_media::{BlobStoreConfig, InMemoryBlobStore};
    use std::convert::Infallible;
    use tokio::sync::Notify;

    const PNG: &[u8] = &[
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
        b'R',
    ];

    /// Store that fails every call.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn insert(&self, _: &Envelope) -> Result<(), StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
        async fn get(&self, _: &str) -> Result<Envelope, StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
        async fn list(&self, _: &str, _: PageRequest) -> Result<(Vec<Envelope>, i64), StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
        async fn search(
            &self,
            _: &str,
            _: &SearchQuery,
            _: PageRequest,
        ) -> Result<(Vec<Envelope>, i64), StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
        async fn update_text(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
        ) -> Result<Envelope, StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(anyhow::anyhow!("database unavailable").into())
        }
    }

    /// Store whose inserts wait until the gate opens.
    struct GatedStore {
        gate: Arc<Notify>,
        inner: InMemoryMessageStore,
    }

    #[async_trait]
    impl MessageStore for GatedStore {
        async fn insert(&self, envelope: &Envelope) -> Result<(), StoreError> {
            self.gate.notified().await;
            self.inner.insert(envelope).await
        }
        async fn get(&self, id: &str) -> Result<Envelope, StoreError> {
            self.inner.get(id).await
        }
        async fn list(&self, c: &str, r: PageRequest) -> Result<(Vec<Envelope>, i64), StoreError> {
            self.inner.list(c, r).await
        }
        async fn search(
            &self,
            c: &str,
            q: &SearchQuery,
            r: PageRequest,
        ) -> Result<(Vec<Envelope>, i64), StoreError> {
            self.inner.search(c, q, r).await
        }
        async fn update_text(
            &self,
            id: &str,
            text: &str,
            at: DateTime<Utc>,
        ) -> Result<Envelope, StoreError> {
            self.inner.update_text(id, text, at).await
        }
        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }
    }

    struct Harness {
        session: MessagingSession,
        workers: PersistenceWorkers,
        blobs: Arc<InMemoryBlobStore>,
    }

    fn harness(store: Arc<dyn MessageStore>) -> Harness {
        harness_with_blobs(store, BlobStoreConfig::default())
    }

    fn harness_with_blobs(store: Arc<dyn MessageStore>, blob_config: BlobStoreConfig) -> Harness {
        let blobs = Arc::new(InMemoryBlobStore::new(&blob_config));
        let workers = PersistenceWorkers::new(store, 4, MessagingMetrics::default());
        let session = MessagingSession::new(
            "c1",
            Identity::new("alice").unwrap(),
            blobs.clone(),
            workers.clone(),
            MessagingMetrics::default(),
        );
        Harness {
            session,
            workers,
            blobs,
        }
    }

    fn frames(items: Vec<InboundFrame>) -> impl Stream<Item = Result<InboundFrame, Infallible>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    fn text(json: &str) -> InboundFrame {
        InboundFrame::Text(json.to_string())
    }

    const HI: &str = r#"{"conversation_id":"c1","sender_username":"alice","message_type":"chat-text","text_content":"hi"}"#;

    async fn collect(mut rx: mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut out = Vec::new();
        while let Some(frame) = rx.recv().await {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn text_frame_is_echoed_then_persisted() {
        let store = Arc::new(InMemoryMessageStore::new());
        let Harness {
            session, workers, ..
        } = harness(store.clone());
        let (tx, rx) = mpsc::channel(16);

        let end = session.run(frames(vec![text(HI)]), tx).await;
        assert_eq!(end, SessionEnd::PeerClosed);
        workers.drain().await;

        let out = collect(rx).await;
        assert_eq!(out.len(), 1);
        let OutboundFrame::Envelope(envelope) = &out[0] else {
            panic!("expected echoed envelope, got {out:?}");
        };
        assert!(!envelope.message_id.is_empty());
        assert_eq!(envelope.text_content.as_deref(), Some("hi"));
        assert_eq!(envelope.media.media_type, MediaKind::None);
        assert_eq!(envelope.sender_handle, "alice");

        let stored = store.get(&envelope.message_id).await.expect("persisted");
        assert_eq!(&stored, envelope);
    }

    #[tokio::test]
    async fn unrecognized_kind_is_rejected_without_closing_session() {
        let store = Arc::new(InMemoryMessageStore::new());
        let Harness {
            session, workers, ..
        } = harness(store.clone());
        let (tx, rx) = mpsc::channel(16);

        let bad = r#"{"message_type":"MessageChat","text_content":"hi"}"#;
        let end = session
            .run(frames(vec![text(bad), text("{not json"), text(HI)]), tx)
            .await;
        assert_eq!(end, SessionEnd::PeerClosed);
        workers.drain().await;

        let out = collect(rx).await;
        assert_eq!(out.len(), 3);
        match &out[0] {
            OutboundFrame::Rejected(rejection) => {
                assert_eq!(rejection.error, "invalid_message");
                assert_eq!(rejection.details[0].field, "message_type");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(matches!(&out[1], OutboundFrame::Rejected(r) if r.error == "malformed_frame"));
        assert!(matches!(&out[2], OutboundFrame::Envelope(_)));
    }

    #[tokio::test]
    async fn persistence_failure_follows_the_echo() {
        let Harness {
            session, workers, ..
        } = harness(Arc::new(FailingStore));
        let (tx, rx) = mpsc::channel(16);

        session.run(frames(vec![text(HI)]), tx).await;
        workers.drain().await;

        let out = collect(rx).await;
        assert_eq!(out.len(), 2);
        let OutboundFrame::Envelope(envelope) = &out[0] else {
            panic!("echo must come first, got {out:?}");
        };
        let OutboundFrame::NotPersisted(notice) = &out[1] else {
            panic!("expected not-persisted notice, got {out:?}");
        };
        assert_eq!(notice.message_id, envelope.message_id);
    }

    #[tokio::test]
    async fn echo_does_not_wait_for_storage() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            gate: gate.clone(),
            inner: InMemoryMessageStore::new(),
        });
        let Harness {
            session, workers, ..
        } = harness(store.clone());
        let (tx, mut rx) = mpsc::channel(16);

        session.run(frames(vec![text(HI)]), tx).await;
        let Some(OutboundFrame::Envelope(envelope)) = rx.recv().await else {
            panic!("expected echo while persistence is blocked");
        };
        assert!(store.get(&envelope.message_id).await.is_err());

        gate.notify_one();
        workers.drain().await;
        assert!(store.get(&envelope.message_id).await.is_ok());
    }

    #[tokio::test]
    async fn binary_frame_round_trips_through_blob_store() {
        let store = Arc::new(InMemoryMessageStore::new());
        let Harness {
            session,
            workers,
            blobs,
        } = harness(store.clone());
        let (tx, rx) = mpsc::channel(16);

        session
            .run(frames(vec![InboundFrame::Binary(PNG.to_vec())]), tx)
            .await;
        workers.drain().await;

        let out = collect(rx).await;
        let OutboundFrame::Envelope(envelope) = &out[0] else {
            panic!("expected media envelope, got {out:?}");
        };
        assert_eq!(envelope.media.media_type, MediaKind::Image);
        assert!(envelope.text_content.is_none());
        assert!(envelope.has_single_body());

        let name = blobs
            .name_from_url(&envelope.media.media_url)
            .expect("url resolves to a blob name");
        assert_eq!(blobs.get(name).await.unwrap(), PNG);
        assert!(store.get(&envelope.message_id).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_and_empty_media_are_rejected_in_band() {
        let blob_config = BlobStoreConfig {
            max_blob_bytes: 8,
            ..BlobStoreConfig::default()
        };
        let Harness { session, .. } =
            harness_with_blobs(Arc::new(InMemoryMessageStore::new()), blob_config);
        let (tx, rx) = mpsc::channel(16);

        session
            .run(
                frames(vec![
                    InboundFrame::Binary(PNG.to_vec()),
                    InboundFrame::Binary(Vec::new()),
                    InboundFrame::Control,
                ]),
                tx,
            )
            .await;

        let out = collect(rx).await;
        assert_eq!(out.len(), 2);
        for frame in &out {
            assert!(matches!(frame, OutboundFrame::Rejected(r) if r.error == "media_rejected"));
        }
    }

    #[tokio::test]
    async fn transport_error_ends_session_before_later_frames() {
        let store = Arc::new(InMemoryMessageStore::new());
        let Harness {
            session, workers, ..
        } = harness(store.clone());
        let (tx, rx) = mpsc::channel(16);

        let inbound = stream::iter(vec![
            Err("connection reset".to_string()),
            Ok(text(HI)),
        ]);
        let end = session.run(inbound, tx).await;
        assert_eq!(end, SessionEnd::TransportError);
        workers.drain().await;
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let Harness { session, .. } = harness(Arc::new(InMemoryMessageStore::new()));
        let (tx, rx) = mpsc::channel(16);

        let end = session
            .run(frames(vec![InboundFrame::Close, text(HI)]), tx)
            .await;
        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn drained_pool_reports_late_submissions() {
        let workers = PersistenceWorkers::new(
            Arc::new(InMemoryMessageStore::new()),
            2,
            MessagingMetrics::default(),
        );
        workers.drain().await;

        let (tx, mut rx) = mpsc::channel(4);
        let envelope = Envelope::media_message(
            "c1",
            "alice",
            Media::stored("http://localhost/v1/media/chat/1.png", MediaKind::Image),
        );
        workers.submit(envelope.clone(), tx).await;
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::NotPersisted(PersistenceNotice::not_persisted(
                envelope.message_id
            )))
        );
    }
}
