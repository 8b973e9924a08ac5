//! Per-connection session management.
//!
//! Each WebSocket connection gets a [`Session`]. The socket is split: the
//! read pump owns the stream half and feeds envelopes to the hub; the write
//! pump owns the sink half and drains the connection's outbound buffer. The
//! two share only the [`ConnectionHandle`] and the keepalive timer.

use crate::config::KeepaliveConfig;
use crate::connection::{ConnectionHandle, OutboundReceiver, PushError};
use crate::error::{ProtocolError, ProtocolResult, RelayError};
use crate::hub::{RelayHub, RouteOutcome};
use crate::keepalive::KeepaliveTimer;
use crate::protocol::peek_message_id;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use mailroom_types::{unix_now, Ack, AckStatus, Identity, MessageId, ServerFrame, WireFormat};
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};

/// Keepalive timer shared by the two pumps of one connection.
pub type SharedKeepalive = Arc<Mutex<KeepaliveTimer>>;

/// Timing and batching for the write pump.
#[derive(Debug, Clone, Copy)]
pub struct WriteSettings {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Deadline for one batch or control write.
    pub write_timeout: Duration,
    /// Maximum frames fed before a flush.
    pub max_batch: usize,
}

impl WriteSettings {
    /// Build from relay configuration.
    pub fn new(keepalive: &KeepaliveConfig, max_batch: usize) -> Self {
        Self {
            ping_interval: keepalive.ping_interval(),
            write_timeout: keepalive.write_timeout(),
            max_batch: max_batch.max(1),
        }
    }
}

/// A per-connection session.
pub struct Session {
    hub: Arc<RelayHub>,
    handle: Arc<ConnectionHandle>,
    format: WireFormat,
    keepalive: SharedKeepalive,
}

impl Session {
    /// Create a session for `identity` and the receiver its write pump owns.
    pub fn new(
        hub: Arc<RelayHub>,
        identity: Identity,
        remote_address: impl Into<String>,
        format: WireFormat,
    ) -> (Self, OutboundReceiver) {
        let config = hub.config();
        let (handle, outbound) =
            ConnectionHandle::new(identity, remote_address, config.limits.outbound_buffer);
        let keepalive = Arc::new(Mutex::new(KeepaliveTimer::new(
            Instant::now(),
            config.keepalive.pong_wait(),
        )));
        let session = Self {
            hub,
            handle,
            format,
            keepalive,
        };
        (session, outbound)
    }

    /// The connection handle this session registers with the hub.
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Run the session over `socket` until either side ends it.
    pub async fn run<S, E>(self, outbound: OutboundReceiver, socket: S)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: Display + Send,
        E: Display + Send,
    {
        let identity = self.handle.identity().clone();
        let (sink, stream) = socket.split();

        if let Err(e) = self.hub.register(self.handle.clone()) {
            tracing::debug!("Refusing session for {}: {}", identity, e);
            let mut sink = sink;
            let _ = timeout(
                self.hub.config().keepalive.write_timeout(),
                sink.send(Message::Close(None)),
            )
            .await;
            return;
        }
        tracing::info!(
            "Session started for {} from {} ({:?})",
            identity,
            self.handle.remote_address(),
            self.format
        );

        let settings = WriteSettings::new(
            &self.hub.config().keepalive,
            self.hub.config().session.max_batch,
        );
        let writer = tokio::spawn(write_pump(
            self.handle.clone(),
            outbound,
            self.format,
            self.keepalive.clone(),
            settings,
            sink,
        ));

        match self.read_pump(stream).await {
            Ok(()) => tracing::debug!("Read pump for {} finished", identity),
            Err(e) => tracing::info!("Read pump for {} ended: {}", identity, e),
        }

        self.hub.unregister(&self.handle);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Write pump for {} ended: {}", identity, e),
            Err(e) => tracing::error!("Write pump for {} panicked: {}", identity, e),
        }
        tracing::info!("Session ended for {}", identity);
    }

    /// Read frames until the peer closes, the transport fails, the keepalive
    /// deadline passes or the handle is closed.
    ///
    /// Malformed or refused envelopes are answered with an error frame and
    /// do not end the loop.
    pub async fn read_pump<S, E>(&self, mut stream: S) -> ProtocolResult<()>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let deadline = self.keepalive().deadline();
            let next = tokio::select! {
                _ = self.handle.closed() => return Ok(()),
                next = timeout_at(deadline, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    let timer = self.keepalive();
                    if timer.is_expired(Instant::now()) {
                        return Err(ProtocolError::KeepaliveTimeout(timer.pong_wait()));
                    }
                    // A ping went out and moved the deadline
                    continue;
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(ProtocolError::Transport(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if !self.handle_frame(WireFormat::Json, text.as_bytes()) {
                        return Ok(());
                    }
                }
                Message::Binary(bytes) => {
                    if !self.handle_frame(WireFormat::MessagePack, &bytes) {
                        return Ok(());
                    }
                }
                Message::Pong(_) => self.keepalive().pong_received(Instant::now()),
                // Answered by the transport
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    tracing::debug!("{} sent close: {:?}", self.handle.identity(), frame);
                    return Ok(());
                }
            }
        }
    }

    fn keepalive(&self) -> std::sync::MutexGuard<'_, KeepaliveTimer> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode, rate-limit and route one envelope frame.
    fn submit(
        &self,
        format: WireFormat,
        bytes: &[u8],
    ) -> crate::error::Result<(MessageId, RouteOutcome)> {
        let identity = self.handle.identity();
        let envelope = self
            .hub
            .policy()
            .decode(format, bytes, identity, unix_now())?;
        self.hub.rate_limits().check_message(identity)?;
        let message_id = envelope.id.clone();
        let outcome = self.hub.route(envelope)?;
        Ok((message_id, outcome))
    }

    /// Handle one envelope frame, answering with an ack or error frame.
    ///
    /// Returns `false` once the hub has shut down.
    fn handle_frame(&self, format: WireFormat, bytes: &[u8]) -> bool {
        let identity = self.handle.identity();
        match self.submit(format, bytes) {
            Ok((message_id, outcome)) => {
                if self.hub.config().session.send_acks {
                    self.notify(ack(message_id, outcome));
                }
            }
            Err(RelayError::ShuttingDown) => return false,
            Err(RelayError::Protocol(e)) => {
                tracing::warn!("Rejected frame from {}: {}", identity, e);
                self.hub.record_malformed();
                self.notify(ServerFrame::error(
                    e.code(),
                    e.to_string(),
                    peek_message_id(format, bytes),
                ));
            }
            Err(RelayError::RateLimited(e)) => {
                tracing::warn!("Rate limited {}: {}", identity, e);
                self.hub.record_rate_limited();
                self.notify(ServerFrame::error(
                    e.code(),
                    e.to_string(),
                    peek_message_id(format, bytes),
                ));
            }
            Err(e) => tracing::error!("Frame from {} failed: {}", identity, e),
        }
        true
    }

    /// Best-effort control frame back to this client.
    fn notify(&self, frame: ServerFrame) {
        if let Err(PushError::Full) = self.handle.try_send(frame) {
            tracing::debug!(
                "Outbound buffer full for {}, control frame dropped",
                self.handle.identity()
            );
        }
    }
}

fn ack(message_id: MessageId, outcome: RouteOutcome) -> ServerFrame {
    let status = match outcome {
        RouteOutcome::Delivered => AckStatus::Delivered,
        RouteOutcome::Queued => AckStatus::Queued,
    };
    ServerFrame::Ack(Ack { message_id, status })
}

/// Encode a frame for the session's wire format.
pub fn encode_frame(
    frame: &ServerFrame,
    format: WireFormat,
) -> Result<Message, mailroom_types::WireError> {
    Ok(match format {
        WireFormat::Json => Message::Text(frame.to_json()?),
        WireFormat::MessagePack => Message::Binary(frame.to_msgpack()?),
    })
}

/// Drain `outbound` into `sink` until the handle closes or a write fails.
///
/// Frames already buffered are coalesced (up to `max_batch`) into one flush.
/// Pings go out every `ping_interval`. On close a Close frame is sent and
/// anything left in the buffer is discarded.
pub async fn write_pump<K>(
    handle: Arc<ConnectionHandle>,
    mut outbound: OutboundReceiver,
    format: WireFormat,
    keepalive: SharedKeepalive,
    settings: WriteSettings,
    mut sink: K,
) -> ProtocolResult<()>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );

    let result = loop {
        tokio::select! {
            biased;
            _ = handle.closed() => break Ok(()),
            frame = outbound.recv() => {
                let Some(frame) = frame else { break Ok(()) };
                if handle.is_closed() {
                    break Ok(());
                }
                let batch = async {
                    feed(&mut sink, &frame, format).await?;
                    let mut fed = 1;
                    while fed < settings.max_batch {
                        match outbound.try_recv() {
                            Ok(frame) => {
                                feed(&mut sink, &frame, format).await?;
                                fed += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    sink.flush().await.map_err(transport)
                };
                if let Err(e) = bounded(settings.write_timeout, batch).await {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                let ping = async { sink.send(Message::Ping(Vec::new())).await.map_err(transport) };
                if let Err(e) = bounded(settings.write_timeout, ping).await {
                    break Err(e);
                }
                keepalive
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .probe_sent(Instant::now());
            }
        }
    };

    // The read pump watches the handle; closing it ends the session.
    handle.close();
    if result.is_ok() {
        let _ = timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
    }
    result
}

async fn feed<K>(sink: &mut K, frame: &ServerFrame, format: WireFormat) -> ProtocolResult<()>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match encode_frame(frame, format) {
        Ok(message) => sink.feed(message).await.map_err(transport),
        Err(e) => {
            tracing::error!("Failed to encode outbound frame: {}", e);
            Ok(())
        }
    }
}

async fn bounded<F>(limit: Duration, write: F) -> ProtocolResult<()>
where
    F: std::future::Future<Output = ProtocolResult<()>>,
{
    match timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Transport(format!(
            "write timed out after {limit:?}"
        ))),
    }
}

fn transport<E: Display>(e: E) -> ProtocolError {
    ProtocolError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use futures_util::stream;
    use mailroom_types::Envelope;
    use std::convert::Infallible;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn test_hub(config: Config) -> Arc<RelayHub> {
        Arc::new(RelayHub::new(config))
    }

    fn text(value: serde_json::Value) -> Result<Message, Infallible> {
        Ok(Message::Text(value.to_string()))
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn read_pump_routes_and_acks() {
        let hub = test_hub(Config::default());
        let (bob, mut bob_rx) = ConnectionHandle::new(id("bob"), "peer", 8);
        hub.register(bob).unwrap();

        let (session, mut alice_rx) = Session::new(hub.clone(), id("alice"), "peer", WireFormat::Json);
        hub.register(session.handle().clone()).unwrap();

        let frames = stream::iter(vec![
            text(serde_json::json!({"id": "m1", "to": "bob", "from": "mallory", "payload": "aGk="})),
            text(serde_json::json!({"id": "m2", "to": "carol", "from": "alice", "payload": "aGk="})),
        ]);
        session.read_pump(frames).await.unwrap();

        let delivered = drain(&mut bob_rx);
        let ServerFrame::Deliver(env) = &delivered[0] else {
            panic!("expected delivery, got {delivered:?}");
        };
        assert_eq!(env.from, id("alice"));
        assert_eq!(env.payload, b"hi");

        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ack(MessageId::from("m1"), RouteOutcome::Delivered),
                ack(MessageId::from("m2"), RouteOutcome::Queued),
            ]
        );
        assert_eq!(hub.queued_for(&id("carol")), 1);
    }

    #[tokio::test]
    async fn malformed_frames_get_error_and_connection_survives() {
        let hub = test_hub(Config::default());
        let (session, mut rx) = Session::new(hub.clone(), id("alice"), "peer", WireFormat::Json);
        hub.register(session.handle().clone()).unwrap();

        let frames = stream::iter(vec![
            Ok::<_, Infallible>(Message::Text("{broken".into())),
            text(serde_json::json!({"id": "m1", "from": "alice", "payload": "aGk="})),
            text(serde_json::json!({"id": "m2", "to": "bob", "from": "alice", "payload": "aGk="})),
        ]);
        session.read_pump(frames).await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], ServerFrame::Error(n) if n.code == "malformed"));
        assert!(matches!(
            &frames[1],
            ServerFrame::Error(n) if n.code == "missing_field"
                && n.message_id == Some(MessageId::from("m1"))
        ));
        assert!(matches!(&frames[2], ServerFrame::Ack(a) if a.status == AckStatus::Queued));
        assert_eq!(hub.metrics().malformed_frames.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn binary_frames_are_messagepack() {
        let hub = test_hub(Config::default());
        let (session, _rx) = Session::new(hub.clone(), id("alice"), "peer", WireFormat::MessagePack);
        hub.register(session.handle().clone()).unwrap();

        let env = Envelope::new(id("bob"), id("alice"), vec![9, 9, 9]);
        let frames = stream::iter(vec![Ok::<_, Infallible>(Message::Binary(env.to_msgpack().unwrap()))]);
        session.read_pump(frames).await.unwrap();
        assert_eq!(hub.queued_for(&id("bob")), 1);
    }

    #[tokio::test]
    async fn rate_limited_frames_get_error() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 1;
        config.session.send_acks = false;
        let hub = test_hub(config);
        let (session, mut rx) = Session::new(hub.clone(), id("alice"), "peer", WireFormat::Json);
        hub.register(session.handle().clone()).unwrap();

        let frames = stream::iter(vec![
            text(serde_json::json!({"id": "m1", "to": "bob", "from": "alice", "payload": "aGk="})),
            text(serde_json::json!({"id": "m2", "to": "bob", "from": "alice", "payload": "aGk="})),
        ]);
        session.read_pump(frames).await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerFrame::Error(n) if n.code == "rate_limited"
                && n.message_id == Some(MessageId::from("m2"))
        ));
        assert_eq!(hub.queued_for(&id("bob")), 1);
    }

    #[tokio::test]
    async fn acks_do_not_crowd_out_inbound_envelopes() {
        let mut config = Config::default();
        config.limits.outbound_buffer = 2;
        let hub = test_hub(config);
        let (session, mut rx) = Session::new(hub.clone(), id("alice"), "peer", WireFormat::Json);
        hub.register(session.handle().clone()).unwrap();

        let frames = stream::iter(vec![
            text(serde_json::json!({"id": "m1", "to": "bob", "from": "alice", "payload": "aGk="})),
            text(serde_json::json!({"id": "m2", "to": "bob", "from": "alice", "payload": "aGk="})),
        ]);
        session.read_pump(frames).await.unwrap();

        let reply = Envelope::new(id("alice"), id("bob"), b"back".to_vec());
        assert_eq!(hub.route(reply).unwrap(), RouteOutcome::Delivered);
        assert_eq!(hub.queued_for(&id("alice")), 0);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], ServerFrame::Ack(a) if a.message_id == MessageId::from("m1")));
        assert!(matches!(&frames[1], ServerFrame::Deliver(env) if env.payload == b"back"));
    }

    #[tokio::test]
    async fn pong_extends_deadline() {
        let hub = test_hub(Config::default());
        let (session, _rx) = Session::new(hub, id("alice"), "peer", WireFormat::Json);
        let before = session.keepalive().deadline();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let frames = stream::iter(vec![Ok::<_, Infallible>(Message::Pong(Vec::new()))]);
        session.read_pump(frames).await.unwrap();
        assert!(session.keepalive().deadline() > before);
    }

    #[tokio::test]
    async fn silent_peer_hits_keepalive_timeout() {
        let mut config = Config::default();
        config.keepalive.pong_wait_secs = 1;
        let hub = test_hub(config);
        let (session, _rx) = Session::new(hub, id("alice"), "peer", WireFormat::Json);

        let err = session
            .read_pump(stream::pending::<Result<Message, Infallible>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::KeepaliveTimeout(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn read_pump_stops_when_handle_closes() {
        let hub = test_hub(Config::default());
        let (session, _rx) = Session::new(hub, id("alice"), "peer", WireFormat::Json);
        let handle = session.handle().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.close();
        });
        let result = timeout(
            Duration::from_secs(1),
            session.read_pump(stream::pending::<Result<Message, Infallible>>()),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    fn settings(ping_interval: Duration, max_batch: usize) -> WriteSettings {
        WriteSettings {
            ping_interval,
            write_timeout: Duration::from_secs(1),
            max_batch,
        }
    }

    fn keepalive() -> SharedKeepalive {
        Arc::new(Mutex::new(KeepaliveTimer::new(
            Instant::now(),
            Duration::from_secs(60),
        )))
    }

    fn deliver(n: u32) -> ServerFrame {
        let mut env = Envelope::new(id("alice"), id("bob"), vec![n as u8 + 1]);
        env.id = format!("m{n}").into();
        ServerFrame::Deliver(env)
    }

    #[tokio::test]
    async fn write_pump_coalesces_then_closes() {
        let (handle, rx) = ConnectionHandle::new(id("alice"), "peer", 8);
        for n in 0..3 {
            handle.try_send(deliver(n)).unwrap();
        }
        let mut sink: Vec<Message> = Vec::new();
        let closer = handle.clone();
        let (result, ()) = tokio::join!(
            write_pump(
                handle,
                rx,
                WireFormat::Json,
                keepalive(),
                settings(Duration::from_secs(60), 2),
                &mut sink,
            ),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                closer.close();
            }
        );
        result.unwrap();

        assert_eq!(sink.len(), 4);
        for (n, message) in sink[..3].iter().enumerate() {
            let Message::Text(text) = message else {
                panic!("expected text frame, got {message:?}");
            };
            let frame = ServerFrame::decode(WireFormat::Json, text.as_bytes()).unwrap();
            assert_eq!(frame, deliver(n as u32));
        }
        assert!(matches!(sink[3], Message::Close(None)));
    }

    #[tokio::test]
    async fn write_pump_encodes_msgpack_as_binary() {
        let (handle, rx) = ConnectionHandle::new(id("alice"), "peer", 8);
        handle.try_send(deliver(7)).unwrap();
        let mut sink: Vec<Message> = Vec::new();
        let closer = handle.clone();
        let (result, ()) = tokio::join!(
            write_pump(
                handle,
                rx,
                WireFormat::MessagePack,
                keepalive(),
                settings(Duration::from_secs(60), 8),
                &mut sink,
            ),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                closer.close();
            }
        );
        result.unwrap();

        let Message::Binary(bytes) = &sink[0] else {
            panic!("expected binary frame");
        };
        assert_eq!(
            ServerFrame::decode(WireFormat::MessagePack, bytes).unwrap(),
            deliver(7)
        );
    }

    #[tokio::test]
    async fn write_pump_discards_buffer_of_closed_handle() {
        let (handle, rx) = ConnectionHandle::new(id("alice"), "peer", 8);
        handle.try_send(deliver(1)).unwrap();
        handle.close();

        let mut sink: Vec<Message> = Vec::new();
        write_pump(
            handle,
            rx,
            WireFormat::Json,
            keepalive(),
            settings(Duration::from_secs(60), 8),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(sink.len(), 1);
        assert!(matches!(sink[0], Message::Close(None)));
    }

    #[tokio::test]
    async fn write_pump_pings_and_arms_keepalive() {
        let (handle, rx) = ConnectionHandle::new(id("alice"), "peer", 8);
        let timer = keepalive();
        let mut sink: Vec<Message> = Vec::new();
        let closer = handle.clone();
        let (result, ()) = tokio::join!(
            write_pump(
                handle,
                rx,
                WireFormat::Json,
                timer.clone(),
                settings(Duration::from_millis(10), 8),
                &mut sink,
            ),
            async move {
                tokio::time::sleep(Duration::from_millis(35)).await;
                closer.close();
            }
        );
        result.unwrap();

        assert!(sink.iter().any(|m| matches!(m, Message::Ping(_))));
        assert!(matches!(
            timer.lock().unwrap().state(),
            crate::keepalive::KeepaliveState::AwaitingPong { .. }
        ));
    }
}
