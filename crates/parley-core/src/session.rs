//! Client sessions.
//!
//! A [`Session`] owns one connection for its whole life. Running it
//! registers with the hub, then drives two loops until either side fails:
//!
//! - the read loop, on the caller's task, enforcing the message size limit
//!   and the read deadline, and feeding `chat_message` frames to the
//!   [`ChatPipeline`];
//! - the write loop, on its own task, draining the outbound queue in
//!   batches and pinging the peer on a fixed interval.
//!
//! Whichever loop stops first, teardown always goes through
//! [`HubHandle::unregister`].

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use parley_protocol::{codec, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
use parley_transport::{
    Connection, ConnectionId, ConnectionSink, ConnectionStream, Inbound, TransportError,
};

use crate::chat::ChatPipeline;
use crate::hub::{HubError, HubHandle, Member, MemberInfo};
use crate::presence::UserId;
use crate::queue::{outbound_queue, OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use crate::room::RoomId;

/// Identifies a session. Sessions reuse their connection's identifier.
pub type SessionId = ConnectionId;

/// Per-session limits and timers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Longest silence tolerated from the peer.
    pub read_timeout: Duration,
    /// Longest a single write may take.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(110),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(20),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection.
    PeerClosed,
    /// Nothing arrived within the read timeout.
    ReadTimeout,
    /// The connection failed while reading.
    TransportError,
    /// The peer sent a message over the size limit.
    MessageTooLarge,
    /// The write loop stopped: write failure, write timeout, or the hub
    /// closed the queue.
    WriterStopped,
    /// The hub stopped while the session was running.
    HubClosed,
}

impl SessionEnd {
    /// Get a short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::PeerClosed => "peer_closed",
            SessionEnd::ReadTimeout => "read_timeout",
            SessionEnd::TransportError => "transport_error",
            SessionEnd::MessageTooLarge => "message_too_large",
            SessionEnd::WriterStopped => "writer_stopped",
            SessionEnd::HubClosed => "hub_closed",
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live client connection.
pub struct Session {
    connection: Box<dyn Connection>,
    info: MemberInfo,
}

impl Session {
    /// Create a session over an established connection.
    pub fn new(
        connection: Box<dyn Connection>,
        username: impl Into<String>,
        room_id: impl Into<RoomId>,
        user_id: Option<UserId>,
    ) -> Self {
        let info = MemberInfo::new(connection.id().clone(), username, room_id, user_id);
        Self { connection, info }
    }

    /// Get the session identifier.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.info.session_id
    }

    /// Get the session description.
    #[must_use]
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    /// Run the session to completion.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running when the
    /// session tries to register.
    pub async fn run(
        self,
        hub: HubHandle,
        pipeline: Arc<ChatPipeline>,
        config: SessionConfig,
    ) -> Result<SessionEnd, HubError> {
        let Session { connection, info } = self;
        let session_id = info.session_id.clone();
        let remote = connection.remote_addr();
        let (sink, stream) = connection.split();

        let (sender, queue) = outbound_queue(config.queue_capacity);
        hub.register(Member::new(info.clone(), sender)).await?;
        info!(
            session = %session_id,
            room = %info.room_id,
            username = %info.username,
            remote = ?remote,
            "Session started"
        );

        let (writer_done, writer_stopped) = oneshot::channel();
        let writer = tokio::spawn(write_loop(
            session_id.clone(),
            sink,
            queue,
            config.clone(),
            writer_done,
        ));

        let end = read_loop(&info, stream, &pipeline, &config, writer_stopped).await;

        let end = match hub.unregister(session_id.clone()).await {
            Ok(()) => end,
            Err(HubError::Closed) => SessionEnd::HubClosed,
        };
        if let Err(e) = writer.await {
            warn!(session = %session_id, error = %e, "Write loop panicked");
        }

        info!(session = %session_id, reason = %end, "Session ended");
        Ok(end)
    }
}

async fn read_loop(
    info: &MemberInfo,
    mut stream: Box<dyn ConnectionStream>,
    pipeline: &ChatPipeline,
    config: &SessionConfig,
    mut writer_stopped: oneshot::Receiver<()>,
) -> SessionEnd {
    let session_id = &info.session_id;

    loop {
        let received = tokio::select! {
            _ = &mut writer_stopped => return SessionEnd::WriterStopped,
            received = timeout(config.read_timeout, stream.recv()) => received,
        };

        let data = match received {
            Err(_) => {
                debug!(session = %session_id, "Read timeout");
                return SessionEnd::ReadTimeout;
            }
            Ok(Ok(None)) => return SessionEnd::PeerClosed,
            Ok(Err(TransportError::ConnectionClosed)) => return SessionEnd::PeerClosed,
            Ok(Err(TransportError::MessageTooLarge(e))) => {
                warn!(session = %session_id, error = %e, "Disconnecting oversized peer");
                return SessionEnd::MessageTooLarge;
            }
            Ok(Err(e)) => {
                debug!(session = %session_id, error = %e, "Read failed");
                return SessionEnd::TransportError;
            }
            Ok(Ok(Some(Inbound::Heartbeat))) => {
                trace!(session = %session_id, "Heartbeat");
                continue;
            }
            Ok(Ok(Some(Inbound::Data(data)))) => data,
        };

        let message = match codec::decode_bounded(&data, config.max_message_size) {
            Ok(message) => message,
            Err(e @ ProtocolError::MessageTooLarge { .. }) => {
                warn!(session = %session_id, error = %e, "Disconnecting oversized peer");
                return SessionEnd::MessageTooLarge;
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "Dropping malformed message");
                continue;
            }
        };

        if !message.kind.is_actionable() {
            debug!(session = %session_id, kind = %message.kind, "Ignoring message");
            continue;
        }
        let content = message.content_str().to_string();
        if let Err(HubError::Closed) = pipeline.handle(info, content).await {
            return SessionEnd::HubClosed;
        }
    }
}

async fn write_loop(
    session_id: SessionId,
    mut sink: Box<dyn ConnectionSink>,
    mut queue: OutboundQueue,
    config: SessionConfig,
    _done: oneshot::Sender<()>,
) {
    let period = config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The heartbeat arm is polled first: a queue that is never empty must
    // not hold back pings.
    loop {
        tokio::select! {
            biased;
            _ = heartbeat.tick() => {
                if let Err(e) = with_deadline(config.write_timeout, sink.ping()).await {
                    debug!(session = %session_id, error = %e, "Heartbeat failed");
                    break;
                }
            }
            next = queue.recv() => {
                let Some(first) = next else {
                    debug!(session = %session_id, "Outbound queue closed");
                    break;
                };
                let frame: Bytes = queue.next_frame(first);
                if let Err(e) = with_deadline(config.write_timeout, sink.send(frame)).await {
                    debug!(session = %session_id, error = %e, "Write failed");
                    break;
                }
            }
        }
    }

    if let Err(e) = with_deadline(config.write_timeout, sink.close()).await {
        trace!(session = %session_id, error = %e, "Close failed");
    }
}

async fn with_deadline<F>(deadline: Duration, write: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    timeout(deadline, write)
        .await
        .map_err(|_| TransportError::Timeout)?
}
