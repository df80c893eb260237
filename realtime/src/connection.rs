//! One actor per physical connection.
//!
//! A [`Client`] bridges a socket to the [`Hub`] with two concurrent tasks:
//!
//! - **inbound**: reads frames, decodes control messages and drives the
//!   handshake / subscription state machine;
//! - **outbound**: the only writer. Drains the client's own replies and the
//!   hub-fed outbound queue, pings on a fixed interval and tears the
//!   connection down when the peer has been silent for too long.
//!
//! ```text
//! Connected(unauthenticated)
//!   --auth(valid)------------------> Authenticated(no subscriptions)
//!   --auth(invalid)----------------> unchanged, auth_error reported
//!   --subscribe(allowed topics)----> Authenticated(subscribed)
//!   --subscribe(denied topic)------> unchanged, subscribe_rejected reported
//!   --error / timeout / close------> Terminated (unregistered)
//! ```
//!
//! Transport details stay in the web layer; the actor only sees [`Frame`]s.

use crate::authorizer::{ChannelAuthorizer, Decision};
use crate::codec::Codec;
use crate::error::{protocol_error, Error, ProtocolErrorKind};
use crate::hub::{Hub, OutboundFrame, Registration};
use crate::identity::{Identity, TokenValidator, UserId};
use crate::message::{ControlFrame, EventType, Message};
use crate::topic::Topic;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::*;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Replies the inbound task may have in flight to the writer.
const REPLY_CAPACITY: usize = 32;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Capacity of the hub-fed outbound queue.
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Inbound silence tolerated before the connection is considered dead.
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_auth_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 16 * 1024,
            max_auth_attempts: 3,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    ClientClosed,
    ReadError,
    ProtocolViolation(&'static str),
    AuthAttemptsExhausted,
    /// The hub closed the outbound queue (unregistered, replaced, evicted or shut down).
    QueueClosed,
    HeartbeatTimeout,
    WriteFailed,
}

pub struct Client {
    id: ConnectionId,
    hub: Hub,
    codec: Arc<Codec>,
    validator: Arc<dyn TokenValidator>,
    authorizer: Arc<ChannelAuthorizer>,
    settings: ClientSettings,
}

impl Client {
    pub fn new(
        hub: Hub,
        codec: Arc<Codec>,
        validator: Arc<dyn TokenValidator>,
        authorizer: Arc<ChannelAuthorizer>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            hub,
            codec,
            validator,
            authorizer,
            settings,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Serve the connection until either side ends it. Always leaves the
    /// connection unregistered.
    pub async fn run<S, E, K>(self, mut stream: S, sink: K) -> Termination
    where
        S: Stream<Item = Result<Frame, E>> + Unpin + Send,
        E: Display + Send,
        K: Sink<Frame> + Unpin + Send + 'static,
        K::Error: Display,
    {
        debug!("Connection {} opened", self.id.as_str());

        let (queue_tx, queue_rx) = mpsc::channel(self.settings.queue_capacity);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        let (seen_tx, seen_rx) = watch::channel(Instant::now());

        let mut outbound: JoinHandle<Termination> = tokio::spawn(outbound_task(
            sink,
            queue_rx,
            reply_rx,
            seen_rx,
            self.settings.clone(),
            self.id.clone(),
        ));

        let mut inbound = Inbound {
            client: &self,
            state: State::Unauthenticated { failed_attempts: 0 },
            queue_tx: Some(queue_tx),
            registered: None,
            reply_tx,
            seen_tx,
        };

        let mut outbound_done = false;
        let termination = tokio::select! {
            termination = inbound.run(&mut stream) => termination,
            joined = &mut outbound => {
                outbound_done = true;
                joined.unwrap_or_else(|e| {
                    error!("Outbound task for connection {} failed: {e}", self.id.as_str());
                    Termination::WriteFailed
                })
            }
        };

        // Set as soon as a registration is sent, so a handshake cut short by
        // the writer finishing is still unregistered.
        let registered = inbound.registered.take();
        // Dropping the reply sender lets the writer flush pending replies and close.
        drop(inbound);

        if let Some(user_id) = &registered {
            self.hub.unregister(user_id, &self.id);
        }

        if !outbound_done {
            let grace = self.settings.write_timeout * 2;
            if tokio::time::timeout(grace, &mut outbound).await.is_err() {
                debug!("Aborting stalled writer for connection {}", self.id.as_str());
                outbound.abort();
            }
        }

        info!(
            "Connection {} ({}) closed: {:?}",
            self.id.as_str(),
            registered.as_deref().unwrap_or("unauthenticated"),
            termination
        );
        termination
    }
}

enum State {
    Unauthenticated { failed_attempts: u32 },
    Authenticated {
        identity: Identity,
        topics: HashSet<Topic>,
    },
}

enum Flow {
    Continue,
    Close(Termination),
}

struct Inbound<'a> {
    client: &'a Client,
    state: State,
    /// Held until registration hands it to the hub.
    queue_tx: Option<mpsc::Sender<OutboundFrame>>,
    /// User the hub may hold an entry for on behalf of this connection.
    registered: Option<UserId>,
    reply_tx: mpsc::Sender<String>,
    seen_tx: watch::Sender<Instant>,
}

impl Inbound<'_> {
    fn identity(&self) -> Option<&Identity> {
        match &self.state {
            State::Authenticated { identity, .. } => Some(identity),
            State::Unauthenticated { .. } => None,
        }
    }

    async fn run<S, E>(&mut self, stream: &mut S) -> Termination
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        loop {
            let frame = match stream.next().await {
                None => return Termination::ClientClosed,
                Some(Err(e)) => {
                    debug!("Read failed on connection {}: {e}", self.client.id.as_str());
                    return Termination::ReadError;
                }
                Some(Ok(frame)) => frame,
            };
            self.seen_tx.send_replace(Instant::now());

            let outcome = match frame {
                Frame::Text(text) => self.handle_text(&text).await,
                Frame::Binary(_) => Err(protocol_error(
                    ProtocolErrorKind::BinaryFrame,
                    "Only text frames are accepted",
                )),
                Frame::Ping(_) | Frame::Pong(_) => Ok(Flow::Continue),
                Frame::Close => return Termination::ClientClosed,
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close(termination)) => return termination,
                Err(e) if !e.is_connection_fatal() => {
                    if let Flow::Close(termination) = self.handshake_failed(e).await {
                        return termination;
                    }
                }
                Err(e) => {
                    warn!(
                        "Closing connection {} after protocol violation: {e}",
                        self.client.id.as_str()
                    );
                    let code = e.code();
                    self.reply(Message::Error {
                        code: code.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                    return Termination::ProtocolViolation(code);
                }
            }
        }
    }

    /// Authentication errors returned from here cost one handshake attempt;
    /// everything else is fatal to the connection.
    async fn handle_text(&mut self, text: &str) -> Result<Flow, Error> {
        if text.len() > self.client.settings.max_frame_bytes {
            return Err(protocol_error(
                ProtocolErrorKind::FrameTooLarge,
                "Frame exceeds the size limit",
            ));
        }

        let frame = self.client.codec.decode_control(text)?;
        debug!(
            "Connection {} sent {} frame",
            self.client.id.as_str(),
            frame.event_type()
        );

        match frame {
            ControlFrame::Auth { token } => self.authenticate(&token).await,
            ControlFrame::Subscribe { channels } => self.subscribe(channels).await,
            ControlFrame::Unsubscribe { channels } => self.unsubscribe(channels).await,
        }
    }

    async fn authenticate(&mut self, token: &str) -> Result<Flow, Error> {
        if let State::Authenticated { .. } = self.state {
            return Err(protocol_error(
                ProtocolErrorKind::AlreadyAuthenticated,
                "Re-authentication requires a new connection",
            ));
        }

        let identity = self.client.validator.validate_token(token).await?;

        let Some(outbound) = self.queue_tx.take() else {
            return Err(protocol_error(
                ProtocolErrorKind::AlreadyAuthenticated,
                "Connection was already registered",
            ));
        };
        self.registered = Some(identity.user_id().clone());
        self.client
            .hub
            .register(Registration {
                connection_id: self.client.id.clone(),
                identity: identity.clone(),
                outbound,
            })
            .await?;

        self.reply(Message::AuthOk {
            user_id: identity.user_id().clone(),
        })
        .await;
        self.state = State::Authenticated {
            identity,
            topics: HashSet::new(),
        };
        Ok(Flow::Continue)
    }

    async fn handshake_failed(&mut self, e: Error) -> Flow {
        let State::Unauthenticated { failed_attempts } = &mut self.state else {
            return Flow::Continue;
        };
        *failed_attempts += 1;
        let failed_attempts = *failed_attempts;

        warn!(
            "Connection {} failed authentication ({}/{}): {e}",
            self.client.id.as_str(),
            failed_attempts,
            self.client.settings.max_auth_attempts
        );
        self.reply(Message::AuthError {
            code: e.code().to_string(),
            reason: e.to_string(),
        })
        .await;

        if failed_attempts >= self.client.settings.max_auth_attempts {
            Flow::Close(Termination::AuthAttemptsExhausted)
        } else {
            Flow::Continue
        }
    }

    async fn subscribe(&mut self, channels: Vec<String>) -> Result<Flow, Error> {
        let identity = self.require_identity()?;

        let mut allowed = Vec::new();
        for channel in channels {
            match self.client.authorizer.authorize(&identity, &channel).await {
                Decision::Allow(topic) => allowed.push(topic),
                Decision::Deny(reason) => {
                    let denial = Error::from(reason);
                    debug!(
                        "User {} denied subscription to {:?}: {denial}",
                        identity.user_id(),
                        channel
                    );
                    self.reply(Message::SubscribeRejected {
                        channel,
                        reason: denial.code().to_string(),
                    })
                    .await;
                }
            }
        }

        if allowed.is_empty() {
            return Ok(Flow::Continue);
        }

        let registered = self
            .client
            .hub
            .subscribe(identity.user_id(), &self.client.id, allowed.clone())
            .await?;
        if !registered {
            return Ok(Flow::Close(Termination::QueueClosed));
        }

        if let State::Authenticated { topics, .. } = &mut self.state {
            topics.extend(allowed.iter().cloned());
        }
        self.reply(Message::Subscribed {
            channels: allowed.iter().map(Topic::to_string).collect(),
        })
        .await;
        Ok(Flow::Continue)
    }

    async fn unsubscribe(&mut self, channels: Vec<String>) -> Result<Flow, Error> {
        let identity = self.require_identity()?;

        // Names that never parsed can't be subscribed, so they are simply skipped.
        let topics: Vec<Topic> = channels
            .iter()
            .filter_map(|channel| channel.parse().ok())
            .collect();

        let registered = self
            .client
            .hub
            .unsubscribe(identity.user_id(), &self.client.id, topics.clone())
            .await?;
        if !registered {
            return Ok(Flow::Close(Termination::QueueClosed));
        }

        if let State::Authenticated { topics: current, .. } = &mut self.state {
            for topic in &topics {
                current.remove(topic);
            }
        }
        self.reply(Message::Unsubscribed {
            channels: topics.iter().map(Topic::to_string).collect(),
        })
        .await;
        Ok(Flow::Continue)
    }

    fn require_identity(&self) -> Result<Identity, Error> {
        self.identity().cloned().ok_or_else(|| {
            protocol_error(
                ProtocolErrorKind::NotAuthenticated,
                "Authenticate before managing subscriptions",
            )
        })
    }

    async fn reply(&self, message: Message) {
        let kind = message.event_type();
        match self.client.codec.encode(message) {
            Ok(text) => {
                if self.reply_tx.send(text).await.is_err() {
                    debug!(
                        "Writer for connection {} gone, dropping {kind} reply",
                        self.client.id.as_str()
                    );
                }
            }
            Err(e) => error!("Failed to encode {kind} reply: {e}"),
        }
    }
}

async fn outbound_task<K>(
    mut sink: K,
    mut queue: mpsc::Receiver<OutboundFrame>,
    mut replies: mpsc::Receiver<String>,
    seen: watch::Receiver<Instant>,
    settings: ClientSettings,
    id: ConnectionId,
) -> Termination
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );

    let termination = loop {
        let silence_deadline = *seen.borrow() + settings.pong_timeout;

        let written = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(text) => write(&mut sink, Frame::Text(text), settings.write_timeout).await,
                // The inbound side is done.
                None => break Termination::ClientClosed,
            },
            frame = queue.recv() => match frame {
                Some(frame) => write(&mut sink, Frame::Text(frame.to_string()), settings.write_timeout).await,
                None => break Termination::QueueClosed,
            },
            _ = tokio::time::sleep_until(silence_deadline) => {
                // The peer may have spoken since the deadline was armed.
                let silent_for = seen.borrow().elapsed();
                if silent_for >= settings.pong_timeout {
                    warn!(
                        "Connection {} silent for {:?}, closing",
                        id.as_str(),
                        silent_for
                    );
                    break Termination::HeartbeatTimeout;
                }
                Ok(())
            }
            _ = heartbeat.tick() => {
                write(&mut sink, Frame::Ping(Vec::new()), settings.write_timeout).await
            }
        };

        if let Err(termination) = written {
            break termination;
        }
    };

    if termination != Termination::WriteFailed {
        let _ = write(&mut sink, Frame::Close, settings.write_timeout).await;
    }
    let _ = tokio::time::timeout(settings.write_timeout, sink.close()).await;
    termination
}

async fn write<K>(sink: &mut K, frame: Frame, limit: Duration) -> Result<(), Termination>
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("Write failed: {e}");
            Err(Termination::WriteFailed)
        }
        Err(_) => {
            warn!("Write timed out after {:?}", limit);
            Err(Termination::WriteFailed)
        }
    }
}
