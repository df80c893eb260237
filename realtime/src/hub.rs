//! The hub: sole authority over who is connected and what they receive.
//!
//! The registry lives inside a single control-loop task and is never shared.
//! Every operation reaches it through a queue:
//!
//! - `register` and `unregister` change membership,
//! - `broadcast`, `send_to_user` and presence announcements request delivery,
//! - subscriptions and the read-only queries (`is_online`, `online_count`)
//!   carry a `oneshot` for their answer.
//!
//! The loop drains the queues with a biased `select!` in that order, so a
//! query always observes every membership change and delivery requested
//! before it.
//!
//! Delivery never blocks. A connection whose outbound queue is full is
//! evicted on the spot: its entry is dropped, which closes the queue and
//! tells its outbound task to tear the socket down.

use crate::codec::Codec;
use crate::connection::ConnectionId;
use crate::error::{
    delivery_error, internal_error, DeliveryErrorKind, Error, ErrorKind, InternalErrorKind,
};
use crate::identity::{Identity, UserId};
use crate::message::{Event, EventType};
use crate::topic::Topic;
use log::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// An encoded envelope, shared by every connection it is delivered to.
pub type OutboundFrame = Arc<str>;

/// What a connection hands the hub once it has authenticated.
pub struct Registration {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    /// Producer side of the connection's bounded outbound queue. The hub
    /// holds the only sender, so dropping it closes the queue.
    pub outbound: mpsc::Sender<OutboundFrame>,
}

struct Unregistration {
    user_id: UserId,
    connection_id: ConnectionId,
}

#[derive(Debug)]
enum Target {
    Topic(Topic),
    User(UserId),
    Everyone { except: Option<UserId> },
}

struct Dispatch {
    target: Target,
    frame: OutboundFrame,
}

enum Control {
    Subscribe {
        user_id: UserId,
        connection_id: ConnectionId,
        topics: Vec<Topic>,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        user_id: UserId,
        connection_id: ConnectionId,
        topics: Vec<Topic>,
        reply: oneshot::Sender<bool>,
    },
    IsOnline {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    OnlineCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Counters exposed to operators. Written by the control loop, read anywhere.
#[derive(Default)]
pub struct HubStats {
    registered: AtomicU64,
    unregistered: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    slow_consumer_evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStatsSnapshot {
    pub registered: u64,
    pub unregistered: u64,
    pub published: u64,
    pub delivered: u64,
    pub slow_consumer_evictions: u64,
}

impl HubStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            slow_consumer_evictions: self.slow_consumer_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Cheap, cloneable handle to the control loop.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::UnboundedSender<(Registration, oneshot::Sender<()>)>,
    unregister_tx: mpsc::UnboundedSender<Unregistration>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    control_tx: mpsc::UnboundedSender<Control>,
    codec: Arc<Codec>,
    stats: Arc<HubStats>,
}

impl Hub {
    /// Spawn the control loop and return a handle to it.
    pub fn start(codec: Arc<Codec>) -> (Hub, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(HubStats::default());

        let control_loop = ControlLoop {
            registry: HashMap::new(),
            codec: codec.clone(),
            stats: stats.clone(),
        };
        let handle = tokio::spawn(control_loop.run(
            register_rx,
            unregister_rx,
            dispatch_rx,
            control_rx,
        ));

        let hub = Hub {
            register_tx,
            unregister_tx,
            dispatch_tx,
            control_tx,
            codec,
            stats,
        };
        (hub, handle)
    }

    /// Add an authenticated connection and announce the user as online.
    /// Resolves once the connection is in the registry.
    pub async fn register(&self, registration: Registration) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.register_tx
            .send((registration, ack_tx))
            .map_err(|_| hub_unavailable())?;
        ack_rx.await.map_err(|_| hub_unavailable())
    }

    /// Remove a connection. Removing a connection that is no longer
    /// registered is a no-op.
    pub fn unregister(&self, user_id: &UserId, connection_id: &ConnectionId) {
        let request = Unregistration {
            user_id: user_id.clone(),
            connection_id: connection_id.clone(),
        };
        if self.unregister_tx.send(request).is_err() {
            debug!("Hub stopped before connection {} unregistered", connection_id.as_str());
        }
    }

    /// Deliver `event` to every connection subscribed to `topic`.
    pub fn broadcast(&self, topic: &Topic, event: Event) {
        self.dispatch(Target::Topic(topic.clone()), event);
    }

    /// Entry point for upstream services: publish `event` to a topic given
    /// by name. Unknown topics are logged and dropped; callers never hear
    /// about delivery outcomes.
    pub fn publish_event(&self, topic: &str, event: Event) {
        match topic.parse::<Topic>() {
            Ok(topic) => self.broadcast(&topic, event),
            Err(_) => warn!(
                "Dropping {} event published to unknown topic {:?}",
                event.event_type(),
                topic
            ),
        }
    }

    /// Deliver `event` to one user's connection, if they are online.
    pub fn send_to_user(&self, user_id: &str, event: Event) {
        self.dispatch(Target::User(user_id.to_string()), event);
    }

    /// Add topics to a registered connection. Returns `false` when the
    /// connection is no longer registered.
    pub async fn subscribe(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        topics: Vec<Topic>,
    ) -> Result<bool, Error> {
        let (reply, answer) = oneshot::channel();
        self.control(Control::Subscribe {
            user_id: user_id.clone(),
            connection_id: connection_id.clone(),
            topics,
            reply,
        })?;
        answer.await.map_err(|_| hub_unavailable())
    }

    /// Remove topics from a registered connection.
    pub async fn unsubscribe(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        topics: Vec<Topic>,
    ) -> Result<bool, Error> {
        let (reply, answer) = oneshot::channel();
        self.control(Control::Unsubscribe {
            user_id: user_id.clone(),
            connection_id: connection_id.clone(),
            topics,
            reply,
        })?;
        answer.await.map_err(|_| hub_unavailable())
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = Control::IsOnline {
            user_id: user_id.to_string(),
            reply,
        };
        if self.control(request).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    pub async fn online_count(&self) -> usize {
        let (reply, answer) = oneshot::channel();
        if self.control(Control::OnlineCount { reply }).is_err() {
            return 0;
        }
        answer.await.unwrap_or(0)
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the control loop, closing every outbound queue.
    pub fn shutdown(&self) {
        if self.control(Control::Shutdown).is_err() {
            debug!("Hub already stopped");
        }
    }

    fn dispatch(&self, target: Target, event: Event) {
        let frame = match self.codec.encode(event) {
            Ok(text) => OutboundFrame::from(text),
            Err(e) => {
                error!("Failed to encode event for {:?}: {e}", target);
                return;
            }
        };

        if self.dispatch_tx.send(Dispatch { target, frame }).is_err() {
            warn!("Hub stopped, dropping dispatch");
        }
    }

    fn control(&self, request: Control) -> Result<(), Error> {
        self.control_tx.send(request).map_err(|_| hub_unavailable())
    }
}

fn hub_unavailable() -> Error {
    internal_error(InternalErrorKind::HubUnavailable, "Hub control loop is not running")
}

struct Entry {
    connection_id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<OutboundFrame>,
    topics: HashSet<Topic>,
}

impl Entry {
    fn try_deliver(&self, frame: &OutboundFrame) -> Result<(), Error> {
        self.outbound.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => {
                delivery_error(DeliveryErrorKind::QueueFull, "Outbound queue is full")
            }
            TrySendError::Closed(_) => {
                delivery_error(DeliveryErrorKind::QueueClosed, "Outbound queue is closed")
            }
        })
    }
}

struct ControlLoop {
    registry: HashMap<UserId, Entry>,
    codec: Arc<Codec>,
    stats: Arc<HubStats>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut register_rx: mpsc::UnboundedReceiver<(Registration, oneshot::Sender<()>)>,
        mut unregister_rx: mpsc::UnboundedReceiver<Unregistration>,
        mut dispatch_rx: mpsc::UnboundedReceiver<Dispatch>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        info!("Hub control loop started");

        loop {
            tokio::select! {
                biased;
                Some((registration, ack)) = register_rx.recv() => {
                    self.register(registration);
                    let _ = ack.send(());
                }
                Some(request) = unregister_rx.recv() => {
                    self.unregister(request);
                }
                Some(dispatch) = dispatch_rx.recv() => {
                    HubStats::bump(&self.stats.published);
                    let departed = self.fan_out(&dispatch.target, &dispatch.frame);
                    self.announce_departures(departed);
                }
                Some(request) = control_rx.recv() => {
                    if !self.control(request) {
                        break;
                    }
                }
                else => break,
            }
        }

        let remaining = self.registry.len();
        self.registry.clear();
        info!("Hub control loop stopped, closed {remaining} connection(s)");
    }

    fn register(&mut self, registration: Registration) {
        let user_id = registration.identity.user_id().clone();
        let announce_as = registration.identity.public_name();
        let entry = Entry {
            connection_id: registration.connection_id,
            identity: registration.identity,
            outbound: registration.outbound,
            topics: HashSet::new(),
        };
        HubStats::bump(&self.stats.registered);

        info!(
            "Registered connection {} for user {}",
            entry.connection_id.as_str(),
            user_id
        );

        // Dropping the replaced entry closes the older connection's queue.
        if let Some(previous) = self.registry.insert(user_id.clone(), entry) {
            info!(
                "Connection {} replaced connection {} for user {}",
                self.registry[&user_id].connection_id.as_str(),
                previous.connection_id.as_str(),
                user_id
            );
            return;
        }

        let online = Event::UserOnline {
            user_id: user_id.clone(),
            display_name: announce_as,
        };
        if let Some(frame) = self.encode(online) {
            let departed = self.fan_out(
                &Target::Everyone {
                    except: Some(user_id),
                },
                &frame,
            );
            self.announce_departures(departed);
        }
    }

    fn unregister(&mut self, request: Unregistration) {
        let matches = self
            .registry
            .get(&request.user_id)
            .is_some_and(|entry| entry.connection_id == request.connection_id);

        if !matches {
            debug!(
                "Connection {} already unregistered",
                request.connection_id.as_str()
            );
            return;
        }

        self.registry.remove(&request.user_id);
        HubStats::bump(&self.stats.unregistered);
        info!(
            "Unregistered connection {} for user {}",
            request.connection_id.as_str(),
            request.user_id
        );
        self.announce_departures(vec![request.user_id]);
    }

    /// Enqueue `frame` on every connection `target` selects. Connections that
    /// cannot take it are removed from the registry and returned.
    fn fan_out(&mut self, target: &Target, frame: &OutboundFrame) -> Vec<UserId> {
        let recipients: Vec<&Entry> = match target {
            Target::User(user_id) => self.registry.get(user_id).into_iter().collect(),
            Target::Topic(topic) => self
                .registry
                .values()
                .filter(|entry| entry.topics.contains(topic))
                .collect(),
            Target::Everyone { except } => self
                .registry
                .values()
                .filter(|entry| Some(entry.identity.user_id()) != except.as_ref())
                .collect(),
        };

        let mut failed = Vec::new();
        for entry in recipients {
            match entry.try_deliver(frame) {
                Ok(()) => HubStats::bump(&self.stats.delivered),
                Err(e) => {
                    match e.error_kind {
                        ErrorKind::Delivery(DeliveryErrorKind::QueueFull) => {
                            HubStats::bump(&self.stats.slow_consumer_evictions);
                            warn!(
                                "Evicting slow consumer: connection {} for user {} ({e})",
                                entry.connection_id.as_str(),
                                entry.identity.user_id()
                            );
                        }
                        _ => debug!(
                            "Dropping connection {} with closed queue",
                            entry.connection_id.as_str()
                        ),
                    }
                    failed.push(entry.identity.user_id().clone());
                }
            }
        }

        for user_id in &failed {
            self.registry.remove(user_id);
            HubStats::bump(&self.stats.unregistered);
        }
        failed
    }

    /// Announce `user_offline` for each departed user. Announcing can evict
    /// further slow consumers, who are announced in turn.
    fn announce_departures(&mut self, mut departed: Vec<UserId>) {
        while let Some(user_id) = departed.pop() {
            let offline = Event::UserOffline {
                user_id: user_id.clone(),
            };
            let Some(frame) = self.encode(offline) else {
                continue;
            };
            departed.extend(self.fan_out(
                &Target::Everyone {
                    except: Some(user_id),
                },
                &frame,
            ));
        }
    }

    /// Handle a control request. Returns `false` when the loop should stop.
    fn control(&mut self, request: Control) -> bool {
        match request {
            Control::Subscribe {
                user_id,
                connection_id,
                topics,
                reply,
            } => {
                let entry = self.entry_mut(&user_id, &connection_id);
                let found = entry.is_some();
                if let Some(entry) = entry {
                    debug!("User {} subscribed to {:?}", user_id, topics);
                    entry.topics.extend(topics);
                }
                let _ = reply.send(found);
            }
            Control::Unsubscribe {
                user_id,
                connection_id,
                topics,
                reply,
            } => {
                let entry = self.entry_mut(&user_id, &connection_id);
                let found = entry.is_some();
                if let Some(entry) = entry {
                    debug!("User {} unsubscribed from {:?}", user_id, topics);
                    for topic in &topics {
                        entry.topics.remove(topic);
                    }
                }
                let _ = reply.send(found);
            }
            Control::IsOnline { user_id, reply } => {
                let _ = reply.send(self.registry.contains_key(&user_id));
            }
            Control::OnlineCount { reply } => {
                let _ = reply.send(self.registry.len());
            }
            Control::Shutdown => {
                info!("Hub shutdown requested");
                return false;
            }
        }
        true
    }

    fn entry_mut(&mut self, user_id: &UserId, connection_id: &ConnectionId) -> Option<&mut Entry> {
        self.registry
            .get_mut(user_id)
            .filter(|entry| &entry.connection_id == connection_id)
    }

    fn encode(&self, event: Event) -> Option<OutboundFrame> {
        match self.codec.encode(event) {
            Ok(text) => Some(OutboundFrame::from(text)),
            Err(e) => {
                error!("Failed to encode presence event: {e}");
                None
            }
        }
    }
}
