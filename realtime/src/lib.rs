//! Real-time fan-out for the peer-support platform.
//!
//! Clients hold one WebSocket each, authenticate with a bearer token and
//! subscribe to topics. Upstream services publish domain events, which reach
//! every authorized subscriber that is online at that moment.
//!
//! # Architecture
//!
//! - **Hub**: one control loop owns the registry of online connections and
//!   their subscriptions. Registration, delivery and queries all reach it
//!   through queues, so there is no lock on the registry.
//! - **Connection actor**: per socket, an inbound task drives the
//!   handshake / subscription state machine and an outbound task is the only
//!   writer, sending heartbeats and draining a bounded queue.
//! - **Backpressure**: delivery never blocks. A connection whose queue is
//!   full is evicted; the publisher and every other subscriber carry on.
//! - **Ephemeral messages**: offline users miss events and catch up through
//!   the regular HTTP APIs.
//!
//! # Topics
//!
//! | Topic          | Who may subscribe                  |
//! |----------------|------------------------------------|
//! | `posts`        | any authenticated identity         |
//! | `responses`    | any authenticated identity         |
//! | `post:{id}`    | any authenticated identity         |
//! | `user:{id}`    | that user only                     |
//! | `circle:{id}`  | members of the support circle      |
//!
//! # Example: publishing from a service
//!
//! ```rust,ignore
//! use realtime::message::Event;
//!
//! app_state.hub.publish_event(
//!     "post:42",
//!     Event::PostDeleted { post_id: "42".to_string() },
//! );
//! ```
//!
//! # Modules
//!
//! - `codec`: versioned envelope, two-phase decode and migrations
//! - `connection`: the per-socket actor and its transport-neutral frames
//! - `hub`: registry control loop, fan-out and presence
//! - `authorizer` / `identity`: who may subscribe to what
//! - `domain_event_handler`: bridge from `events::DomainEvent` to the hub

pub mod authorizer;
pub mod codec;
pub mod connection;
pub mod domain_event_handler;
pub mod error;
pub mod hub;
pub mod identity;
pub mod message;
pub mod topic;

pub use hub::Hub;
