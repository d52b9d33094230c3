//! Per-session event stream: durable log + live fan-out.
//!
//! The stream is the spine of the platform. Every agent, tool, terminal,
//! approval and presence event for a session flows through one ordered,
//! append-only log and is simultaneously broadcast to live subscribers.
//!
//! ## Architecture
//!
//! ```text
//! producer ── publish ──► StreamService ── queue ──► per-session writer
//!                              │                           │
//!                              │                     persist (offset
//!                              │                     assigned by the log)
//!                              │                           │
//!                              ▼                           ▼
//!                        SessionRepository            LiveBus broadcast
//!                        (existence / closed)              │
//!                                                          ▼
//!                                          subscribers (SSE, UI panels)
//! ```
//!
//! Durability is deferred: `publish` returns once the event is accepted for
//! the session's writer queue. A persist failure is logged and the event is
//! still delivered live, so a live subscriber can see an event that later
//! replay will not contain.

mod bus;
mod channel;
mod error;
mod models;
mod repository;
mod service;

pub use bus::LiveBus;
pub use channel::Channel;
pub use error::{StreamError, StreamResult};
pub use models::{PublishReceipt, PublishRequest, SessionEvent, SessionSummary};
pub use repository::EventRepository;
pub use service::{EventStream, StreamService, SubscribeOptions};
