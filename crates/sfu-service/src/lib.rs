//! SFU control plane.
//!
//! The coordination layer of a selective forwarding unit for
//! many-participant audio/video conferencing. Clients open a duplex link,
//! authenticate with a signed token, announce the streams they produce, and
//! the control plane maintains the N x N mesh of forwarding links through
//! an external media engine.
//!
//! # Architecture
//!
//! An actor hierarchy supervised from a single process root:
//!
//! ```text
//! Supervisor (signals, start/stop ordering)
//! ├── WorkerPool (fixed engine workers, least-memory selection)
//! ├── ControllerActor (channel registries by uuid and issuer)
//! │   └── ChannelActor (sessions, capacity, idle deadline)
//! │       └── SessionActor (bus, transports, producers, consumers)
//! └── HTTP + Gateway (channel creation, stats, link handshake)
//! ```
//!
//! The media engine itself (RTP transports, codec negotiation) is an
//! external collaborator consumed through the traits in [`media`].
//!
//! # Modules
//!
//! - [`actors`] - controller/channel/session actors
//! - [`bus`] - framed link, correlated request/response, batching
//! - [`config`] - environment configuration
//! - [`gateway`] - first-message authentication handshake
//! - [`media`] - abstract media engine interface
//! - [`routes`], [`handlers`] - the `/v1` HTTP surface
//! - [`supervisor`] - process lifecycle and signals
//! - [`workers`] - media worker pool

#![warn(clippy::pedantic)]

pub mod actors;
pub mod bus;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod media;
pub mod routes;
pub mod supervisor;
pub mod workers;
