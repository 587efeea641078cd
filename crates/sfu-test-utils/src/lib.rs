//! Test support for the SFU control plane.
//!
//! - [`engine`] - in-memory media engine implementing the full
//!   [`sfu_service::media`] trait surface, with failure injection
//! - [`link`] - in-memory duplex link pairs
//! - [`client`] - a scripted client driving the far end of a link
//! - [`tokens`] - token builders for auth scenarios
//!
//! Everything here is test-only plumbing; nothing is wired into the
//! production binary.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod engine;
pub mod link;
pub mod tokens;
