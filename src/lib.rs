//! Headless client for the Evict music session service.
//!
//! Connects to the bot's per-guild playback WebSocket, mirrors the remote
//! player state into a local [`player::PlayerState`], and sends control
//! commands back over the same connection. Track display data is enriched
//! from the service's lookup endpoints (artwork, lyrics, artist info) on a
//! best-effort basis.
//!
//! The main entry point is [`session::Session`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod http;
pub mod player;
pub mod protocol;
pub mod reconciler;
pub mod resolver;
pub mod session;
pub mod token;
