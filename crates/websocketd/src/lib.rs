//! accent-websocketd - WebSocket gateway for bus events
//!
//! This crate provides the daemon side of the gateway:
//! - `auth` - Token lookups, expiry checks and the service token renewer
//! - `bus` - Bus connection and per-session subscriptions
//! - `session` - The per-client state machine
//! - `server` - WebSocket accept loop of one worker
//! - `pool` - Worker threads sharing the listening port
//! - `controller` - Startup ordering and shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     accent-websocketd                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   Controller    │────▶│  ServiceTokenRenewer        │    │
//! │  │ (startup order) │     │  (sets the master tenant)   │    │
//! │  └────────┬────────┘     └─────────────────────────────┘    │
//! │           │ start                                           │
//! │           ▼                                                 │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   ProcessPool   │────▶│  WebsocketServer (/ worker) │    │
//! │  │ (worker threads)│     │  BusService      (/ worker) │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │ connections       │
//! │                                         ▼                   │
//! │                          ┌─────────────────────────────┐    │
//! │                          │  Session (/ client)         │    │
//! │                          │  Authenticator, bus queue   │    │
//! │                          └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod auth;
pub mod bus;
pub mod config;
pub mod controller;
pub mod logging;
pub mod pool;
pub mod server;
pub mod session;
