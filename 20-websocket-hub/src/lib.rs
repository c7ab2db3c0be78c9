//! WebSocket fan-out hub: every message a client sends is relayed to every
//! connected client.
//!
//! See `README.md` for usage and the JSON envelope. Each module focuses on a
//! concrete responsibility:
//!
//! - [`hub`] owns the live-connection set in a single task and serializes
//!   register, unregister and broadcast requests against it.
//! - [`connection`] mints ids and runs the per-client inbound and outbound
//!   loops.
//! - [`server`] binds the listener and upgrades `GET /ws` into sessions.
//! - [`message`] defines the `{sender, content}` envelope.
//! - [`cli`] parses the command-line configuration.
//!
//! Integration tests drive a real server with WebSocket clients; unit tests
//! exercise the hub and the loops directly through channels.

pub mod cli;
pub mod connection;
pub mod hub;
pub mod message;
pub mod server;
