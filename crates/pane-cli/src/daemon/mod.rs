//! Server-side machinery plus the client connection layer.

pub mod client;
pub mod connection;
pub mod paths;
pub mod pty;
pub mod registry;
pub mod server;
pub mod session;
pub mod subscriber;
pub mod terminal;

pub use client::{ConnectOptions, PaneClient};
pub use server::PaneServer;
