//! Core protocol types and wire codec shared by the pane server and client.

pub mod error;
pub mod protocol;
pub mod screen;
pub mod wire;
