//! `nb-gateway`: the NodeBridge gateway process.
//!
//! Wires the node bridge (`nb-bridge`) to a workspace skill catalog, answers
//! node-initiated requests, and exposes an HTTP/WebSocket surface for UI
//! subscribers and operators.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod cors;
pub mod requests;
pub mod skills;
pub mod state;
