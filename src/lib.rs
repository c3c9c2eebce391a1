//! Core library for the least-connections mTLS TCP forwarder.
//!
//! The binary (`main.rs`) is a thin wrapper around [`server::Server`];
//! the modules here are exposed so integration tests can exercise the
//! forwarder, rate limiter, and authorizer directly.

pub mod authorizer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod identity;
pub mod limiter;
pub mod server;
pub mod tls;
