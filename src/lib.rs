#![forbid(unsafe_code)]

//! RingPing turns a slice of an online video into a downloadable ringtone.
//!
//! The server binary (`backend`) exposes the JSON API and the downloads tree;
//! `sweep_orphans` cleans up files the database no longer references.

pub mod api;
pub mod auth;
pub mod builder;
pub mod config;
pub mod ringtones;
pub mod security;
pub mod store;
pub mod sweep;
pub mod tools;
pub mod validation;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
