// Torrent session controller — registry, event translation, progress snapshots and a stream server
// over a pluggable transfer engine.

pub mod api;
pub mod config;
pub mod controller;
pub mod detect;
pub mod engine;
pub mod error;
pub mod extract;
pub mod persist;
pub mod protocol;
pub mod server;
pub mod session;
pub mod translator;
