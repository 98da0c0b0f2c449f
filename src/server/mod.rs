// Stream server — single-slot HTTP server over one session's files.

pub mod handler;
pub mod manager;
pub mod net;
