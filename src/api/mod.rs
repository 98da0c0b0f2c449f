// Embedding surface — tracing setup and the worker wiring used by the binary and tests.

pub mod simple;
pub mod worker_api;
