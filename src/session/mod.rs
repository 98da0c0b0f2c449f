// Session state — the key→handle registry and the progress snapshots derived from it.

pub mod progress;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;
