// Log forwarder agent
// Tails local log files and ships batches of raw lines to the central ingest
// endpoint. Lines are never dropped within one process lifetime: a failed
// batch is retried with exponential backoff ahead of newer lines.

pub mod forwarder;

pub use forwarder::{AgentConfig, Forwarder};
