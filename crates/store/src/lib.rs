//! Append-only store of intercepted network events.
//!
//! The proxy runs as a separate process and writes one folder per traffic
//! source under `<log_folder>/interfaces/<source>/`. Files are named with
//! zero-padded sequence numbers so lexicographic order equals arrival
//! order. Each file holds either one JSON envelope or line-delimited
//! envelopes.
//!
//! [`RecordStore`] reads those folders by polling. OS file notifications
//! are unreliable across the container, VM and WSL setups the harness
//! runs in, so the poll interval is a tunable owned by the caller.

mod envelope;
mod error;
mod record;
mod store;

pub use envelope::{Envelope, MessageEnvelope};
pub use error::{DeserializationError, StoreError};
pub use record::{Decoded, Payload, Record, RecordKind, Source};
pub use store::RecordStore;
