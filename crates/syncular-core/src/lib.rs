//! Sync core: commit ingestion, incremental pull with bootstrap snapshots,
//! request-event recording, and maintenance.
//!
//! Everything here is storage-trait generic and transport-agnostic; the
//! daemon wires these components to HTTP/WS handlers and to the realtime
//! registry.

pub mod chunk;
pub mod ingest;
pub mod maintenance;
pub mod notify;
pub mod pull;
pub mod recorder;
pub mod trace;

pub use chunk::{decode_chunk_rows, encode_chunk, ChunkRow, EncodedChunk};
pub use ingest::{CommitIngestor, PushOutcome, SyncContext};
pub use maintenance::MaintenanceScheduler;
pub use notify::notify_data_change;
pub use pull::{PullOutcome, PullPlanner};
pub use recorder::{spawn_recorder, EventDraft, RecorderHandle};
pub use trace::{parse_sentry_trace, parse_traceparent, TraceContext};
