//! nfstrace library - the pieces behind the `nfstrace` exporter.
//!
//! # Modules
//!
//! - [`record`] - decoding of the records the nfsd kprobes emit
//! - [`probes`] - attachment and release of the kprobes
//! - [`reader`] - perf buffer consumption loop
//! - [`dispatch`] - routing of events into the NFS counter series
//! - [`metrics_server`] - `/metrics` endpoint
//! - [`nfstrace_core`] - wiring of the above into a running exporter
//!
//! # Example
//!
//! ```
//! use nfstrace::record::{NfsEvent, RecordLayout};
//!
//! let mut raw = [0u8; 80];
//! raw[0] = 1; // write
//! raw[4..8].copy_from_slice(&4096u32.to_le_bytes());
//! raw[8..12].copy_from_slice(&[192, 168, 1, 10]);
//! raw[12] = 4;
//! raw[16..23].copy_from_slice(b"/export");
//!
//! let event = NfsEvent::decode(RecordLayout::Versioned, &raw).unwrap();
//! assert_eq!(event.client.to_string(), "192.168.1.10");
//! assert_eq!(event.path, "/export");
//! ```

pub mod dispatch;
pub mod metrics_server;
pub mod nfstrace_core;
pub mod probes;
pub mod reader;
pub mod record;

#[cfg(test)]
mod test_utils;

pub use nfstrace_core::{bump_memlock_rlimit, nfstrace, Config};
pub use record::{DecodeError, NfsEvent, Operation, RecordLayout};
