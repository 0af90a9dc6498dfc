//! Decoding of the fixed-layout records emitted by the nfsd kprobes.
//!
//! The BPF side writes `struct nfs_event` (or `struct nfs_event_legacy`) from
//! `src/bpf/nfsd_trace.h` into the perf buffer. Records are decoded field by
//! field from little-endian offsets rather than overlaid onto a Rust struct,
//! so the only contract with the producer is the byte layout below.
//!
//! ```text
//! versioned (80 bytes)          legacy (76 bytes)
//!  0  op       u32               0  op       u32
//!  4  size     u32               4  size     u32
//!  8  addr4    u32 (be octets)   8  addr4    u32 (be octets)
//! 12  version  u32              12  path     [u8; 64]
//! 16  path     [u8; 64]
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Size of the NUL padded path buffer in both layouts.
pub const PATH_LEN: usize = 64;

/// Wire value for a read operation.
pub const OP_READ: u32 = 0;
/// Wire value for a write operation.
pub const OP_WRITE: u32 = 1;

/// Shape of the records the kernel producer was configured to emit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RecordLayout {
    /// Records carry an explicit NFS protocol version.
    #[default]
    Versioned,
    /// Records omit the version field, only NFSv4 call sites are probed.
    Legacy,
}

impl RecordLayout {
    /// Number of bytes a record of this shape occupies on the wire.
    pub const fn record_size(self) -> usize {
        match self {
            RecordLayout::Versioned => 16 + PATH_LEN,
            // op, size and address ahead of the path: 76 bytes, not 72
            RecordLayout::Legacy => 12 + PATH_LEN,
        }
    }

    const fn path_offset(self) -> usize {
        match self {
            RecordLayout::Versioned => 16,
            RecordLayout::Legacy => 12,
        }
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordLayout::Versioned => write!(f, "versioned"),
            RecordLayout::Legacy => write!(f, "legacy"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{layout} record truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        layout: RecordLayout,
        expected: usize,
        actual: usize,
    },
}

/// Direction of an NFS data operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    /// Classify a raw op code. Anything other than [`OP_WRITE`] is a read.
    pub fn from_code(code: u32) -> Self {
        if code == OP_WRITE {
            Operation::Write
        } else {
            Operation::Read
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "READ",
            Operation::Write => "WRITE",
        }
    }
}

/// One decoded nfsd read or write invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsEvent {
    /// Raw op code as written by the producer.
    pub op: u32,
    /// Bytes requested by the operation.
    pub size: u32,
    pub client: Ipv4Addr,
    /// Protocol version, `None` for legacy records which don't carry one.
    pub version: Option<u32>,
    /// Export path, empty when the producer couldn't resolve it.
    pub path: String,
}

impl NfsEvent {
    pub fn operation(&self) -> Operation {
        Operation::from_code(self.op)
    }

    /// Decode a raw perf sample in the given layout.
    ///
    /// Samples may be longer than the record because perf pads raw samples to
    /// 8 bytes, anything past the record is ignored.
    pub fn decode(layout: RecordLayout, data: &[u8]) -> Result<Self, DecodeError> {
        let expected = layout.record_size();
        if data.len() < expected {
            return Err(DecodeError::Truncated {
                layout,
                expected,
                actual: data.len(),
            });
        }

        let version = match layout {
            RecordLayout::Versioned => Some(read_u32(data, 12)),
            RecordLayout::Legacy => None,
        };
        let path_offset = layout.path_offset();

        Ok(NfsEvent {
            op: read_u32(data, 0),
            size: read_u32(data, 4),
            client: Ipv4Addr::new(data[8], data[9], data[10], data[11]),
            version,
            path: decode_path(&data[path_offset..path_offset + PATH_LEN]),
        })
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Trim a NUL padded path buffer at its first NUL. A buffer with no NUL is
/// taken whole.
pub fn decode_path(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Encode an event the way the BPF producer lays it out.
#[cfg(test)]
pub(crate) fn encode(event: &NfsEvent, layout: RecordLayout) -> Vec<u8> {
    let mut buf = Vec::with_capacity(layout.record_size());
    buf.extend_from_slice(&event.op.to_le_bytes());
    buf.extend_from_slice(&event.size.to_le_bytes());
    buf.extend_from_slice(&event.client.octets());
    if layout == RecordLayout::Versioned {
        buf.extend_from_slice(&event.version.unwrap_or(0).to_le_bytes());
    }
    let mut path = [0u8; PATH_LEN];
    let bytes = event.path.as_bytes();
    let len = bytes.len().min(PATH_LEN);
    path[..len].copy_from_slice(&bytes[..len]);
    buf.extend_from_slice(&path);
    buf
}
