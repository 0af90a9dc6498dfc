//! Routing of decoded NFS events into the per-version counter series.

use std::fmt;

use log::info;
use metrics::{counter, describe_counter, Label, Recorder};

use crate::record::{NfsEvent, Operation};

pub const NFS4_READ_BYTES: &str = "nfs4_read_bytes_total";
pub const NFS4_WRITE_BYTES: &str = "nfs4_write_bytes_total";
pub const NFS4_READ_OPERATIONS: &str = "nfs4_read_operations_total";
pub const NFS4_WRITE_OPERATIONS: &str = "nfs4_write_operations_total";
pub const NFS3_READ_BYTES: &str = "nfs3_read_bytes_total";
pub const NFS3_WRITE_BYTES: &str = "nfs3_write_bytes_total";
pub const NFS3_READ_OPERATIONS: &str = "nfs3_read_operations_total";
pub const NFS3_WRITE_OPERATIONS: &str = "nfs3_write_operations_total";

/// Log target for the one-line-per-event diagnostic stream.
pub const EVENT_LOG_TARGET: &str = "nfstrace::events";

/// Which family of counters an event lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScope {
    /// NFSv4, labeled by client, path and version.
    V4,
    /// NFSv3, labeled by client and version only.
    V3,
}

impl VersionScope {
    /// Legacy records carry no version but only come from the NFSv4 probes.
    pub fn classify(version: Option<u32>) -> Option<Self> {
        match version {
            Some(4) | None => Some(VersionScope::V4),
            Some(3) => Some(VersionScope::V3),
            Some(_) => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VersionScope::V4 => "4",
            VersionScope::V3 => "3",
        }
    }

    fn counters(self, op: Operation) -> (&'static str, &'static str) {
        match (self, op) {
            (VersionScope::V4, Operation::Read) => (NFS4_READ_BYTES, NFS4_READ_OPERATIONS),
            (VersionScope::V4, Operation::Write) => (NFS4_WRITE_BYTES, NFS4_WRITE_OPERATIONS),
            (VersionScope::V3, Operation::Read) => (NFS3_READ_BYTES, NFS3_READ_OPERATIONS),
            (VersionScope::V3, Operation::Write) => (NFS3_WRITE_BYTES, NFS3_WRITE_OPERATIONS),
        }
    }

    fn labels(self, event: &NfsEvent) -> Vec<Label> {
        let mut labels = vec![Label::new("client", event.client.to_string())];
        if self == VersionScope::V4 {
            labels.push(Label::new("path", event.path.clone()));
        }
        labels.push(Label::new("version", self.label()));
        labels
    }
}

/// Human readable line describing one event.
pub struct TraceLine<'a>(pub &'a NfsEvent);

impl fmt::Display for TraceLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        write!(
            f,
            "NFS {} | Client: {} | Size: {} bytes | Path: {} | Version: ",
            event.operation().as_str(),
            event.client,
            event.size,
            event.path
        )?;
        match event.version {
            Some(version) => write!(f, "{version}"),
            None => write!(f, "{} (legacy)", VersionScope::V4.label()),
        }
    }
}

/// Updates the byte and operation counters for each event.
///
/// The dispatcher owns the recorder the counters live in; the metrics server
/// reads the same registry through a handle taken before construction.
pub struct MetricDispatcher<R> {
    recorder: R,
}

impl<R: Recorder> MetricDispatcher<R> {
    pub fn new(recorder: R) -> Self {
        metrics::with_local_recorder(&recorder, describe_counters);
        Self { recorder }
    }

    /// Record one event, returning the scope it was counted under. Events
    /// with an unsupported version are logged but not counted.
    pub fn dispatch(&self, event: &NfsEvent) -> Option<VersionScope> {
        let scope = VersionScope::classify(event.version);
        if let Some(scope) = scope {
            let (bytes, operations) = scope.counters(event.operation());
            let labels = scope.labels(event);
            metrics::with_local_recorder(&self.recorder, || {
                counter!(bytes, labels.clone()).increment(u64::from(event.size));
                counter!(operations, labels).increment(1);
            });
        }

        info!(target: EVENT_LOG_TARGET, "{}", TraceLine(event));
        scope
    }
}

fn describe_counters() {
    describe_counter!(NFS4_READ_BYTES, "Total bytes read from NFS v4 by client and path");
    describe_counter!(NFS4_WRITE_BYTES, "Total bytes written to NFS v4 by client and path");
    describe_counter!(
        NFS4_READ_OPERATIONS,
        "Total number of NFS v4 read operations by client and path"
    );
    describe_counter!(
        NFS4_WRITE_OPERATIONS,
        "Total number of NFS v4 write operations by client and path"
    );
    describe_counter!(NFS3_READ_BYTES, "Total bytes read from NFS v3 by client");
    describe_counter!(NFS3_WRITE_BYTES, "Total bytes written to NFS v3 by client");
    describe_counter!(NFS3_READ_OPERATIONS, "Total number of NFS v3 read operations by client");
    describe_counter!(NFS3_WRITE_OPERATIONS, "Total number of NFS v3 write operations by client");
}
