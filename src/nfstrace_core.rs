//! Pipeline wiring for nfstrace.
//!
//! Loads the nfsd BPF object, hooks the nfsd read/write handlers, and pumps the
//! perf buffer into the counter registry until SIGINT or SIGTERM.

use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use libbpf_rs::skel::{OpenSkel, SkelBuilder};
use libbpf_rs::PerfBufferBuilder;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::dispatch::MetricDispatcher;
use crate::metrics_server::MetricsServer;
use crate::probes::{NfsdProbe, ProbeSet};
use crate::reader::{self, EventConsumer, ShutdownSignal};
use crate::record::RecordLayout;

/// Memory lock limit for BPF programs (128 MiB)
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

/// Default per-CPU perf buffer size in pages
pub const DEFAULT_PERF_PAGES: usize = 64;

/// Default address for the metrics listener
pub const DEFAULT_LISTEN: &str = "0.0.0.0:2112";

// Include BPF skeleton in a module to allow suppressing warnings from generated code
#[allow(unused_imports)]
#[allow(clippy::all)]
mod bpf {
    include!(concat!(env!("OUT_DIR"), "/nfsd_trace.skel.rs"));
}

use bpf::{NfsdTraceSkelBuilder, OpenNfsdTraceSkel};

/// Runtime options for [`nfstrace`], separated from the CLI parsing concerns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = info, 1 = debug, 2+ = trace)
    pub verbosity: u8,
    /// Address the metrics endpoint listens on
    pub listen: SocketAddr,
    /// Record shape the kernel producer emits
    pub record_layout: RecordLayout,
    /// Per-CPU perf buffer size in pages, must be a power of two
    pub perf_pages: usize,
    /// Attach the NFSv3 probes (versioned layout only)
    pub nfsv3: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            listen: SocketAddr::from(([0, 0, 0, 0], 2112)),
            record_layout: RecordLayout::Versioned,
            perf_pages: DEFAULT_PERF_PAGES,
            nfsv3: true,
        }
    }
}

impl Config {
    /// Reject settings the kernel would refuse, before anything is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.perf_pages == 0 || !self.perf_pages.is_power_of_two() {
            bail!(
                "Perf buffer size must be a non-zero power of two pages, got {}",
                self.perf_pages
            );
        }
        Ok(())
    }
}

/// Bump the memory lock rlimit for BPF programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} bytes ({} MiB). This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES,
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

fn configure_bpf_skeleton(open_skel: &mut OpenNfsdTraceSkel, opts: &Config) -> Result<()> {
    let rodata = open_skel
        .maps
        .rodata_data
        .as_deref_mut()
        .context("BPF object has no rodata section")?;
    rodata.legacy_layout = opts.record_layout == RecordLayout::Legacy;

    let required = NfsdProbe::required(opts.record_layout, opts.nfsv3);
    if !required.contains(&NfsdProbe::Nfsd3ProcWrite) {
        open_skel.progs.nfsd3_proc_write_entry.set_autoload(false);
    }
    if !required.contains(&NfsdProbe::Nfsd3ProcRead) {
        open_skel.progs.nfsd3_proc_read_entry.set_autoload(false);
    }
    Ok(())
}

/// Run the exporter until a shutdown signal arrives.
pub fn nfstrace(opts: Config) -> Result<()> {
    opts.validate()?;
    bump_memlock_rlimit()?;

    let shutdown = Arc::new(ShutdownSignal::new().context("Failed to create shutdown eventfd")?);
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.signal())
            .context("Failed to install SIGINT/SIGTERM handler")?;
    }

    let mut skel_builder = NfsdTraceSkelBuilder::default();
    if opts.verbosity > 1 {
        skel_builder.obj_builder.debug(true);
    }

    let mut open_object = MaybeUninit::uninit();
    let mut open_skel = skel_builder
        .open(&mut open_object)
        .context("Failed to open BPF skeleton. Ensure BPF is supported on your kernel.")?;
    configure_bpf_skeleton(&mut open_skel, &opts)?;
    let skel = open_skel
        .load()
        .context("Failed to load BPF skeleton into kernel. Check dmesg for BPF verifier errors.")?;

    let probes = NfsdProbe::required(opts.record_layout, opts.nfsv3)
        .into_iter()
        .map(|probe| (probe.func_name(), probe));
    let links = ProbeSet::attach(probes, |func_name, probe| {
        let prog = match probe {
            NfsdProbe::Nfsd4Write => &skel.progs.nfsd4_write_entry,
            NfsdProbe::Nfsd4Read => &skel.progs.nfsd4_read_entry,
            NfsdProbe::Nfsd3ProcWrite => &skel.progs.nfsd3_proc_write_entry,
            NfsdProbe::Nfsd3ProcRead => &skel.progs.nfsd3_proc_read_entry,
        };
        Ok(prog.attach_kprobe(false, func_name)?)
    })?;

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let consumer = EventConsumer::new(opts.record_layout, MetricDispatcher::new(recorder));

    let perf = PerfBufferBuilder::new(&skel.maps.events)
        .pages(opts.perf_pages)
        .sample_cb(|cpu: i32, data: &[u8]| consumer.handle_sample(cpu, data))
        .lost_cb(|cpu: i32, count: u64| consumer.handle_lost(cpu, count))
        .build()
        .context("Failed to open perf buffer on the events map")?;

    let server = MetricsServer::start(opts.listen, handle)?;

    info!(
        "Listening for NFS events ({} records, {} probes). Press Ctrl-C to exit.",
        opts.record_layout,
        links.len()
    );
    let result =
        reader::run(&perf, &consumer, &shutdown).context("Waiting on perf buffer failed");

    info!("Stopping...");
    drop(perf);
    let server_result = server.shutdown();
    drop(links);
    drop(skel);

    let stats = consumer.stats();
    info!(
        "Processed {} NFS events, {} decode errors, {} lost samples, {} read errors",
        stats.events(),
        stats.decode_errors(),
        stats.lost_samples(),
        stats.read_errors()
    );

    result?;
    server_result
}
