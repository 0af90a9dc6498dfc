use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use nfstrace::nfstrace_core::{DEFAULT_LISTEN, DEFAULT_PERF_PAGES};
use nfstrace::{nfstrace, Config, RecordLayout};

/// Export per-client NFS server read/write counters collected with kprobes.
#[derive(Debug, Parser)]
#[command(name = "nfstrace", version)]
struct Command {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Address to serve /metrics on
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,
    /// Record shape emitted by the kernel probes
    #[arg(long, value_enum, default_value_t = RecordLayout::Versioned)]
    record_layout: RecordLayout,
    /// Per-CPU perf buffer size in pages (power of two)
    #[arg(long, default_value_t = DEFAULT_PERF_PAGES)]
    perf_pages: usize,
    /// Don't attach the NFSv3 probes
    #[arg(long)]
    no_nfsv3: bool,
}

impl From<Command> for Config {
    fn from(cmd: Command) -> Self {
        Config {
            verbosity: cmd.verbose,
            listen: cmd.listen,
            record_layout: cmd.record_layout,
            perf_pages: cmd.perf_pages,
            nfsv3: !cmd.no_nfsv3,
        }
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let default_filter = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    nfstrace(Config::from(opts))
}
