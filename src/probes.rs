//! Ownership of the kprobe attachments.

use anyhow::{Context, Result};
use log::{debug, info};

use crate::record::RecordLayout;

/// nfsd functions we hook, in the order they are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfsdProbe {
    Nfsd4Write,
    Nfsd4Read,
    Nfsd3ProcWrite,
    Nfsd3ProcRead,
}

impl NfsdProbe {
    pub const ALL: [NfsdProbe; 4] = [
        NfsdProbe::Nfsd4Write,
        NfsdProbe::Nfsd4Read,
        NfsdProbe::Nfsd3ProcWrite,
        NfsdProbe::Nfsd3ProcRead,
    ];

    /// Kernel function the probe attaches to.
    pub fn func_name(self) -> &'static str {
        match self {
            NfsdProbe::Nfsd4Write => "nfsd4_write",
            NfsdProbe::Nfsd4Read => "nfsd4_read",
            NfsdProbe::Nfsd3ProcWrite => "nfsd3_proc_write",
            NfsdProbe::Nfsd3ProcRead => "nfsd3_proc_read",
        }
    }

    pub fn nfs_version(self) -> u32 {
        match self {
            NfsdProbe::Nfsd4Write | NfsdProbe::Nfsd4Read => 4,
            NfsdProbe::Nfsd3ProcWrite | NfsdProbe::Nfsd3ProcRead => 3,
        }
    }

    /// Probes required for a deployment. The legacy producer only knows the
    /// NFSv4 call sites.
    pub fn required(layout: RecordLayout, nfsv3: bool) -> Vec<NfsdProbe> {
        Self::ALL
            .into_iter()
            .filter(|probe| {
                probe.nfs_version() == 4 || (nfsv3 && layout == RecordLayout::Versioned)
            })
            .collect()
    }
}

/// Attached probes, released in reverse order of attachment when dropped.
pub struct ProbeSet<L> {
    links: Vec<(&'static str, L)>,
}

impl<L> ProbeSet<L> {
    /// Attach every `(function, handler)` pair in order.
    ///
    /// The first failure aborts with the name of the function that couldn't
    /// be hooked; whatever was attached before it is released on the way out.
    pub fn attach<H, F>(
        probes: impl IntoIterator<Item = (&'static str, H)>,
        mut attach: F,
    ) -> Result<Self>
    where
        F: FnMut(&'static str, H) -> Result<L>,
    {
        let mut set = ProbeSet { links: Vec::new() };
        for (func_name, handler) in probes {
            let link = attach(func_name, handler).with_context(|| {
                format!(
                    "Failed to attach kprobe '{func_name}'. Ensure nfsd is loaded and the function exists in the kernel."
                )
            })?;
            info!("Attached kprobe to {func_name}");
            set.links.push((func_name, link));
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn func_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.links.iter().map(|(name, _)| *name)
    }
}

impl<L> Drop for ProbeSet<L> {
    fn drop(&mut self) {
        while let Some((func_name, link)) = self.links.pop() {
            drop(link);
            debug!("Detached kprobe from {func_name}");
        }
    }
}
