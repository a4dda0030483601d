//! Bounded-retry teardown of datasets and snapshots
//!
//! ZFS refuses to destroy a dataset while NFS clients hold open file
//! handles on its mountpoint, and reports `dataset is busy` for a
//! short window even after the handles close. Teardown therefore runs
//! in two phases: wait for open handles to drain, then retry the
//! forced destroy while the busy signature persists. Both phases share
//! one deadline so a wedged client cannot stall deletion forever.

use crate::driver::ZfsDriver;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zshare_common::{is_busy_signature, Error, Result};

/// Pacing and deadline of the teardown retry loops
#[derive(Clone, Copy, Debug)]
pub struct TeardownPolicy {
    /// Sleep between open-handle probes and between destroy retries
    pub retry_interval: Duration,
    /// Total time budget for each retry loop before giving up
    pub deadline: Duration,
}

impl TeardownPolicy {
    #[must_use]
    pub const fn new(retry_interval: Duration, deadline: Duration) -> Self {
        Self {
            retry_interval,
            deadline,
        }
    }
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

fn has_mountpoint(mountpoint: &str) -> bool {
    !matches!(mountpoint, "-" | "none" | "legacy")
}

impl ZfsDriver {
    /// Destroy a dataset or snapshot, riding out open handles and the
    /// transient busy window.
    ///
    /// Snapshots and unmounted datasets are destroyed immediately. For
    /// a mounted dataset, open handles on its mountpoint are drained
    /// first. Each phase gives up with [`Error::StillBusy`] once the
    /// policy deadline passes, leaving the target in place for a later
    /// deletion attempt.
    pub(crate) fn delete_dataset_or_snapshot_with_retry(&self, name: &str) -> Result<()> {
        let mountpoint = self.get_zfs_option(name, "mountpoint")?;
        if !name.contains('@') && has_mountpoint(&mountpoint) {
            self.wait_for_open_handles(name, &mountpoint)?;
        }
        let deadline = Instant::now() + self.teardown.deadline;
        loop {
            match self.zfs(&["destroy", "-f", name]) {
                Ok(_) => return Ok(()),
                Err(err) if err.stderr().is_some_and(is_busy_signature) => {
                    info!(name, "dataset is busy, retrying destroy");
                    if Instant::now() >= deadline {
                        return Err(Error::StillBusy {
                            name: name.to_string(),
                        });
                    }
                    thread::sleep(self.teardown.retry_interval);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Poll `lsof` until no process holds a file open under the
    /// mountpoint. `lsof` exits non-zero once nothing matches, so a
    /// probe failure means the handles are gone.
    fn wait_for_open_handles(&self, name: &str, mountpoint: &str) -> Result<()> {
        let deadline = Instant::now() + self.teardown.deadline;
        loop {
            let Ok(out) = self.shell(&["lsof", "-w", mountpoint], false) else {
                return Ok(());
            };
            debug!(
                name,
                mountpoint,
                handles = %out.stdout.trim(),
                "dataset still has open file handles"
            );
            if Instant::now() >= deadline {
                return Err(Error::StillBusy {
                    name: name.to_string(),
                });
            }
            thread::sleep(self.teardown.retry_interval);
        }
    }
}
