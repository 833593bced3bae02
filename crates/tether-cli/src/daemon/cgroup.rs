//! Optional cgroup v2 membership for the daemon.
//!
//! When `TETHER_CGROUP` names a cgroup directory, the daemon moves itself
//! into it at startup so every session it forks is tracked there too. At
//! shutdown it moves back to the parent group and removes the directory.
//! Every step is best-effort: a daemon without cgroup access still works.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const PROCS_FILE: &str = "cgroup.procs";

/// Membership in a cgroup that should be left on shutdown.
#[derive(Debug)]
pub struct CgroupMembership {
    dir: PathBuf,
}

impl CgroupMembership {
    /// Join the cgroup named by `TETHER_CGROUP`, if any.
    pub fn from_env() -> Option<Self> {
        let dir = std::env::var("TETHER_CGROUP").ok().filter(|d| !d.is_empty())?;
        Self::join(Path::new(&dir))
    }

    /// Create `dir` if needed and move this process into it.
    pub fn join(dir: &Path) -> Option<Self> {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Cannot create cgroup {:?}: {}", dir, e);
            return None;
        }
        if let Err(e) = write_pid(&dir.join(PROCS_FILE)) {
            warn!("Cannot join cgroup {:?}: {}", dir, e);
            return None;
        }
        info!("Joined cgroup {:?}", dir);
        Some(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Move back to the parent cgroup and remove ours.
    ///
    /// Removal fails while other processes remain inside; that is logged.
    pub fn leave(self) {
        let Some(parent) = self.dir.parent() else {
            warn!("cgroup {:?} has no parent", self.dir);
            return;
        };
        if let Err(e) = write_pid(&parent.join(PROCS_FILE)) {
            warn!("Cannot move back to parent cgroup {:?}: {}", parent, e);
            return;
        }
        match std::fs::remove_dir(&self.dir) {
            Ok(()) => info!("Removed cgroup {:?}", self.dir),
            Err(e) => warn!("Cannot remove cgroup {:?}: {}", self.dir, e),
        }
    }
}

/// Write our pid into a `cgroup.procs` file, which must already exist.
fn write_pid(procs: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(procs)?;
    file.write_all(std::process::id().to_string().as_bytes())
}
