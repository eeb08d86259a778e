//! Running closures inside a named network namespace.
//!
//! setns(2) switches only the calling thread, so everything here is
//! synchronous: enter, run, restore, all on the same thread.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use nix::sched::{setns, CloneFlags};
use tracing::{error, trace};

use crate::error::RedirectError;

/// Default directory of `ip netns` style namespace bind mounts.
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

pub trait NetnsExec {
    /// Runs `f` inside `namespace` and restores the caller's namespace
    /// afterwards, whether `f` succeeded or not.
    fn with_netns<R, F>(&self, namespace: &str, f: F) -> Result<R, RedirectError>
    where
        F: FnOnce() -> Result<R, RedirectError>;
}

/// Namespaces resolved by name under a directory of bind mounts.
#[derive(Clone, Debug)]
pub struct NetnsDir {
    dir: PathBuf,
}

impl NetnsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_of(&self, namespace: &str) -> PathBuf {
        self.dir.join(namespace)
    }
}

impl Default for NetnsDir {
    fn default() -> Self {
        Self::new(DEFAULT_NETNS_DIR)
    }
}

/// Puts the thread back into `original` when dropped.
struct Restore {
    original: File,
    namespace: String,
}

impl Drop for Restore {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            error!(namespace = %self.namespace, error = %e, "failed to restore network namespace");
            // Carrying on would run every later request in the wrong namespace.
            panic!("failed to restore network namespace after {}: {e}", self.namespace);
        }
        trace!(namespace = %self.namespace, "restored original network namespace");
    }
}

impl NetnsExec for NetnsDir {
    fn with_netns<R, F>(&self, namespace: &str, f: F) -> Result<R, RedirectError>
    where
        F: FnOnce() -> Result<R, RedirectError>,
    {
        let netns_err = |op: &'static str, source: io::Error| RedirectError::Netns {
            op,
            namespace: namespace.to_string(),
            source,
        };

        let original = File::open("/proc/thread-self/ns/net").map_err(|e| netns_err("open current", e))?;
        let target = File::open(self.path_of(namespace)).map_err(|e| netns_err("open", e))?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| netns_err("enter", io::Error::from(e)))?;
        let _restore = Restore {
            original,
            namespace: namespace.to_string(),
        };
        trace!(namespace, "entered network namespace");

        f()
    }
}
