//! Host preparation before the object can be loaded: a mounted bpf
//! filesystem for pinning and an unlimited memlock rlimit for older kernels.

use std::fs;
use std::io;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::statfs::statfs;
use tracing::{debug, info};

pub const BPF_FS_ROOT: &str = "/sys/fs/bpf";
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/ambient";

// linux/magic.h
const BPF_FS_MAGIC: i64 = 0xcafe_4a11;

fn is_bpf_fs(path: &Path) -> io::Result<bool> {
    let stat = statfs(path).map_err(io::Error::from)?;
    Ok(stat.filesystem_type().0 as i64 == BPF_FS_MAGIC)
}

/// Mounts the bpf filesystem on [`BPF_FS_ROOT`] unless it is already there,
/// then creates `pin_path`.
pub fn ensure_pin_path(pin_path: &Path) -> io::Result<()> {
    let root = Path::new(BPF_FS_ROOT);
    fs::create_dir_all(root)?;

    if is_bpf_fs(root)? {
        debug!(path = BPF_FS_ROOT, "bpf filesystem already mounted");
    } else {
        mount(
            Some("bpf"),
            root,
            Some("bpf"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(io::Error::from)?;
        info!(path = BPF_FS_ROOT, "mounted bpf filesystem");
    }

    fs::create_dir_all(pin_path)?;
    Ok(())
}

/// Lifts the memlock limit that pre-5.11 kernels charge maps against.
pub fn raise_memlock_limit() -> io::Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, libc::RLIM_INFINITY, libc::RLIM_INFINITY)
        .map_err(io::Error::from)?;
    debug!("removed limit on locked memory");
    Ok(())
}
