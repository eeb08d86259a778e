//! Attaching classifier programs as TC `bpf` filters and cleaning up after
//! them.
//!
//! The `clsact` qdisc on an interface is shared by every filter on it, ours or
//! not. Nothing here counts references: whether the qdisc may go is decided by
//! asking the kernel for the filters that are still there.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::RedirectError;
use crate::loader::ProgramHandle;

/// Kind of the queueing discipline filters are attached to.
pub const QDISC_KIND: &str = "clsact";
/// Kind of the filters this crate attaches.
pub const FILTER_KIND: &str = "bpf";

/// `TC_PRIO_FILLER`: the lowest classification slot.
pub const FILTER_PRIORITY: u16 = 1;
pub const FILTER_HANDLE: u32 = 1;
/// Match every L3 protocol; the program does its own dispatch.
pub const ETH_P_ALL: u16 = 0x0003;

/// Hook point on the interface the filter is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filter as reported by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcFilter {
    pub ifindex: u32,
    pub direction: Direction,
    pub handle: u32,
    /// Priority in the upper 16 bits, protocol (network order) in the lower.
    pub info: u32,
    pub kind: String,
    /// `TCA_BPF_NAME`, only present on `bpf` filters.
    pub bpf_name: Option<String>,
}

impl TcFilter {
    /// Whether this is a `bpf` filter running the program called `name`.
    /// Handle 0 entries are chain placeholders, not filters.
    pub fn runs_program(&self, name: &str) -> bool {
        self.handle != 0 && self.kind == FILTER_KIND && self.bpf_name.as_deref() == Some(name)
    }
}

/// The direct-action `bpf` filter to add.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BpfFilter {
    pub ifindex: u32,
    pub direction: Direction,
    pub fd: i32,
    pub name: String,
    pub priority: u16,
    pub handle: u32,
    pub protocol: u16,
}

impl BpfFilter {
    pub fn new(ifindex: u32, direction: Direction, program: &ProgramHandle) -> Self {
        Self {
            ifindex,
            direction,
            fd: program.fd,
            name: program.name.clone(),
            priority: FILTER_PRIORITY,
            handle: FILTER_HANDLE,
            protocol: ETH_P_ALL,
        }
    }

    /// `tcm_info`: priority in the upper half, protocol in network order in the
    /// lower half.
    pub fn info(&self) -> u32 {
        (u32::from(self.priority) << 16) | u32::from(self.protocol.to_be())
    }
}

/// One open control session. Dropping it releases the underlying socket.
///
/// Errors carry the kernel errno: `AlreadyExists` for `EEXIST`, `NotFound`
/// for `ENOENT`.
pub trait TcSession {
    fn add_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()>;
    fn del_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()>;
    fn add_bpf_filter(&mut self, filter: &BpfFilter) -> io::Result<()>;
    fn filters(&mut self, ifindex: u32, direction: Direction) -> io::Result<Vec<TcFilter>>;
    fn del_filter(&mut self, filter: &TcFilter) -> io::Result<()>;
}

pub trait TcBackend {
    type Session: TcSession;

    /// Opens a fresh session in the calling thread's network namespace.
    fn session(&self) -> io::Result<Self::Session>;
}

fn open<B: TcBackend + ?Sized>(
    backend: &B,
    ifindex: u32,
    direction: Option<Direction>,
) -> Result<B::Session, RedirectError> {
    backend
        .session()
        .map_err(|e| RedirectError::netlink("open session", ifindex, direction, e))
}

/// Ensures a `clsact` qdisc on `ifindex` and attaches `program` in
/// `direction`. Attaching the same program twice is a no-op.
pub fn attach<B: TcBackend + ?Sized>(
    backend: &B,
    ifindex: u32,
    direction: Direction,
    program: &ProgramHandle,
) -> Result<(), RedirectError> {
    let mut session = open(backend, ifindex, Some(direction))?;

    match session.add_clsact_qdisc(ifindex) {
        Ok(()) => debug!(ifindex, "created {QDISC_KIND} qdisc"),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            warn!(ifindex, error = %e, "could not create {QDISC_KIND} qdisc");
            return Err(RedirectError::netlink("add qdisc", ifindex, None, e));
        }
    }

    let filter = BpfFilter::new(ifindex, direction, program);
    match session.add_bpf_filter(&filter) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(ifindex, %direction, program = %program.name, "filter already attached");
        }
        Err(e) => {
            warn!(ifindex, %direction, program = %program.name, error = %e, "could not attach filter");
            return Err(RedirectError::netlink("add filter", ifindex, Some(direction), e));
        }
    }

    debug!(ifindex, %direction, program = %program.name, "filter attached");
    Ok(())
}

/// Removes every filter running `program_name` on `ifindex`/`direction`.
/// Absent filters are not an error, and a filter that fails to delete is
/// logged and skipped.
pub fn detach<B: TcBackend + ?Sized>(
    backend: &B,
    ifindex: u32,
    direction: Direction,
    program_name: &str,
) -> Result<(), RedirectError> {
    let mut session = open(backend, ifindex, Some(direction))?;
    let filters = session
        .filters(ifindex, direction)
        .map_err(|e| RedirectError::netlink("list filters", ifindex, Some(direction), e))?;

    let matched: Vec<&TcFilter> = filters.iter().filter(|f| f.runs_program(program_name)).collect();
    if matched.is_empty() {
        debug!(ifindex, %direction, program = program_name, "no filter matched");
        return Ok(());
    }

    for filter in matched {
        match session.del_filter(filter) {
            Ok(()) => debug!(ifindex, %direction, program = program_name, handle = filter.handle, "filter detached"),
            Err(e) => error!(ifindex, %direction, program = program_name, error = %e, "failed to delete filter"),
        }
    }
    Ok(())
}

/// Deletes the `clsact` qdisc on `ifindex` unless a filter is still attached
/// in either direction.
pub fn del_qdisc_if_needed<B: TcBackend + ?Sized>(
    backend: &B,
    ifindex: u32,
) -> Result<(), RedirectError> {
    let mut session = open(backend, ifindex, None)?;

    for direction in Direction::ALL {
        let remaining = session
            .filters(ifindex, direction)
            .map_err(|e| RedirectError::netlink("list filters", ifindex, Some(direction), e))?;
        if !remaining.is_empty() {
            debug!(ifindex, %direction, "other filters remain, keeping {QDISC_KIND} qdisc");
            return Ok(());
        }
    }

    match session.del_clsact_qdisc(ifindex) {
        Ok(()) => {
            debug!(ifindex, "removed {QDISC_KIND} qdisc");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(ifindex, "no {QDISC_KIND} qdisc configured");
            Ok(())
        }
        Err(e) => Err(RedirectError::netlink("delete qdisc", ifindex, None, e)),
    }
}
