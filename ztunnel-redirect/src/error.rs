use std::fmt;
use std::io;
use std::net::IpAddr;

use crate::tc::Direction;

/// Error returned by a lookup table operation.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("key not found")]
    KeyNotFound,
    #[error("operation not supported on {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<aya::maps::MapError> for TableError {
    fn from(e: aya::maps::MapError) -> Self {
        if matches!(e, aya::maps::MapError::KeyNotFound) || caused_by_errno(&e, libc::ENOENT) {
            return TableError::KeyNotFound;
        }
        TableError::Io(io::Error::other(e))
    }
}

/// Walks the source chain looking for an OS error with the given errno.
fn caused_by_errno(e: &(dyn std::error::Error + 'static), errno: i32) -> bool {
    let mut cur = Some(e);
    while let Some(err) = cur {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.raw_os_error() == Some(errno) {
                return true;
            }
        }
        cur = err.source();
    }
    false
}

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    // Request validation. Nothing has touched the kernel yet.
    #[error("invalid mac addr ({0}), only EUI-48/MAC-48 is supported")]
    InvalidMac(String),
    #[error("no ip address provided")]
    NoIpAddrs,
    #[error("invalid ip addr ({0}), only ipv4 is supported")]
    NotIpv4(IpAddr),
    #[error("invalid namespace for ztunnel")]
    MissingNamespace,
    #[error("too many ips provided: {0}")]
    TooManyHostIps(usize),
    #[error("invalid host ip {ip:?}: {source}")]
    InvalidHostIp {
        ip: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("unknown ebpf log level {0:?}")]
    UnknownLogLevel(String),

    // Kernel interaction.
    #[error("netlink {op} on ifindex {ifindex}{}: {source}", fmt_direction(.direction))]
    Netlink {
        op: &'static str,
        ifindex: u32,
        direction: Option<Direction>,
        #[source]
        source: io::Error,
    },
    #[error("failed to {op} netns {namespace}: {source}")]
    Netns {
        op: &'static str,
        namespace: String,
        #[source]
        source: io::Error,
    },
    #[error("{op} on table {table} failed: {source}")]
    Table {
        op: &'static str,
        table: &'static str,
        #[source]
        source: TableError,
    },
    #[error(transparent)]
    Multiple(#[from] ErrorList),

    #[error("redirect server is not running")]
    ServerStopped,
}

fn fmt_direction(direction: &Option<Direction>) -> String {
    match direction {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

impl RedirectError {
    pub fn netlink(op: &'static str, ifindex: u32, direction: Option<Direction>, source: io::Error) -> Self {
        RedirectError::Netlink {
            op,
            ifindex,
            direction,
            source,
        }
    }

    pub fn table(op: &'static str, table: &'static str, source: TableError) -> Self {
        RedirectError::Table { op, table, source }
    }

    /// True for errors raised before any kernel object was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RedirectError::InvalidMac(_)
                | RedirectError::NoIpAddrs
                | RedirectError::NotIpv4(_)
                | RedirectError::MissingNamespace
                | RedirectError::TooManyHostIps(_)
                | RedirectError::InvalidHostIp { .. }
                | RedirectError::UnknownLogLevel(_)
        )
    }
}

/// Collects the failures of steps that must all run. The first pushed error
/// is the root cause; later ones are rollback or cleanup failures.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<RedirectError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: RedirectError) {
        match err {
            RedirectError::Multiple(inner) => self.0.extend(inner.0),
            other => self.0.push(other),
        }
    }

    /// Records the error of `res`, if any.
    pub fn check(&mut self, res: Result<(), RedirectError>) {
        if let Err(e) = res {
            self.push(e);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[RedirectError] {
        &self.0
    }

    pub fn into_result(mut self) -> Result<(), RedirectError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(RedirectError::Multiple(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.len())?;
        for err in self.errors() {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
