//! In-memory stand-ins for the kernel, shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::io;
use std::sync::{mpsc, Arc, Mutex};

use ztunnel_redirect_common::{
    HostIpInfo, WorkloadInfo, MAP_APP_INFO, MAP_HOST_IP_INFO, MAP_LOG_LEVEL, MAP_ZTUNNEL_INFO,
};

use crate::error::{RedirectError, TableError};
use crate::loader::{ProgramHandle, ProgramSet};
use crate::netns::NetnsExec;
use crate::tables::{LookupTables, Table};
use crate::tc::{BpfFilter, Direction, TcBackend, TcFilter, TcSession, FILTER_KIND};

pub fn program(fd: i32, name: &str) -> ProgramHandle {
    ProgramHandle {
        fd,
        name: name.to_string(),
    }
}

pub fn programs() -> ProgramSet {
    ProgramSet {
        ztunnel_host_ingress: program(20, "ztunnel_host_ingress"),
        ztunnel_ingress: program(21, "ztunnel_ingress"),
        app_inbound: program(22, "app_inbound"),
        app_outbound: program(23, "app_outbound"),
    }
}

/// A kernel operation as seen by [`FakeKernel`]. `netns` is `None` for the
/// namespace the test started in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    AddQdisc {
        netns: Option<String>,
        ifindex: u32,
    },
    DelQdisc {
        netns: Option<String>,
        ifindex: u32,
    },
    AddFilter {
        netns: Option<String>,
        ifindex: u32,
        direction: Direction,
        name: String,
    },
    DelFilter {
        netns: Option<String>,
        ifindex: u32,
        direction: Direction,
        name: String,
    },
    ListFilters {
        netns: Option<String>,
        ifindex: u32,
        direction: Direction,
    },
    EnterNetns {
        namespace: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FakeFilter {
    netns: Option<String>,
    filter: TcFilter,
}

/// Observable kernel state, compared across calls by the tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    qdiscs: Vec<(Option<String>, u32)>,
    filters: Vec<(Option<String>, u32, Direction, u32, String)>,
}

#[derive(Debug, Default)]
struct KernelState {
    current_netns: Option<String>,
    qdiscs: HashSet<(Option<String>, u32)>,
    filters: Vec<FakeFilter>,
    next_foreign_handle: u32,
    calls: Vec<Call>,
    failures: HashSet<Call>,
    stall: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl KernelState {
    fn record(&mut self, call: Call) -> io::Result<()> {
        self.calls.push(call.clone());
        if self.failures.contains(&call) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

/// Qdiscs and filters per namespace, with a call log and injectable
/// failures. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.state.lock().unwrap().next_foreign_handle = 100;
        kernel
    }

    /// Makes every later occurrence of `call` fail with `EPERM`.
    pub fn fail_on(&self, call: Call) {
        self.state.lock().unwrap().failures.insert(call);
    }

    /// Blocks the next `session()` until the returned [`Stall`] is released.
    pub fn stall_next_session(&self) -> Stall {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        self.state.lock().unwrap().stall = Some((entered_tx, release_rx));
        Stall { entered, release }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        let mut qdiscs: Vec<_> = state.qdiscs.iter().cloned().collect();
        qdiscs.sort();
        let mut filters: Vec<_> = state
            .filters
            .iter()
            .map(|f| {
                (
                    f.netns.clone(),
                    f.filter.ifindex,
                    f.filter.direction,
                    f.filter.handle,
                    f.filter.bpf_name.clone().unwrap_or_else(|| f.filter.kind.clone()),
                )
            })
            .collect();
        filters.sort_by(|a, b| (&a.0, a.1, a.2.as_str(), a.3).cmp(&(&b.0, b.1, b.2.as_str(), b.3)));
        Snapshot { qdiscs, filters }
    }

    /// Program names (or filter kinds, for non-bpf filters) attached on an
    /// interface.
    pub fn filter_names(&self, netns: Option<&str>, ifindex: u32, direction: Direction) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .filters
            .iter()
            .filter(|f| f.netns.as_deref() == netns && f.filter.ifindex == ifindex && f.filter.direction == direction)
            .map(|f| f.filter.bpf_name.clone().unwrap_or_else(|| f.filter.kind.clone()))
            .collect()
    }

    pub fn has_qdisc(&self, netns: Option<&str>, ifindex: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .qdiscs
            .contains(&(netns.map(str::to_string), ifindex))
    }

    pub fn current_netns(&self) -> Option<String> {
        self.state.lock().unwrap().current_netns.clone()
    }

    /// Adds a filter someone else owns, creating the qdisc if needed.
    pub fn insert_foreign_filter(
        &self,
        netns: Option<&str>,
        ifindex: u32,
        direction: Direction,
        kind: &str,
        name: Option<&str>,
    ) {
        let mut state = self.state.lock().unwrap();
        let netns = netns.map(str::to_string);
        state.qdiscs.insert((netns.clone(), ifindex));
        let handle = state.next_foreign_handle;
        state.next_foreign_handle += 1;
        state.filters.push(FakeFilter {
            netns,
            filter: TcFilter {
                ifindex,
                direction,
                handle,
                info: 0x0002_0300,
                kind: kind.to_string(),
                bpf_name: name.map(str::to_string),
            },
        });
    }
}

/// A session held open by [`FakeKernel::stall_next_session`].
pub struct Stall {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl Stall {
    /// Waits until the stalled session has been requested.
    pub fn wait_entered(&self) {
        self.entered.recv().unwrap();
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

pub struct FakeSession {
    kernel: FakeKernel,
    netns: Option<String>,
}

impl FakeSession {
    fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        f(&mut self.kernel.state.lock().unwrap())
    }
}

impl TcSession for FakeSession {
    fn add_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()> {
        let netns = self.netns.clone();
        self.with_state(|state| {
            state.record(Call::AddQdisc {
                netns: netns.clone(),
                ifindex,
            })?;
            if !state.qdiscs.insert((netns, ifindex)) {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            Ok(())
        })
    }

    fn del_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()> {
        let netns = self.netns.clone();
        self.with_state(|state| {
            state.record(Call::DelQdisc {
                netns: netns.clone(),
                ifindex,
            })?;
            if !state.qdiscs.remove(&(netns.clone(), ifindex)) {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            state
                .filters
                .retain(|f| !(f.netns == netns && f.filter.ifindex == ifindex));
            Ok(())
        })
    }

    fn add_bpf_filter(&mut self, filter: &BpfFilter) -> io::Result<()> {
        let netns = self.netns.clone();
        self.with_state(|state| {
            state.record(Call::AddFilter {
                netns: netns.clone(),
                ifindex: filter.ifindex,
                direction: filter.direction,
                name: filter.name.clone(),
            })?;
            if !state.qdiscs.contains(&(netns.clone(), filter.ifindex)) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            let exists = state.filters.iter().any(|f| {
                f.netns == netns
                    && f.filter.ifindex == filter.ifindex
                    && f.filter.direction == filter.direction
                    && f.filter.handle == filter.handle
            });
            if exists {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            state.filters.push(FakeFilter {
                netns,
                filter: TcFilter {
                    ifindex: filter.ifindex,
                    direction: filter.direction,
                    handle: filter.handle,
                    info: filter.info(),
                    kind: FILTER_KIND.to_string(),
                    bpf_name: Some(filter.name.clone()),
                },
            });
            Ok(())
        })
    }

    fn filters(&mut self, ifindex: u32, direction: Direction) -> io::Result<Vec<TcFilter>> {
        let netns = self.netns.clone();
        self.with_state(|state| {
            state.record(Call::ListFilters {
                netns: netns.clone(),
                ifindex,
                direction,
            })?;
            let mut out = Vec::new();
            for f in &state.filters {
                if f.netns != netns || f.filter.ifindex != ifindex || f.filter.direction != direction {
                    continue;
                }
                // Like the kernel, announce the priority's chain before its
                // filters.
                if !out.iter().any(|o: &TcFilter| o.handle == 0 && o.info == f.filter.info) {
                    out.push(TcFilter {
                        handle: 0,
                        bpf_name: None,
                        ..f.filter.clone()
                    });
                }
                out.push(f.filter.clone());
            }
            Ok(out)
        })
    }

    fn del_filter(&mut self, filter: &TcFilter) -> io::Result<()> {
        let netns = self.netns.clone();
        self.with_state(|state| {
            state.record(Call::DelFilter {
                netns: netns.clone(),
                ifindex: filter.ifindex,
                direction: filter.direction,
                name: filter.bpf_name.clone().unwrap_or_default(),
            })?;
            let before = state.filters.len();
            state.filters.retain(|f| !(f.netns == netns && &f.filter == filter));
            if state.filters.len() == before {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            Ok(())
        })
    }
}

impl TcBackend for FakeKernel {
    type Session = FakeSession;

    fn session(&self) -> io::Result<FakeSession> {
        let stall = self.state.lock().unwrap().stall.take();
        if let Some((entered, release)) = stall {
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(FakeSession {
            kernel: self.clone(),
            netns: self.current_netns(),
        })
    }
}

impl NetnsExec for FakeKernel {
    fn with_netns<R, F>(&self, namespace: &str, f: F) -> Result<R, RedirectError>
    where
        F: FnOnce() -> Result<R, RedirectError>,
    {
        let previous = {
            let mut state = self.state.lock().unwrap();
            state
                .record(Call::EnterNetns {
                    namespace: namespace.to_string(),
                })
                .map_err(|source| RedirectError::Netns {
                    op: "enter",
                    namespace: namespace.to_string(),
                    source,
                })?;
            state.current_netns.replace(namespace.to_string())
        };
        let res = f();
        self.state.lock().unwrap().current_netns = previous;
        res
    }
}

/// Contents of the fake lookup tables, keyed like the kernel maps.
#[derive(Debug, Default)]
pub struct FakeTableState {
    pub app_info: HashMap<[u8; 4], WorkloadInfo>,
    pub ztunnel_info: HashMap<u32, WorkloadInfo>,
    pub host_ip_info: HashMap<u32, HostIpInfo>,
    pub log_level: HashMap<u32, u32>,
    /// Maps whose every operation fails.
    pub failing: HashSet<&'static str>,
}

type Select<K, V> = fn(&mut FakeTableState) -> &mut HashMap<K, V>;

struct FakeTable<K, V> {
    name: &'static str,
    /// Arrays have every slot; unset ones read as zero.
    array: bool,
    state: Arc<Mutex<FakeTableState>>,
    select: Select<K, V>,
}

impl<K, V> FakeTable<K, V> {
    fn with<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> Result<R, TableError>) -> Result<R, TableError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(self.name) {
            return Err(TableError::Io(io::Error::from_raw_os_error(libc::EPERM)));
        }
        f((self.select)(&mut state))
    }
}

impl<K, V> Table<K, V> for FakeTable<K, V>
where
    K: Clone + Eq + Hash + Send,
    V: Clone + Default + Send,
{
    fn update(&mut self, key: K, value: V) -> Result<(), TableError> {
        self.with(|map| {
            map.insert(key, value);
            Ok(())
        })
    }

    fn lookup(&self, key: &K) -> Result<V, TableError> {
        let array = self.array;
        self.with(|map| match map.get(key) {
            Some(v) => Ok(v.clone()),
            None if array => Ok(V::default()),
            None => Err(TableError::KeyNotFound),
        })
    }

    fn delete(&mut self, key: &K) -> Result<(), TableError> {
        if self.array {
            return Err(TableError::Unsupported("array maps"));
        }
        self.with(|map| map.remove(key).map(|_| ()).ok_or(TableError::KeyNotFound))
    }

    fn entries(&self) -> Result<Vec<(K, V)>, TableError> {
        self.with(|map| Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
    }
}

pub fn fake_tables() -> (LookupTables, Arc<Mutex<FakeTableState>>) {
    let state = Arc::new(Mutex::new(FakeTableState::default()));
    let tables = LookupTables {
        app_info: Box::new(FakeTable {
            name: MAP_APP_INFO,
            array: false,
            state: state.clone(),
            select: |s| &mut s.app_info,
        }),
        ztunnel_info: Box::new(FakeTable {
            name: MAP_ZTUNNEL_INFO,
            array: true,
            state: state.clone(),
            select: |s| &mut s.ztunnel_info,
        }),
        host_ip_info: Box::new(FakeTable {
            name: MAP_HOST_IP_INFO,
            array: true,
            state: state.clone(),
            select: |s| &mut s.host_ip_info,
        }),
        log_level: Box::new(FakeTable {
            name: MAP_LOG_LEVEL,
            array: true,
            state: state.clone(),
            select: |s| &mut s.log_level,
        }),
    };
    (tables, state)
}
