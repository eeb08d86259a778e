//! Redirect requests and the attach, detach and table sequences that apply
//! them.
//!
//! A workload gets two filters on its host-side veth: `app_inbound` on
//! egress (traffic towards the pod) and `app_outbound` on ingress (traffic
//! leaving it). Ztunnel gets `ztunnel_host_ingress` on its host-side veth and
//! `ztunnel_ingress` on the peer end inside its own namespace.

use std::net::{IpAddr, Ipv4Addr};

use aya::Ebpf;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ztunnel_redirect_common::{WorkloadInfo, CAPTURE_DNS_FLAG, ETH_ALEN};

use crate::error::{ErrorList, RedirectError};
use crate::loader::{Loaded, ProgramSet};
use crate::netns::NetnsExec;
use crate::tables::LookupTables;
use crate::tc::{self, Direction, TcBackend};

/// One add or remove of a workload or of ztunnel itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectArgs {
    /// Only the first address is used, and it must be IPv4.
    #[serde(default)]
    pub ip_addrs: Vec<IpAddr>,
    #[serde(default, with = "mac_serde")]
    pub mac_addr: Vec<u8>,
    /// Host-side veth.
    pub ifindex: u32,
    /// Ztunnel's veth inside `peer_ns`.
    #[serde(default)]
    pub peer_index: u32,
    #[serde(default)]
    pub is_ztunnel: bool,
    #[serde(default)]
    pub peer_ns: Option<String>,
    #[serde(default)]
    pub capture_dns: bool,
    #[serde(default)]
    pub remove: bool,
}

impl RedirectArgs {
    fn namespace(&self) -> Option<&str> {
        self.peer_ns.as_deref().filter(|ns| !ns.is_empty())
    }

    fn workload_ip(&self) -> Result<Ipv4Addr, RedirectError> {
        // Dual-stack pods are keyed by their first address only.
        match self.ip_addrs.first() {
            None => Err(RedirectError::NoIpAddrs),
            Some(IpAddr::V4(ip)) => Ok(*ip),
            Some(other) => Err(RedirectError::NotIpv4(*other)),
        }
    }

    fn mac(&self) -> Result<[u8; ETH_ALEN], RedirectError> {
        <[u8; ETH_ALEN]>::try_from(self.mac_addr.as_slice())
            .map_err(|_| RedirectError::InvalidMac(format_mac(&self.mac_addr)))
    }

    /// The record to write for an add. Removals use the zeroed record.
    fn record(&self) -> Result<WorkloadInfo, RedirectError> {
        if self.remove {
            return Ok(WorkloadInfo::default());
        }
        Ok(WorkloadInfo::new(self.ifindex, self.mac()?))
    }
}

pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(s: &str) -> Result<Vec<u8>, String> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(':')
        .map(|part| {
            if part.is_empty() || part.len() > 2 {
                return Err(format!("invalid mac addr {s:?}"));
            }
            u8::from_str_radix(part, 16).map_err(|e| format!("invalid mac addr {s:?}: {e}"))
        })
        .collect()
}

/// MACs travel as `aa:bb:cc:dd:ee:ff` strings.
mod mac_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_mac(mac))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_mac(&s).map_err(serde::de::Error::custom)
    }
}

/// Applies redirect requests against a kernel. Not safe to share: callers
/// must run one request at a time, which the server's worker does.
pub struct Redirector<K> {
    kernel: K,
    programs: ProgramSet,
    tables: LookupTables,
    /// Owner of the program fds in `programs`, if they came from a loader.
    _object: Option<Ebpf>,
}

impl<K: TcBackend + NetnsExec> Redirector<K> {
    pub fn new(kernel: K, programs: ProgramSet, tables: LookupTables) -> Self {
        Self {
            kernel,
            programs,
            tables,
            _object: None,
        }
    }

    /// Builds a redirector from a loaded object, keeping it open for as long
    /// as the redirector lives.
    pub fn from_loaded(kernel: K, loaded: Loaded) -> Self {
        let (programs, tables, object) = loaded.into_parts();
        Self {
            _object: Some(object),
            ..Self::new(kernel, programs, tables)
        }
    }

    pub fn tables(&self) -> &LookupTables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut LookupTables {
        &mut self.tables
    }

    pub fn handle_request(&mut self, args: &RedirectArgs) -> Result<(), RedirectError> {
        let record = args.record()?;
        if args.is_ztunnel {
            self.handle_ztunnel(args, record)
        } else {
            self.handle_workload(args, record)
        }
    }

    fn handle_workload(&mut self, args: &RedirectArgs, record: WorkloadInfo) -> Result<(), RedirectError> {
        let ip = args.workload_ip()?;
        let ifindex = args.ifindex;
        let mut errs = ErrorList::new();

        if args.remove {
            if ifindex != 0 {
                errs.check(self.detach_workload(ifindex));
            } else {
                debug!(%ip, "zero ifindex for workload removal, skipping detach");
            }
            errs.check(self.tables.delete_workload(ip));
            return errs.into_result();
        }

        if let Err(e) = self.attach_workload(ifindex) {
            errs.push(e);
            errs.check(self.detach_workload(ifindex));
            return errs.into_result();
        }
        if let Err(e) = self.tables.upsert_workload(ip, record) {
            errs.push(e);
            errs.check(self.detach_workload(ifindex));
            return errs.into_result();
        }

        info!(%ip, ifindex, mac = %format_mac(&record.mac_addr), "workload redirected");
        Ok(())
    }

    fn handle_ztunnel(&mut self, args: &RedirectArgs, mut record: WorkloadInfo) -> Result<(), RedirectError> {
        let ifindex = args.ifindex;
        let peer_index = args.peer_index;
        let mut errs = ErrorList::new();

        if args.remove {
            match args.namespace() {
                Some(ns) if ifindex != 0 => errs.check(self.detach_ztunnel(ifindex, peer_index, ns)),
                ns => debug!(ifindex, namespace = ?ns, "ifindex or namespace invalid for ztunnel removal"),
            }
            // Array slots cannot be deleted, only zeroed.
            errs.check(self.tables.set_ztunnel(record));
            return errs.into_result();
        }

        let ns = args.namespace().ok_or(RedirectError::MissingNamespace)?;
        if let Err(e) = self.attach_ztunnel(ifindex, peer_index, ns) {
            errs.push(e);
            errs.check(self.detach_ztunnel(ifindex, peer_index, ns));
            return errs.into_result();
        }

        if args.capture_dns {
            record.flag |= CAPTURE_DNS_FLAG;
        }
        if let Err(e) = self.tables.set_ztunnel(record) {
            errs.push(e);
            errs.check(self.detach_ztunnel(ifindex, peer_index, ns));
            return errs.into_result();
        }

        info!(ifindex, peer_index, namespace = ns, capture_dns = args.capture_dns, "ztunnel redirected");
        Ok(())
    }

    /// Attaches both workload filters. Stops at the first failure; the
    /// caller rolls back.
    pub fn attach_workload(&self, ifindex: u32) -> Result<(), RedirectError> {
        tc::attach(&self.kernel, ifindex, Direction::Egress, &self.programs.app_inbound)?;
        tc::attach(&self.kernel, ifindex, Direction::Ingress, &self.programs.app_outbound)
    }

    /// Detaches both workload filters and drops the qdisc if it is unused.
    /// Every step runs; failures are collected.
    pub fn detach_workload(&self, ifindex: u32) -> Result<(), RedirectError> {
        let mut errs = ErrorList::new();
        errs.check(tc::detach(
            &self.kernel,
            ifindex,
            Direction::Ingress,
            &self.programs.app_outbound.name,
        ));
        errs.check(tc::detach(
            &self.kernel,
            ifindex,
            Direction::Egress,
            &self.programs.app_inbound.name,
        ));
        errs.check(tc::del_qdisc_if_needed(&self.kernel, ifindex));
        if !errs.is_empty() {
            warn!(ifindex, errors = errs.len(), "workload detach incomplete");
        }
        errs.into_result()
    }

    pub fn attach_ztunnel(&self, ifindex: u32, peer_index: u32, namespace: &str) -> Result<(), RedirectError> {
        tc::attach(
            &self.kernel,
            ifindex,
            Direction::Ingress,
            &self.programs.ztunnel_host_ingress,
        )?;
        self.kernel.with_netns(namespace, || {
            tc::attach(
                &self.kernel,
                peer_index,
                Direction::Ingress,
                &self.programs.ztunnel_ingress,
            )
        })
    }

    pub fn detach_ztunnel(&self, ifindex: u32, peer_index: u32, namespace: &str) -> Result<(), RedirectError> {
        let mut errs = ErrorList::new();
        errs.check(tc::detach(
            &self.kernel,
            ifindex,
            Direction::Ingress,
            &self.programs.ztunnel_host_ingress.name,
        ));
        errs.check(tc::del_qdisc_if_needed(&self.kernel, ifindex));

        errs.check(self.kernel.with_netns(namespace, || {
            let mut inner = ErrorList::new();
            inner.check(tc::detach(
                &self.kernel,
                peer_index,
                Direction::Ingress,
                &self.programs.ztunnel_ingress.name,
            ));
            inner.check(tc::del_qdisc_if_needed(&self.kernel, peer_index));
            inner.into_result()
        }));
        if !errs.is_empty() {
            warn!(ifindex, peer_index, namespace, errors = errs.len(), "ztunnel detach incomplete");
        }
        errs.into_result()
    }
}
