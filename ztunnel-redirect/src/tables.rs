//! Kernel-resident lookup tables and the records written into them.

use std::net::{IpAddr, Ipv4Addr};

use aya::maps::{Array, HashMap, MapData};
use aya::Pod;
use serde::Serialize;
use tracing::debug;

use ztunnel_redirect_common::{
    HostIpInfo, WorkloadInfo, HOST_IP_SLOT_V4, HOST_IP_SLOT_V6, LOG_DEBUG, LOG_INFO, LOG_NONE,
    MAP_APP_INFO, MAP_HOST_IP_INFO, MAP_LOG_LEVEL, MAP_ZTUNNEL_INFO, SINGLE_SLOT,
};

use crate::error::{RedirectError, TableError};

/// A kernel key/value table. Writes always upsert.
pub trait Table<K, V>: Send {
    fn update(&mut self, key: K, value: V) -> Result<(), TableError>;
    fn lookup(&self, key: &K) -> Result<V, TableError>;
    fn delete(&mut self, key: &K) -> Result<(), TableError>;
    fn entries(&self) -> Result<Vec<(K, V)>, TableError>;
}

impl<K: Pod + Send, V: Pod + Send> Table<K, V> for HashMap<MapData, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<(), TableError> {
        Ok(self.insert(key, value, 0)?)
    }

    fn lookup(&self, key: &K) -> Result<V, TableError> {
        Ok(self.get(key, 0)?)
    }

    fn delete(&mut self, key: &K) -> Result<(), TableError> {
        Ok(self.remove(key)?)
    }

    fn entries(&self) -> Result<Vec<(K, V)>, TableError> {
        self.iter()
            .map(|entry| entry.map_err(TableError::from))
            .collect()
    }
}

impl<V: Pod + Send> Table<u32, V> for Array<MapData, V> {
    fn update(&mut self, key: u32, value: V) -> Result<(), TableError> {
        Ok(self.set(key, value, 0)?)
    }

    fn lookup(&self, key: &u32) -> Result<V, TableError> {
        Ok(self.get(key, 0)?)
    }

    /// Array entries always exist; they can only be overwritten.
    fn delete(&mut self, _key: &u32) -> Result<(), TableError> {
        Err(TableError::Unsupported("array maps"))
    }

    fn entries(&self) -> Result<Vec<(u32, V)>, TableError> {
        self.iter()
            .enumerate()
            .map(|(i, value)| Ok((i as u32, value?)))
            .collect()
    }
}

/// Level of the classifier's own trace output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_raw(self) -> u32 {
        match self {
            LogLevel::None => LOG_NONE,
            LogLevel::Info => LOG_INFO,
            LogLevel::Debug => LOG_DEBUG,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = RedirectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(LogLevel::None),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(RedirectError::UnknownLogLevel(other.to_string())),
        }
    }
}

/// One `app_info` entry, as returned by a dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadEntry {
    pub ip: Ipv4Addr,
    pub info: WorkloadInfo,
}

/// The tables the classifiers read.
pub struct LookupTables {
    pub app_info: Box<dyn Table<[u8; 4], WorkloadInfo>>,
    pub ztunnel_info: Box<dyn Table<u32, WorkloadInfo>>,
    pub host_ip_info: Box<dyn Table<u32, HostIpInfo>>,
    pub log_level: Box<dyn Table<u32, u32>>,
}

impl LookupTables {
    pub fn upsert_workload(&mut self, ip: Ipv4Addr, info: WorkloadInfo) -> Result<(), RedirectError> {
        self.app_info
            .update(ip.octets(), info)
            .map_err(|e| RedirectError::table("update", MAP_APP_INFO, e))?;
        debug!(%ip, ifindex = info.ifindex, "workload record written");
        Ok(())
    }

    /// Deletes the record for `ip`. A missing record is not an error.
    pub fn delete_workload(&mut self, ip: Ipv4Addr) -> Result<(), RedirectError> {
        match self.app_info.delete(&ip.octets()) {
            Ok(()) => {
                debug!(%ip, "workload record deleted");
                Ok(())
            }
            Err(TableError::KeyNotFound) => Ok(()),
            Err(e) => Err(RedirectError::table("delete", MAP_APP_INFO, e)),
        }
    }

    pub fn dump_app_info(&self) -> Result<Vec<WorkloadEntry>, RedirectError> {
        let entries = self
            .app_info
            .entries()
            .map_err(|e| RedirectError::table("iterate", MAP_APP_INFO, e))?;
        Ok(entries
            .into_iter()
            .map(|(key, info)| WorkloadEntry {
                ip: Ipv4Addr::from(key),
                info,
            })
            .collect())
    }

    /// Writes the ztunnel slot. An all-zero record clears it.
    pub fn set_ztunnel(&mut self, info: WorkloadInfo) -> Result<(), RedirectError> {
        self.ztunnel_info
            .update(SINGLE_SLOT, info)
            .map_err(|e| RedirectError::table("update", MAP_ZTUNNEL_INFO, e))
    }

    pub fn dump_ztunnel_info(&self) -> Result<WorkloadInfo, RedirectError> {
        self.ztunnel_info
            .lookup(&SINGLE_SLOT)
            .map_err(|e| RedirectError::table("lookup", MAP_ZTUNNEL_INFO, e))
    }

    pub fn set_log_level(&mut self, level: LogLevel) -> Result<(), RedirectError> {
        self.log_level
            .update(SINGLE_SLOT, level.as_raw())
            .map_err(|e| RedirectError::table("update", MAP_LOG_LEVEL, e))
    }

    /// Writes the node's own addresses: at most one per family, two in
    /// total. Addresses are parsed before anything is written.
    pub fn update_host_ips<S: AsRef<str>>(&mut self, ips: &[S]) -> Result<(), RedirectError> {
        if ips.len() > 2 {
            return Err(RedirectError::TooManyHostIps(ips.len()));
        }
        let parsed = ips
            .iter()
            .map(|s| {
                let s = s.as_ref();
                s.parse::<IpAddr>().map_err(|source| RedirectError::InvalidHostIp {
                    ip: s.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for ip in parsed {
            let (slot, octets) = match ip {
                IpAddr::V4(v4) => (HOST_IP_SLOT_V4, v4.to_ipv6_mapped().octets()),
                IpAddr::V6(v6) => (HOST_IP_SLOT_V6, v6.octets()),
            };
            self.host_ip_info
                .update(slot, HostIpInfo::from_octets(octets))
                .map_err(|e| RedirectError::table("update", MAP_HOST_IP_INFO, e))?;
            debug!(%ip, slot, "host ip written");
        }
        Ok(())
    }
}
