#![no_std]

//! Data contracts shared with the ambient redirect classifier programs.
//!
//! Every record here is read by the kernel side byte for byte. Field order,
//! widths and padding must not change without changing the classifier.

/// Classifier attached to ingress of ztunnel's host-side veth.
pub const PROG_ZTUNNEL_HOST_INGRESS: &str = "ztunnel_host_ingress";
/// Classifier attached to ingress of ztunnel's veth inside its pod namespace.
pub const PROG_ZTUNNEL_INGRESS: &str = "ztunnel_ingress";
/// Classifier attached to egress of a workload's host-side veth.
pub const PROG_APP_INBOUND: &str = "app_inbound";
/// Classifier attached to ingress of a workload's host-side veth.
pub const PROG_APP_OUTBOUND: &str = "app_outbound";

pub const MAP_APP_INFO: &str = "app_info";
pub const MAP_ZTUNNEL_INFO: &str = "ztunnel_info";
pub const MAP_HOST_IP_INFO: &str = "host_ip_info";
pub const MAP_LOG_LEVEL: &str = "log_level";

/// The only slot of the `ztunnel_info` and `log_level` arrays.
pub const SINGLE_SLOT: u32 = 0;
/// `host_ip_info` slot holding the node's IPv4 address.
pub const HOST_IP_SLOT_V4: u32 = 0;
/// `host_ip_info` slot holding the node's IPv6 address.
pub const HOST_IP_SLOT_V6: u32 = 1;

/// Redirect DNS traffic (UDP/53) to ztunnel.
pub const CAPTURE_DNS_FLAG: u8 = 1 << 0;

pub const LOG_NONE: u32 = 0;
pub const LOG_INFO: u32 = 1;
pub const LOG_DEBUG: u32 = 2;

pub const ETH_ALEN: usize = 6;

/// Value of the `app_info` hash map (keyed by the pod's IPv4 address in
/// network byte order) and of the single `ztunnel_info` slot.
///
/// Layout (12 bytes): `ifindex` at 0, `mac_addr` at 4, `flag` at 10,
/// `pad` at 11. `ifindex` is in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkloadInfo {
    pub ifindex: u32,
    pub mac_addr: [u8; ETH_ALEN],
    pub flag: u8,
    pub pad: u8,
}

impl WorkloadInfo {
    pub const LEN: usize = core::mem::size_of::<WorkloadInfo>();

    pub fn new(ifindex: u32, mac_addr: [u8; ETH_ALEN]) -> Self {
        Self {
            ifindex,
            mac_addr,
            flag: 0,
            pad: 0,
        }
    }

    pub fn capture_dns(&self) -> bool {
        self.flag & CAPTURE_DNS_FLAG != 0
    }

    /// The record exactly as the classifier sees it in map memory.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.ifindex.to_ne_bytes());
        out[4..10].copy_from_slice(&self.mac_addr);
        out[10] = self.flag;
        out[11] = self.pad;
        out
    }
}

/// Value of a `host_ip_info` slot: the address as 16 bytes, IPv4 in
/// IPv4-mapped form. Declared as four `u32` words to keep the kernel's
/// alignment; the words hold the address bytes in memory order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct HostIpInfo {
    pub addr: [u32; 4],
}

impl HostIpInfo {
    pub const LEN: usize = core::mem::size_of::<HostIpInfo>();

    pub fn from_octets(octets: [u8; 16]) -> Self {
        let mut addr = [0u32; 4];
        for (word, chunk) in addr.iter_mut().zip(octets.chunks_exact(4)) {
            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { addr }
    }

    pub fn octets(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.addr.iter()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for WorkloadInfo {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for HostIpInfo {}
