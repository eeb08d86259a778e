//! Loading the compiled classifier object and taking out the handles the
//! redirect engine works with.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use aya::maps::{Array, HashMap, MapData};
use aya::programs::SchedClassifier;
use aya::{Ebpf, EbpfLoader};
use tracing::{debug, info};

use ztunnel_redirect_common::{
    HostIpInfo, WorkloadInfo, MAP_APP_INFO, MAP_HOST_IP_INFO, MAP_LOG_LEVEL, MAP_ZTUNNEL_INFO,
    PROG_APP_INBOUND, PROG_APP_OUTBOUND, PROG_ZTUNNEL_HOST_INGRESS, PROG_ZTUNNEL_INGRESS,
};

use crate::tables::LookupTables;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("loading objects: {0}")]
    Object(#[from] aya::EbpfError),
    #[error("program {0} not found in object")]
    ProgramNotFound(&'static str),
    #[error("map {0} not found in object")]
    MapNotFound(&'static str),
    #[error("program {name}: {source}")]
    Program {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },
    #[error("map {name}: {source}")]
    Map {
        name: &'static str,
        #[source]
        source: aya::maps::MapError,
    },
}

/// A loaded classifier program. The fd attaches it; the name identifies the
/// filters it was attached as, since fds are not stable across loads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramHandle {
    pub fd: RawFd,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct ProgramSet {
    pub ztunnel_host_ingress: ProgramHandle,
    pub ztunnel_ingress: ProgramHandle,
    pub app_inbound: ProgramHandle,
    pub app_outbound: ProgramHandle,
}

/// Everything taken out of the object file. Dropping it closes the program
/// fds and map handles; pinned maps and attached filters stay in the kernel.
pub struct Loaded {
    pub programs: ProgramSet,
    pub tables: LookupTables,
    _ebpf: Ebpf,
}

impl Loaded {
    pub fn into_parts(self) -> (ProgramSet, LookupTables, Ebpf) {
        (self.programs, self.tables, self._ebpf)
    }
}

/// Loads `object`, pinning its maps under `pin_path`.
pub fn load(object: &Path, pin_path: &Path) -> Result<Loaded, LoadError> {
    let mut ebpf = EbpfLoader::new().map_pin_path(pin_path).load_file(object)?;

    let programs = ProgramSet {
        ztunnel_host_ingress: load_classifier(&mut ebpf, PROG_ZTUNNEL_HOST_INGRESS)?,
        ztunnel_ingress: load_classifier(&mut ebpf, PROG_ZTUNNEL_INGRESS)?,
        app_inbound: load_classifier(&mut ebpf, PROG_APP_INBOUND)?,
        app_outbound: load_classifier(&mut ebpf, PROG_APP_OUTBOUND)?,
    };

    let app_info: HashMap<MapData, [u8; 4], WorkloadInfo> = take_map(&mut ebpf, MAP_APP_INFO)?;
    let ztunnel_info: Array<MapData, WorkloadInfo> = take_map(&mut ebpf, MAP_ZTUNNEL_INFO)?;
    let host_ip_info: Array<MapData, HostIpInfo> = take_map(&mut ebpf, MAP_HOST_IP_INFO)?;
    let log_level: Array<MapData, u32> = take_map(&mut ebpf, MAP_LOG_LEVEL)?;

    info!(
        object = %object.display(),
        pin_path = %pin_path.display(),
        "loaded redirect programs"
    );

    Ok(Loaded {
        programs,
        tables: LookupTables {
            app_info: Box::new(app_info),
            ztunnel_info: Box::new(ztunnel_info),
            host_ip_info: Box::new(host_ip_info),
            log_level: Box::new(log_level),
        },
        _ebpf: ebpf,
    })
}

fn load_classifier(ebpf: &mut Ebpf, name: &'static str) -> Result<ProgramHandle, LoadError> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or(LoadError::ProgramNotFound(name))?
        .try_into()
        .map_err(|source| LoadError::Program { name, source })?;
    program
        .load()
        .map_err(|source| LoadError::Program { name, source })?;

    let fd = program
        .fd()
        .map_err(|source| LoadError::Program { name, source })?
        .as_fd()
        .as_raw_fd();
    // The kernel truncates program names; filters report the truncated one.
    let info = program
        .info()
        .map_err(|source| LoadError::Program { name, source })?;
    let kernel_name = info.name_as_str().unwrap_or(name).to_string();

    debug!(program = name, fd, kernel_name = %kernel_name, "classifier loaded");
    Ok(ProgramHandle {
        fd,
        name: kernel_name,
    })
}

fn take_map<T>(ebpf: &mut Ebpf, name: &'static str) -> Result<T, LoadError>
where
    T: TryFrom<aya::maps::Map, Error = aya::maps::MapError>,
{
    let map = ebpf.take_map(name).ok_or(LoadError::MapNotFound(name))?;
    T::try_from(map).map_err(|source| LoadError::Map { name, source })
}
