use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bpffs::DEFAULT_PIN_PATH;
use crate::netns::DEFAULT_NETNS_DIR;

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Compiled redirect classifier object.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Directory on the bpf filesystem where maps are pinned.
    #[serde(default = "default_pin_path")]
    pub pin_path: PathBuf,

    /// Directory of named network namespace mounts.
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Initial classifier log level: none, info or debug.
    #[serde(default)]
    pub ebpf_log_level: Option<String>,

    /// The node's own addresses, at most one per family.
    #[serde(default)]
    pub host_ips: Vec<String>,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from("/usr/lib/ztunnel-redirect/ambient_redirect.bpf.o")
}

fn default_pin_path() -> PathBuf {
    PathBuf::from(DEFAULT_PIN_PATH)
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from(DEFAULT_NETNS_DIR)
}

fn default_port() -> u16 {
    15050
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bpf_object: default_bpf_object(),
            pin_path: default_pin_path(),
            netns_dir: default_netns_dir(),
            port: default_port(),
            quiet: false,
            ebpf_log_level: None,
            host_ips: Vec::new(),
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref object) = cli.bpf_object {
            self.bpf_object = object.clone();
        }
        if let Some(ref pin_path) = cli.pin_path {
            self.pin_path = pin_path.clone();
        }
        if let Some(ref netns_dir) = cli.netns_dir {
            self.netns_dir = netns_dir.clone();
        }
        if cli.port != default_port() {
            self.port = cli.port;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.ebpf_log_level.is_some() {
            self.ebpf_log_level = cli.ebpf_log_level.clone();
        }
        if !cli.host_ips.is_empty() {
            self.host_ips = cli.host_ips.clone();
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// ztunnel-redirect: TC based traffic redirection for ambient mesh pods
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the compiled redirect classifier object.
    #[arg(short, long)]
    pub bpf_object: Option<PathBuf>,

    /// Pin directory for the lookup tables (on a bpf filesystem).
    #[arg(long)]
    pub pin_path: Option<PathBuf>,

    /// Directory holding named network namespaces.
    #[arg(long)]
    pub netns_dir: Option<PathBuf>,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 15050)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Classifier log level written at startup (none, info, debug).
    #[arg(long)]
    pub ebpf_log_level: Option<String>,

    /// Host addresses to publish to the classifier. Repeat for IPv4 and IPv6.
    #[arg(long)]
    pub host_ips: Vec<String>,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,

    /// Add a single pod from a JSON redirect request file and exit.
    #[arg(long, value_name = "FILE")]
    pub add_pod: Option<PathBuf>,
}
