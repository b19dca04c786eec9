//! Command line and environment configuration
//!
//! Every flag has a `DCGM_EXPORTER_*` environment equivalent. The struct
//! holds raw flag values; the accessors parse them into the library types
//! and report bad input as configuration errors.

use std::path::PathBuf;

use clap::Parser;

use exporter_lib::collector::CollectorConfig;
use exporter_lib::dcgm::{DcgmLogLevel, DcgmOptions, EngineTopology, InitMode};
use exporter_lib::devices::{DeviceOptions, DeviceSelection};
use exporter_lib::error::{ExporterError, Result};
use exporter_lib::kubernetes::{KubernetesGpuIdType, DEFAULT_POD_RESOURCES_SOCKET};
use exporter_lib::server::ServerOptions;

/// Synthesised fleet size for `--fake-gpus` runs.
const FAKE_GPU_COUNT: u32 = 4;

/// Prometheus exporter for NVIDIA GPU telemetry
#[derive(Parser, Debug, Clone)]
#[command(name = "dcgm-exporter")]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// Path to the counter definitions file
    #[arg(
        long,
        short = 'f',
        env = "DCGM_EXPORTER_COLLECTORS",
        default_value = "/etc/dcgm-exporter/default-counters.csv"
    )]
    pub collectors: PathBuf,

    /// Listen address, host:port or :port
    #[arg(long, short = 'a', env = "DCGM_EXPORTER_LISTEN", default_value = ":9400")]
    pub address: String,

    /// Scrape period in milliseconds
    #[arg(
        long,
        short = 'c',
        env = "DCGM_EXPORTER_INTERVAL",
        default_value_t = 30000
    )]
    pub collect_interval: u64,

    /// Attribute metrics to pods via the kubelet pod-resources API
    #[arg(long, short = 'k', env = "DCGM_EXPORTER_KUBERNETES")]
    pub kubernetes: bool,

    /// Which metric field keys pod attribution: uid or device-name
    #[arg(
        long,
        env = "DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE",
        default_value = "uid"
    )]
    pub kubernetes_gpu_id_type: String,

    /// Kubelet pod-resources socket path
    #[arg(
        long,
        env = "DCGM_EXPORTER_POD_RESOURCES_KUBELET_SOCKET",
        default_value = DEFAULT_POD_RESOURCES_SOCKET
    )]
    pub pod_resources_kubelet_socket: PathBuf,

    /// Use the legacy pod attribute names (pod_name, pod_namespace, container_name)
    #[arg(long, short = 'o', env = "DCGM_EXPORTER_USE_OLD_NAMESPACE")]
    pub use_old_namespace: bool,

    /// GPU selection: f, g[:ranges] or i[:ranges]
    #[arg(long, short = 'd', env = "DCGM_EXPORTER_DEVICES", default_value = "f")]
    pub devices: String,

    /// Switch and NvLink selection
    #[arg(
        long,
        short = 's',
        env = "DCGM_EXPORTER_OTHER_DEVICES",
        default_value = "f"
    )]
    pub switch_devices: String,

    /// CPU and core selection
    #[arg(
        long,
        short = 'p',
        env = "DCGM_EXPORTER_CPU_DEVICES",
        default_value = "f"
    )]
    pub cpu_devices: String,

    /// Omit the Hostname label
    #[arg(long, short = 'n', env = "DCGM_EXPORTER_NO_HOSTNAME")]
    pub no_hostname: bool,

    /// Accept a fleet of synthesised GPUs
    #[arg(long, env = "DCGM_EXPORTER_USE_FAKE_GPUS")]
    pub fake_gpus: bool,

    /// XID error counting window, milliseconds
    #[arg(
        long,
        short = 'x',
        env = "DCGM_EXPORTER_XID_COUNT_WINDOW_SIZE",
        default_value_t = 300_000
    )]
    pub xid_count_window_size: u64,

    /// Clock event counting window, milliseconds
    #[arg(
        long,
        env = "DCGM_EXPORTER_CLOCK_EVENTS_COUNT_WINDOW_SIZE",
        default_value_t = 300_000
    )]
    pub clock_events_count_window_size: u64,

    /// Join model name words with dashes
    #[arg(long, env = "DCGM_EXPORTER_REPLACE_BLANKS_IN_MODEL_NAME")]
    pub replace_blanks_in_model_name: bool,

    /// Attach to a remote hostengine, host:port (default target localhost:5555);
    /// without this flag the engine runs embedded
    #[arg(long, short = 'r', env = "DCGM_EXPORTER_REMOTE_HOSTENGINE_INFO")]
    pub remote_hostengine_info: Option<String>,

    /// TLS and basic auth configuration file
    #[arg(long, env = "DCGM_EXPORTER_WEB_CONFIG_FILE")]
    pub web_config_file: Option<PathBuf>,

    /// Take the listener from systemd socket activation
    #[arg(long, env = "DCGM_EXPORTER_SYSTEMD_SOCKET")]
    pub web_systemd_socket: bool,

    /// Stream DCGM's own logs to stdout
    #[arg(long, env = "DCGM_EXPORTER_ENABLE_DCGM_LOG")]
    pub enable_dcgm_log: bool,

    /// DCGM log level: NONE, FATAL, ERROR, WARN, INFO, DEBUG or VERB
    #[arg(long, env = "DCGM_EXPORTER_DCGM_LOG_LEVEL", default_value = "NONE")]
    pub dcgm_log_level: String,

    /// Verbose exporter logs
    #[arg(long, env = "DCGM_EXPORTER_DEBUG")]
    pub debug: bool,
}

impl Settings {
    pub fn device_options(&self) -> Result<DeviceOptions> {
        Ok(DeviceOptions {
            gpus: self.devices.parse::<DeviceSelection>()?,
            switches: self.switch_devices.parse::<DeviceSelection>()?,
            cpus: self.cpu_devices.parse::<DeviceSelection>()?,
        })
    }

    pub fn dcgm_options(&self) -> Result<DcgmOptions> {
        let mode = match &self.remote_hostengine_info {
            Some(address) if !address.is_empty() => InitMode::Standalone(address.clone()),
            Some(_) => InitMode::Standalone("localhost:5555".to_string()),
            None => InitMode::Embedded,
        };
        Ok(DcgmOptions {
            mode,
            enable_logging: self.enable_dcgm_log,
            log_level: self
                .dcgm_log_level
                .parse::<DcgmLogLevel>()
                .map_err(ExporterError::Config)?,
            fake_topology: self
                .fake_gpus
                .then(|| EngineTopology::fake_gpus(FAKE_GPU_COUNT)),
        })
    }

    pub fn kubernetes_gpu_id_type(&self) -> Result<KubernetesGpuIdType> {
        self.kubernetes_gpu_id_type.parse()
    }

    pub fn collector_config(&self) -> CollectorConfig {
        let hostname = if self.no_hostname {
            String::new()
        } else {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default()
        };
        CollectorConfig {
            hostname,
            replace_blanks_in_model_name: self.replace_blanks_in_model_name,
            collect_interval_ms: self.collect_interval,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            address: self.address.clone(),
            web_config_path: self.web_config_file.clone(),
            systemd_socket: self.web_systemd_socket,
        }
    }

    /// Window for one of the two synthetic counters.
    pub fn window_for(&self, kind: exporter_lib::counters::WindowedKind) -> u64 {
        match kind {
            exporter_lib::counters::WindowedKind::XidErrors => self.xid_count_window_size,
            exporter_lib::counters::WindowedKind::ClockEvents => {
                self.clock_events_count_window_size
            }
        }
    }

    /// Surface selection mistakes before touching DCGM.
    pub fn validate(&self) -> Result<()> {
        self.device_options()?;
        self.dcgm_options()?;
        self.kubernetes_gpu_id_type()?;
        if self.collect_interval == 0 {
            return Err(ExporterError::Config(
                "collect-interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
