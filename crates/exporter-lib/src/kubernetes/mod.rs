//! Pod attribution
//!
//! Asks the kubelet's pod-resources API which pods hold which GPU devices
//! and stamps pod, namespace and container attributes onto matching
//! metrics. Device ids arrive in several encodings depending on the device
//! plugin and platform; every recognised encoding is indexed so metric
//! identity can match whichever one the plugin used.

pub mod podresources;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;

use crate::collector::Snapshot;
use crate::devices::Inventory;
use crate::error::{ExporterError, Result};
use crate::transform::Transform;
use podresources::{ListPodResourcesRequest, ListPodResourcesResponse};

/// Default kubelet pod-resources socket.
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

/// Which metric field keys the device map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KubernetesGpuIdType {
    /// Match on the GPU UUID.
    #[default]
    Uid,
    /// Match on the device name, e.g. `nvidia0`.
    DeviceName,
}

impl KubernetesGpuIdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KubernetesGpuIdType::Uid => "uid",
            KubernetesGpuIdType::DeviceName => "device-name",
        }
    }
}

impl FromStr for KubernetesGpuIdType {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uid" => Ok(KubernetesGpuIdType::Uid),
            "device-name" => Ok(KubernetesGpuIdType::DeviceName),
            other => Err(ExporterError::Config(format!(
                "invalid kubernetes-gpu-id-type {other:?}, want \"uid\" or \"device-name\""
            ))),
        }
    }
}

/// One pod's claim on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub pod: String,
    pub namespace: String,
    pub container: String,
}

/// Transform that attributes metrics to the pods holding their devices.
pub struct PodMapper {
    socket_path: PathBuf,
    gpu_id_type: KubernetesGpuIdType,
    use_old_namespace: bool,
}

impl PodMapper {
    pub fn new(
        socket_path: PathBuf,
        gpu_id_type: KubernetesGpuIdType,
        use_old_namespace: bool,
    ) -> Self {
        Self {
            socket_path,
            gpu_id_type,
            use_old_namespace,
        }
    }

    async fn list_pods(&self) -> Result<ListPodResourcesResponse> {
        let mut client = podresources::connect(&self.socket_path).await?;
        let response = client
            .list(ListPodResourcesRequest::default())
            .await
            .map_err(|e| ExporterError::Scrape(format!("pod-resources list failed: {e}")))?;
        Ok(response.into_inner())
    }

    /// Stamp attributes onto every metric whose device key is claimed.
    fn apply(&self, snapshot: &mut Snapshot, device_to_pod: &HashMap<String, PodInfo>) {
        let (pod_key, namespace_key, container_key) = if self.use_old_namespace {
            ("pod_name", "pod_namespace", "container_name")
        } else {
            ("pod", "namespace", "container")
        };

        for metric in snapshot.iter_mut() {
            // MIG metrics are claimed per GPU instance; whole-GPU metrics by
            // the configured id type.
            let key = if metric.gpu_instance_id.is_empty() {
                match self.gpu_id_type {
                    KubernetesGpuIdType::Uid => metric.gpu_uuid.clone(),
                    KubernetesGpuIdType::DeviceName => metric.device.clone(),
                }
            } else {
                format!("{}-{}", metric.gpu, metric.gpu_instance_id)
            };
            if let Some(info) = device_to_pod.get(&key) {
                metric
                    .attributes
                    .insert(pod_key.to_string(), info.pod.clone());
                metric
                    .attributes
                    .insert(namespace_key.to_string(), info.namespace.clone());
                metric
                    .attributes
                    .insert(container_key.to_string(), info.container.clone());
            }
        }
    }
}

#[async_trait]
impl Transform for PodMapper {
    fn name(&self) -> &'static str {
        "pod mapper"
    }

    async fn process(&self, snapshot: &mut Snapshot, inventory: &Inventory) -> Result<()> {
        if !self.socket_path.exists() {
            // Not a Kubernetes node; nothing to attribute.
            debug!(socket = %self.socket_path.display(), "pod-resources socket absent, skipping");
            return Ok(());
        }
        let response = self.list_pods().await?;
        let device_to_pod = device_to_pod(&response, inventory);
        debug!(devices = device_to_pod.len(), "pod attribution map built");
        self.apply(snapshot, &device_to_pod);
        Ok(())
    }
}

/// Index every claimed device id under each encoding it may appear as.
fn device_to_pod(
    response: &ListPodResourcesResponse,
    inventory: &Inventory,
) -> HashMap<String, PodInfo> {
    let mut map = HashMap::new();
    for pod in &response.pod_resources {
        for container in &pod.containers {
            for devices in &container.devices {
                if devices.resource_name != GPU_RESOURCE_NAME
                    && !devices.resource_name.starts_with(MIG_RESOURCE_PREFIX)
                {
                    continue;
                }
                let info = PodInfo {
                    pod: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                    container: container.name.clone(),
                };
                for device_id in &devices.device_ids {
                    for key in device_keys(device_id, inventory) {
                        map.insert(key, info.clone());
                    }
                }
            }
        }
    }
    map
}

/// Every key one device id can be matched under.
fn device_keys(device_id: &str, inventory: &Inventory) -> Vec<String> {
    let mut keys = vec![device_id.to_string()];

    if let Some((gpu, instance)) = parse_gke_mig_device(device_id) {
        keys.push(format!("{gpu}-{instance}"));
    } else if let Some(gpu) = device_id.strip_suffix("/vgpu") {
        keys.push(gpu.to_string());
    } else if let Some(uuid) = device_id.strip_prefix("MIG-") {
        keys.push(uuid.to_string());
        // The suffix names the parent GPU; claim every instance it carries.
        if let Some(gpu) = inventory.gpu_by_uuid(uuid) {
            for instance in &gpu.instances {
                keys.push(format!("{}-{}", gpu.gpu_id, instance.nvml_instance_id));
            }
        }
    }
    if let Some((prefix, _)) = device_id.split_once("::") {
        keys.push(prefix.to_string());
    }
    keys
}

/// Parse the GKE MIG device encoding, e.g. `nvidia0/gi3` into `(0, 3)`.
fn parse_gke_mig_device(device_id: &str) -> Option<(u32, u32)> {
    let (gpu_part, instance_part) = device_id.split_once('/')?;
    let gpu = gpu_part.strip_prefix("nvidia")?.parse().ok()?;
    let instance = instance_part.strip_prefix("gi")?.parse().ok()?;
    Some((gpu, instance))
}

#[cfg(test)]
mod tests {
    use super::podresources::{ContainerDevices, ContainerResources, PodResources};
    use super::*;
    use crate::collector::{CollectorConfig, Metric};
    use crate::counters::{Counter, PromType};
    use crate::dcgm::{
        connect, DcgmOptions, DeviceInfo, EngineTopology, SimGpu, SimMigInstance,
    };
    use crate::devices::DeviceOptions;

    fn response(resource_name: &str, device_ids: &[&str]) -> ListPodResourcesResponse {
        ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "workload-0".to_string(),
                namespace: "default".to_string(),
                containers: vec![ContainerResources {
                    name: "main".to_string(),
                    devices: vec![ContainerDevices {
                        resource_name: resource_name.to_string(),
                        device_ids: device_ids.iter().map(|s| s.to_string()).collect(),
                    }],
                }],
            }],
        }
    }

    fn mig_inventory() -> Inventory {
        let topology = EngineTopology {
            gpus: vec![SimGpu {
                info: DeviceInfo {
                    gpu_id: 0,
                    uuid: "GPU-00000000-0000-0000-0000-000000000000".to_string(),
                    model: "NVIDIA H100 80GB HBM3".to_string(),
                },
                mig_instances: vec![SimMigInstance {
                    entity_id: 100,
                    nvml_instance_id: 3,
                    profile: "1g.5gb".to_string(),
                    compute_instances: vec![200],
                }],
            }],
            ..EngineTopology::default()
        };
        let client = connect(&DcgmOptions {
            fake_topology: Some(topology),
            ..DcgmOptions::default()
        })
        .unwrap();
        Inventory::discover(&client, DeviceOptions::default(), false).unwrap()
    }

    fn plain_inventory() -> Inventory {
        let client = connect(&DcgmOptions {
            fake_topology: Some(EngineTopology::fake_gpus(1)),
            ..DcgmOptions::default()
        })
        .unwrap();
        Inventory::discover(&client, DeviceOptions::default(), false).unwrap()
    }

    fn counter() -> Counter {
        Counter {
            field_id: 150,
            field_name: "DCGM_FI_DEV_GPU_TEMP".to_string(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    #[test]
    fn bare_uuid_maps_to_itself() {
        let map = device_to_pod(
            &response("nvidia.com/gpu", &["GPU-aaaa"]),
            &plain_inventory(),
        );
        assert_eq!(map["GPU-aaaa"].pod, "workload-0");
    }

    #[test]
    fn mig_uuid_maps_all_three_forms() {
        let map = device_to_pod(
            &response(
                "nvidia.com/mig-1g.5gb",
                &["MIG-GPU-00000000-0000-0000-0000-000000000000"],
            ),
            &mig_inventory(),
        );
        assert!(map.contains_key("MIG-GPU-00000000-0000-0000-0000-000000000000"));
        assert!(map.contains_key("GPU-00000000-0000-0000-0000-000000000000"));
        assert!(map.contains_key("0-3"));
    }

    #[test]
    fn gke_encodings_map_to_gi_and_gpu() {
        let inventory = plain_inventory();
        let map = device_to_pod(&response("nvidia.com/gpu", &["nvidia0/gi3"]), &inventory);
        assert!(map.contains_key("0-3"));
        assert!(map.contains_key("nvidia0/gi3"));

        let map = device_to_pod(&response("nvidia.com/gpu", &["0/vgpu"]), &inventory);
        assert!(map.contains_key("0"));
    }

    #[test]
    fn colon_colon_suffix_is_stripped() {
        let map = device_to_pod(
            &response("nvidia.com/gpu", &["GPU-bbbb::extra"]),
            &plain_inventory(),
        );
        assert!(map.contains_key("GPU-bbbb"));
        assert!(map.contains_key("GPU-bbbb::extra"));
    }

    #[test]
    fn non_gpu_resources_are_ignored() {
        let map = device_to_pod(
            &response("example.com/fpga", &["GPU-cccc"]),
            &plain_inventory(),
        );
        assert!(map.is_empty());
    }

    #[test]
    fn attribution_by_uuid_and_instance() {
        let inventory = mig_inventory();
        let gpu = &inventory.gpus[0];
        let mapper = PodMapper::new(
            PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            KubernetesGpuIdType::Uid,
            false,
        );
        let config = CollectorConfig::default();

        let mut snapshot = Snapshot::default();
        snapshot.push(&counter(), Metric::for_gpu("42".to_string(), gpu, &config));
        snapshot.push(
            &counter(),
            Metric::for_gpu_instance("17".to_string(), gpu, &gpu.instances[0], &config),
        );

        let map = device_to_pod(
            &response(
                "nvidia.com/mig-1g.5gb",
                &["MIG-GPU-00000000-0000-0000-0000-000000000000"],
            ),
            &inventory,
        );
        mapper.apply(&mut snapshot, &map);

        let metrics = &snapshot.groups[0].metrics;
        // Whole-GPU metric matches the stripped UUID, instance metric the GI key.
        for metric in metrics {
            assert_eq!(metric.attributes["pod"].as_str(), "workload-0");
            assert_eq!(metric.attributes["namespace"].as_str(), "default");
            assert_eq!(metric.attributes["container"].as_str(), "main");
        }

        // Idempotent: a second application changes nothing.
        let before = snapshot.clone();
        mapper.apply(&mut snapshot, &map);
        assert_eq!(before.groups[0].metrics, snapshot.groups[0].metrics);
    }

    #[test]
    fn unclaimed_devices_keep_empty_attributes() {
        let inventory = plain_inventory();
        let mapper = PodMapper::new(
            PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            KubernetesGpuIdType::Uid,
            false,
        );
        let mut snapshot = Snapshot::default();
        snapshot.push(
            &counter(),
            Metric::for_gpu("42".to_string(), &inventory.gpus[0], &CollectorConfig::default()),
        );
        mapper.apply(&mut snapshot, &HashMap::new());
        assert!(snapshot.groups[0].metrics[0].attributes.is_empty());
    }

    #[test]
    fn old_namespace_attribute_names() {
        let inventory = plain_inventory();
        let gpu = &inventory.gpus[0];
        let mapper = PodMapper::new(
            PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            KubernetesGpuIdType::Uid,
            true,
        );
        let mut snapshot = Snapshot::default();
        snapshot.push(
            &counter(),
            Metric::for_gpu("42".to_string(), gpu, &CollectorConfig::default()),
        );
        let map = device_to_pod(&response("nvidia.com/gpu", &[&gpu.uuid]), &inventory);
        mapper.apply(&mut snapshot, &map);

        let attributes = &snapshot.groups[0].metrics[0].attributes;
        assert_eq!(attributes["pod_name"].as_str(), "workload-0");
        assert_eq!(attributes["pod_namespace"].as_str(), "default");
        assert_eq!(attributes["container_name"].as_str(), "main");
        assert!(!attributes.contains_key("pod"));
    }

    #[test]
    fn device_name_id_type_matches_on_device() {
        let inventory = plain_inventory();
        let gpu = &inventory.gpus[0];
        let mapper = PodMapper::new(
            PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            KubernetesGpuIdType::DeviceName,
            false,
        );
        let mut snapshot = Snapshot::default();
        snapshot.push(
            &counter(),
            Metric::for_gpu("42".to_string(), gpu, &CollectorConfig::default()),
        );
        let map = device_to_pod(&response("nvidia.com/gpu", &["nvidia0"]), &inventory);
        mapper.apply(&mut snapshot, &map);
        assert_eq!(
            snapshot.groups[0].metrics[0].attributes["pod"].as_str(),
            "workload-0"
        );
    }

    #[test]
    fn gpu_id_type_parses() {
        assert_eq!(
            "uid".parse::<KubernetesGpuIdType>().unwrap(),
            KubernetesGpuIdType::Uid
        );
        assert_eq!(
            "device-name".parse::<KubernetesGpuIdType>().unwrap(),
            KubernetesGpuIdType::DeviceName
        );
        assert!("pci".parse::<KubernetesGpuIdType>().is_err());
    }
}
