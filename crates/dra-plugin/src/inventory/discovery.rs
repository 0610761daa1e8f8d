//! Device sources the inventory is filled from.

use std::collections::BTreeMap;

use api_types::topology::NodeTopology;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::Client;
use tracing::debug;

use super::AttrValue;
use super::Device;
use super::DeviceSet;
use super::Quantity;
use crate::error::DiscoveryError;

/// Node annotation carrying the simulated GPU topology as JSON
pub const FAKE_DEVICES_ANNOTATION: &str = "nvidia.com/gpu.fake.devices";

/// Number of channel devices announced by the compute-domain plugin
pub const MAX_CHANNEL_ID: u32 = 2048;

pub type DiscoveryResult<T> = Result<T, Report<DiscoveryError>>;

/// Enumerates the devices that exist on the local node.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn enumerate(&self) -> DiscoveryResult<DeviceSet>;
}

/// Converts a topology document into allocatable GPU devices.
///
/// An empty GPU list or an entry without an ID is rejected rather than
/// producing an empty inventory.
pub fn devices_from_topology(
    node_name: &str,
    topology: NodeTopology,
) -> DiscoveryResult<DeviceSet> {
    if topology.gpus.is_empty() {
        return Err(Report::new(DiscoveryError::Empty {
            node_name: node_name.to_string(),
        }));
    }

    let memory = Quantity::from_mebibytes(topology.gpu_memory);
    let mut devices = BTreeMap::new();
    for gpu in &topology.gpus {
        if gpu.id.is_empty() {
            return Err(Report::new(DiscoveryError::Malformed {
                message: format!("GPU entry without ID in topology of node {node_name}"),
            }));
        }

        let name = gpu.id.to_lowercase();
        let device = Device {
            name: name.clone(),
            attributes: BTreeMap::from([
                ("uuid".to_string(), AttrValue::String(gpu.id.clone())),
                (
                    "model".to_string(),
                    AttrValue::String(topology.gpu_product.clone()),
                ),
            ]),
            capacity: BTreeMap::from([("memory".to_string(), memory)]),
        };
        devices.insert(name, device);
    }

    Ok(DeviceSet {
        devices,
        topology: Some(topology),
    })
}

/// Parses a raw topology document as found in the annotation or returned by
/// the topology server.
pub fn parse_topology(node_name: &str, raw: &str) -> DiscoveryResult<DeviceSet> {
    if raw.trim().is_empty() {
        return Err(Report::new(DiscoveryError::Empty {
            node_name: node_name.to_string(),
        }));
    }
    let topology: NodeTopology =
        serde_json::from_str(raw).change_context(DiscoveryError::Malformed {
            message: format!("topology of node {node_name} is not valid JSON"),
        })?;
    devices_from_topology(node_name, topology)
}

/// Reads the topology from an annotation on the node object
pub struct NodeAnnotationSource {
    client: Client,
    node_name: String,
}

impl NodeAnnotationSource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl DeviceSource for NodeAnnotationSource {
    async fn enumerate(&self) -> DiscoveryResult<DeviceSet> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(&self.node_name).await.map_err(|e| {
            let missing = matches!(&e, kube::Error::Api(response) if response.code == 404);
            let context = if missing {
                DiscoveryError::NotFound {
                    node_name: self.node_name.clone(),
                    message: "node object does not exist".to_string(),
                }
            } else {
                DiscoveryError::Unreachable {
                    message: format!("failed to get node {}", self.node_name),
                }
            };
            Report::new(e).change_context(context)
        })?;

        let raw = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(FAKE_DEVICES_ANNOTATION))
            .ok_or_else(|| {
                Report::new(DiscoveryError::NotFound {
                    node_name: self.node_name.clone(),
                    message: format!("annotation {FAKE_DEVICES_ANNOTATION} not set"),
                })
            })?;

        debug!(node_name = %self.node_name, "Read topology from node annotation");
        parse_topology(&self.node_name, raw)
    }
}

/// Fetches the topology from the topology server over HTTP
pub struct TopologyServerSource {
    http: reqwest::Client,
    base_url: String,
    node_name: String,
}

impl TopologyServerSource {
    pub fn new(base_url: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            node_name: node_name.into(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/topology/nodes/{}",
            self.base_url.trim_end_matches('/'),
            self.node_name
        )
    }
}

#[async_trait]
impl DeviceSource for TopologyServerSource {
    async fn enumerate(&self) -> DiscoveryResult<DeviceSet> {
        let url = self.url();
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .change_context(DiscoveryError::Unreachable {
                message: format!("GET {url} failed"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Report::new(DiscoveryError::NotFound {
                node_name: self.node_name.clone(),
                message: format!("topology server has no entry at {url}"),
            }));
        }
        if !status.is_success() {
            return Err(Report::new(DiscoveryError::Unreachable {
                message: format!("GET {url} returned {status}"),
            }));
        }

        let body = response
            .text()
            .await
            .change_context(DiscoveryError::Unreachable {
                message: format!("failed to read body of {url}"),
            })?;
        parse_topology(&self.node_name, &body)
    }
}

/// Static channel devices of the compute-domain plugin
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelSource;

impl ChannelSource {
    pub fn channel_name(id: u32) -> String {
        format!("channel-{id}")
    }

    pub fn devices() -> DeviceSet {
        DeviceSet::from_devices((0..MAX_CHANNEL_ID).map(|id| Device {
            name: Self::channel_name(id),
            attributes: BTreeMap::from([
                (
                    "compute-domain.nvidia.com/type".to_string(),
                    AttrValue::String("channel".to_string()),
                ),
                (
                    "compute-domain.nvidia.com/id".to_string(),
                    AttrValue::Int(i64::from(id)),
                ),
            ]),
            capacity: BTreeMap::new(),
        }))
    }
}

#[async_trait]
impl DeviceSource for ChannelSource {
    async fn enumerate(&self) -> DiscoveryResult<DeviceSet> {
        Ok(Self::devices())
    }
}
