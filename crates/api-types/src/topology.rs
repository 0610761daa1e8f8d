//! Node topology published by the topology server and the node annotation.
//!
//! The publisher is written in Go and marshals its structs without JSON tags,
//! so field names arrive capitalized. The aliases accept both spellings.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTopology {
    #[serde(rename = "gpuCount", alias = "GpuCount", default)]
    pub gpu_count: u32,
    /// Memory of every GPU in MiB
    #[serde(rename = "gpuMemory", alias = "GpuMemory", default)]
    pub gpu_memory: u64,
    #[serde(rename = "gpuProduct", alias = "GpuProduct", default)]
    pub gpu_product: String,
    #[serde(rename = "gpus", alias = "Gpus", default)]
    pub gpus: Vec<GpuDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDetails {
    #[serde(rename = "id", alias = "ID", alias = "Id", default)]
    pub id: String,
    #[serde(
        rename = "metrics",
        alias = "Metrics",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metrics: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn accepts_go_field_names() {
        let topology: NodeTopology = serde_json::from_str(
            r#"{"GpuCount":1,"GpuMemory":40960,"GpuProduct":"A100","Gpus":[{"ID":"GPU-ABC","Metrics":{}}]}"#,
        )
        .expect("decode");
        assert_eq!(topology.gpu_product, "A100");
        assert_eq!(topology.gpus[0].id, "GPU-ABC");
    }

    #[test]
    fn accepts_camel_case_names() {
        let topology: NodeTopology =
            serde_json::from_str(r#"{"gpuMemory":1024,"gpus":[{"id":"gpu-1"}]}"#).expect("decode");
        assert_eq!(topology.gpu_memory, 1024);
        assert_eq!(topology.gpus.len(), 1);
    }
}
