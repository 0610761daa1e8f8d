//! CDI spec files consumed by the container runtime.
//!
//! One transient spec per prepared claim plus one `common` spec written at
//! startup, all under the CDI root:
//!
//! ```text
//! <cdi-root>/<vendor>-<class>_common.json
//! <cdi-root>/<vendor>-<class>_<claimUID>.json
//! ```

pub mod device_node;

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use api_types::cdi;
use api_types::cdi::qualified_name;
use api_types::ContainerEdits;
use api_types::PreparedDevice;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::checkpoint::write_atomic;
use crate::error::PluginError;
use crate::error::PluginResult;

pub const COMMON_DEVICE_NAME: &str = "common";

#[derive(Debug, Clone)]
pub struct CdiHandler {
    root: PathBuf,
    vendor: String,
    class: String,
    /// Whether claim device IDs are prefixed with the common device
    include_common_id: bool,
}

impl CdiHandler {
    pub fn new(
        root: impl Into<PathBuf>,
        vendor: impl Into<String>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            vendor: vendor.into(),
            class: class.into(),
            include_common_id: false,
        }
    }

    pub fn with_common_device_id(mut self) -> Self {
        self.include_common_id = true;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<vendor>/<class>`
    pub fn kind(&self) -> String {
        format!("{}/{}", self.vendor, self.class)
    }

    pub fn spec_path(&self, transient_id: &str) -> PathBuf {
        let transient_id = transient_id.replace('/', "_");
        self.root
            .join(format!("{}-{}_{transient_id}.json", self.vendor, self.class))
    }

    /// Name of the CDI device for one device of a claim
    pub fn claim_device_name(claim_uid: &str, device_name: &str) -> String {
        format!("{claim_uid}-{device_name}")
    }

    /// Fully qualified device IDs handed back to the kubelet.
    pub fn claim_device_ids<S: AsRef<str>>(
        &self,
        claim_uid: &str,
        device_names: &[S],
    ) -> Vec<String> {
        let common = self
            .include_common_id
            .then(|| qualified_name(&self.vendor, &self.class, COMMON_DEVICE_NAME));
        common
            .into_iter()
            .chain(device_names.iter().map(|device| {
                qualified_name(
                    &self.vendor,
                    &self.class,
                    &Self::claim_device_name(claim_uid, device.as_ref()),
                )
            }))
            .collect()
    }

    /// Writes the node wide spec. Safe to call on every start.
    pub fn write_common_spec(&self, edits: ContainerEdits) -> PluginResult<()> {
        let mut spec = cdi::Spec::new(self.kind());
        spec.devices.push(cdi::Device {
            name: COMMON_DEVICE_NAME.to_string(),
            container_edits: edits,
        });
        let path = self.spec_path(COMMON_DEVICE_NAME);
        self.write_spec(&path, &spec)?;
        info!(path = %path.display(), "Wrote common CDI spec");
        Ok(())
    }

    /// Overwrites the spec of a claim.
    ///
    /// Each device gets the env returned by `claim_env` followed by the edits
    /// recorded on the prepared device.
    pub fn write_claim_spec<F>(
        &self,
        claim_uid: &str,
        devices: &[PreparedDevice],
        claim_env: F,
    ) -> PluginResult<()>
    where
        F: Fn(&PreparedDevice) -> Vec<String>,
    {
        let mut spec = cdi::Spec::new(self.kind());
        for device in devices {
            let mut edits = ContainerEdits::with_env(claim_env(device));
            edits.append(&device.container_edits);
            spec.devices.push(cdi::Device {
                name: Self::claim_device_name(claim_uid, &device.device_name),
                container_edits: edits,
            });
        }

        let path = self.spec_path(claim_uid);
        self.write_spec(&path, &spec)
            .attach_printable_lazy(|| format!("claim: {claim_uid}"))?;
        debug!(claim_uid, path = %path.display(), devices = devices.len(), "Wrote claim CDI spec");
        Ok(())
    }

    /// Removes the spec of a claim. A missing file is not an error.
    pub fn delete_claim_spec(&self, claim_uid: &str) -> PluginResult<()> {
        let path = self.spec_path(claim_uid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(claim_uid, path = %path.display(), "Deleted claim CDI spec");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(PluginError::DescriptorIo {
                message: format!("failed to delete {}", path.display()),
            })),
        }
    }

    fn write_spec(&self, path: &Path, spec: &cdi::Spec) -> PluginResult<()> {
        fs::create_dir_all(&self.root).change_context(PluginError::DescriptorIo {
            message: format!("failed to create CDI root {}", self.root.display()),
        })?;
        let data = serde_json::to_vec_pretty(spec).change_context(PluginError::DescriptorIo {
            message: "failed to serialize CDI spec".to_string(),
        })?;
        write_atomic(&self.root, path, &data).change_context(PluginError::DescriptorIo {
            message: format!("failed to write {}", path.display()),
        })
    }
}
