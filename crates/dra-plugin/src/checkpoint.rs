//! Durable, checksum protected plugin state.
//!
//! The whole state of a plugin lives in one JSON document inside the plugin
//! data directory:
//!
//! ```json
//! {"checksum": 1234, "v1": {"preparedClaims": {...}, "domains": {...}}}
//! ```
//!
//! The checksum covers the document serialized with `checksum` set to zero.
//! On load it is recomputed over the stored bytes with only the checksum
//! value zeroed, so every byte outside the checksum digits is covered,
//! including keys the parser would skip.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use api_types::PreparedDevice;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;

use crate::domain::DomainInfo;
use crate::error::PluginError;
use crate::error::PluginResult;

/// Start of every marshaled checkpoint; `checksum` is the first field.
const CHECKSUM_PREFIX: &[u8] = b"{\"checksum\":";

/// Prepared devices keyed by claim UID
pub type PreparedClaims = BTreeMap<String, Vec<PreparedDevice>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checksum: u64,
    #[serde(default)]
    pub v1: CheckpointV1,
}

/// Version 1 of the checkpoint payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointV1 {
    #[serde(default)]
    pub prepared_claims: PreparedClaims,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainInfo>,
}

impl Checkpoint {
    /// Serializes the checkpoint and stamps the checksum on `self`.
    pub fn marshal(&mut self) -> Result<Vec<u8>, serde_json::Error> {
        self.checksum = 0;
        let unsummed = serde_json::to_vec(self)?;
        self.checksum = checksum(&unsummed);
        serde_json::to_vec(self)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Recomputes the checksum over the zero-checksum serialization.
    pub fn verify_checksum(&self) -> PluginResult<()> {
        let mut unsummed = self.clone();
        unsummed.checksum = 0;
        let data = serde_json::to_vec(&unsummed).change_context(PluginError::CheckpointIo {
            message: "failed to serialize checkpoint for verification".to_string(),
        })?;

        let computed = checksum(&data);
        if computed != self.checksum {
            return Err(Report::new(PluginError::ChecksumMismatch {
                stored: self.checksum,
                computed,
            }));
        }
        Ok(())
    }
}

/// Verifies `data` as written by [`Checkpoint::marshal`] against `stored`.
fn verify_stored(data: &[u8], stored: u64) -> PluginResult<()> {
    let prefix = [CHECKSUM_PREFIX, stored.to_string().as_bytes()].concat();
    let Some(rest) = data.strip_prefix(prefix.as_slice()) else {
        return Err(Report::new(PluginError::ChecksumMismatch {
            stored,
            computed: checksum(data),
        })
        .attach_printable("checkpoint does not start with its checksum"));
    };

    let unsummed = [CHECKSUM_PREFIX, b"0", rest].concat();
    let computed = checksum(&unsummed);
    if computed != stored {
        return Err(Report::new(PluginError::ChecksumMismatch { stored, computed }));
    }
    Ok(())
}

fn checksum(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// File backed store for a single named checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    file_name: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Loads and verifies the checkpoint, `None` if it was never written.
    ///
    /// # Errors
    ///
    /// - [`PluginError::CheckpointIo`] if the file cannot be read or parsed
    /// - [`PluginError::ChecksumMismatch`] if the content was corrupted
    pub fn load(&self) -> PluginResult<Option<Checkpoint>> {
        let path = self.path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e).change_context(PluginError::CheckpointIo {
                    message: format!("failed to read checkpoint {}", path.display()),
                }))
            }
        };

        let checkpoint =
            Checkpoint::unmarshal(&data).change_context(PluginError::CheckpointIo {
                message: format!("failed to parse checkpoint {}", path.display()),
            })?;
        verify_stored(&data, checkpoint.checksum)
            .attach_printable_lazy(|| format!("checkpoint file: {}", path.display()))?;

        Ok(Some(checkpoint))
    }

    /// Atomically replaces the stored checkpoint.
    ///
    /// The data goes to a temporary file in the same directory which is then
    /// renamed over the checkpoint, so readers see the old or the new record.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> PluginResult<()> {
        let path = self.path();
        let data = checkpoint
            .marshal()
            .change_context(PluginError::CheckpointIo {
                message: "failed to serialize checkpoint".to_string(),
            })?;

        write_atomic(&self.dir, &path, &data).change_context(PluginError::CheckpointIo {
            message: format!("failed to write checkpoint {}", path.display()),
        })?;

        debug!(
            path = %path.display(),
            checksum = checkpoint.checksum,
            prepared_claims = checkpoint.v1.prepared_claims.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    /// Returns the stored checkpoint, creating an empty one on first run.
    pub fn open_or_create(&self) -> PluginResult<Checkpoint> {
        fs::create_dir_all(&self.dir).change_context(PluginError::CheckpointIo {
            message: format!("failed to create plugin directory {}", self.dir.display()),
        })?;

        if let Some(checkpoint) = self.load()? {
            info!(
                path = %self.path().display(),
                prepared_claims = checkpoint.v1.prepared_claims.len(),
                domains = checkpoint.v1.domains.len(),
                "Loaded existing checkpoint"
            );
            return Ok(checkpoint);
        }

        let mut checkpoint = Checkpoint::default();
        self.save(&mut checkpoint)?;
        info!(path = %self.path().display(), "Created empty checkpoint");
        Ok(checkpoint)
    }
}

/// Writes `data` next to `path` and renames it into place.
pub(crate) fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use api_types::ContainerEdits;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn sample_checkpoint() -> Checkpoint {
        let mut checkpoint = Checkpoint::default();
        checkpoint.v1.prepared_claims.insert(
            "claim-1".to_string(),
            vec![PreparedDevice {
                device_name: "gpu-0".to_string(),
                pool_name: "node-a".to_string(),
                request_names: vec!["gpu".to_string()],
                cdi_device_ids: vec!["k8s.gpu.nvidia.com/gpu=claim-1-gpu-0".to_string()],
                container_edits: ContainerEdits::with_env(vec![
                    "GPU_DEVICE_gpu_0=gpu-0".to_string()
                ]),
            }],
        );
        checkpoint
    }

    #[test]
    fn checksum_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");

        let mut checkpoint = sample_checkpoint();
        store.save(&mut checkpoint).expect("save");
        assert_ne!(checkpoint.checksum, 0);

        let loaded = store.load().expect("load").expect("checkpoint exists");
        loaded.verify_checksum().expect("verify");
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn corrupted_payload_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");

        let mut checkpoint = sample_checkpoint();
        store.save(&mut checkpoint).expect("save");

        let raw = fs::read_to_string(store.path()).expect("read");
        let corrupted = raw.replace("gpu-0", "gpu-1");
        assert_ne!(raw, corrupted);
        fs::write(store.path(), corrupted).expect("write");

        let err = store.load().expect_err("corruption must be detected");
        assert!(matches!(
            err.current_context(),
            PluginError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn renamed_key_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");
        store.save(&mut Checkpoint::default()).expect("save");

        let raw = fs::read_to_string(store.path()).expect("read");
        let corrupted = raw.replace("\"domains\"", "\"domainz\"");
        assert_ne!(raw, corrupted);
        fs::write(store.path(), corrupted).expect("write");

        let err = store.load().expect_err("renamed key must be detected");
        assert!(matches!(
            err.current_context(),
            PluginError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn every_payload_byte_is_covered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");
        let mut checkpoint = sample_checkpoint();
        store.save(&mut checkpoint).expect("save");
        let raw = fs::read(store.path()).expect("read");

        let payload_start = CHECKSUM_PREFIX.len() + checkpoint.checksum.to_string().len();
        for index in payload_start..raw.len() {
            let mut corrupted = raw.clone();
            corrupted[index] ^= 0x01;
            fs::write(store.path(), &corrupted).expect("write");
            assert!(store.load().is_err(), "flipped byte {index} went unnoticed");
        }
    }

    #[test]
    fn modified_checksum_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");
        let mut checkpoint = sample_checkpoint();
        store.save(&mut checkpoint).expect("save");

        let raw = fs::read_to_string(store.path()).expect("read");
        let stored = checkpoint.checksum.to_string();
        let bumped = (checkpoint.checksum ^ 1).to_string();
        fs::write(store.path(), raw.replacen(&stored, &bumped, 1)).expect("write");

        let err = store.load().expect_err("checksum change must be detected");
        assert!(matches!(
            err.current_context(),
            PluginError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn in_memory_mutation_fails_verification() {
        let mut checkpoint = sample_checkpoint();
        checkpoint.marshal().expect("marshal");
        checkpoint.verify_checksum().expect("fresh checksum verifies");

        checkpoint.v1.prepared_claims.remove("claim-1");
        assert!(checkpoint.verify_checksum().is_err());
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn open_or_create_persists_empty_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("plugin"), "checkpoint.json");

        let created = store.open_or_create().expect("create");
        assert!(created.v1.prepared_claims.is_empty());
        assert!(store.path().exists());

        let reopened = store.open_or_create().expect("reopen");
        assert_eq!(reopened, created);
    }

    #[test]
    fn unparsable_checkpoint_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path(), "checkpoint.json");
        fs::write(store.path(), b"{invalid json}").expect("write");

        let err = store.load().expect_err("must fail");
        assert!(matches!(
            err.current_context(),
            PluginError::CheckpointIo { .. }
        ));
    }

    #[test]
    fn v1_object_is_always_present() {
        let mut checkpoint = Checkpoint::default();
        let data = checkpoint.marshal().expect("marshal");
        let value: serde_json::Value = serde_json::from_slice(&data).expect("json");
        assert!(value.get("v1").is_some());
        assert!(value.get("checksum").is_some());
    }
}
