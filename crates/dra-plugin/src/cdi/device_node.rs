//! Per-domain channel device nodes.
//!
//! Every domain gets `<root>/<domainID>/channel-0`, a symlink to `/dev/null`
//! that is announced to the runtime as the null character device. The links
//! are created lazily and left in place so that repeated prepares and
//! restarts find them already there.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use api_types::ContainerEdits;
use api_types::DeviceNode;

pub const DEVICE_ROOT_DIR: &str = "nvcdi";

const HOST_DEVICE_TARGET: &str = "/dev/null";
const DEVICE_MODE: u32 = 0o660;
const NULL_DEVICE_MAJOR: i64 = 1;
const NULL_DEVICE_MINOR: i64 = 3;
const CHANNEL_NODE_NAME: &str = "channel-0";

/// A domain ID names a single directory below the device root.
pub fn is_valid_domain_id(domain_id: &str) -> bool {
    !domain_id.is_empty()
        && domain_id != "."
        && domain_id != ".."
        && !domain_id.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone)]
pub struct ChannelDeviceNodes {
    root: PathBuf,
}

impl ChannelDeviceNodes {
    /// `plugin_dir` is the per-driver kubelet plugin directory.
    pub fn new(plugin_dir: &Path) -> Self {
        Self {
            root: plugin_dir.join(DEVICE_ROOT_DIR),
        }
    }

    pub fn channel_path(&self, domain_id: &str) -> PathBuf {
        self.root.join(domain_id).join(CHANNEL_NODE_NAME)
    }

    /// Inverse of [`Self::channel_path`].
    pub fn domain_of(&self, channel_path: &str) -> Option<String> {
        let relative = Path::new(channel_path).strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let domain = components.next()?.as_os_str().to_str()?.to_string();
        if !is_valid_domain_id(&domain) {
            return None;
        }
        (components.next()?.as_os_str() == CHANNEL_NODE_NAME).then_some(domain)
    }

    /// Edits injecting the domain channel, independent of the filesystem.
    pub fn container_edits(&self, domain_id: &str) -> ContainerEdits {
        ContainerEdits {
            device_nodes: vec![DeviceNode {
                path: self.channel_path(domain_id).to_string_lossy().into_owned(),
                kind: Some("c".to_string()),
                major: Some(NULL_DEVICE_MAJOR),
                minor: Some(NULL_DEVICE_MINOR),
                file_mode: Some(DEVICE_MODE),
            }],
            ..Default::default()
        }
    }

    /// Creates the domain directory and channel link if missing.
    pub fn ensure(&self, domain_id: &str) -> io::Result<PathBuf> {
        let path = self.channel_path(domain_id);
        if let Some(domain_dir) = path.parent() {
            fs::create_dir_all(domain_dir)?;
        }
        ensure_symlink(&path, Path::new(HOST_DEVICE_TARGET))?;
        Ok(path)
    }
}

fn ensure_symlink(path: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() && fs::read_link(path)? == target {
                return Ok(());
            }
            fs::remove_file(path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(target, path)
}
