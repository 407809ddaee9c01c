use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies a layer in the graph store.
///
/// Only image layers carry their id verbatim; every other kind is hashed so
/// ids stay fixed-length and filesystem safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerId {
    DockerImage { id: String },
    Container { handle: String },
    /// A rootfs directory on the host, versioned by its modification time.
    Local { path: PathBuf, modified: i64 },
    /// Another layer translated into a user namespace mapping.
    Namespaced {
        inner: Box<LayerId>,
        namespace: String,
    },
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

impl LayerId {
    pub fn docker_image(id: impl Into<String>) -> Self {
        Self::DockerImage { id: id.into() }
    }

    pub fn container(handle: impl Into<String>) -> Self {
        Self::Container {
            handle: handle.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>, modified: i64) -> Self {
        Self::Local {
            path: path.into(),
            modified,
        }
    }

    pub fn namespaced(inner: LayerId, namespace: impl Into<String>) -> Self {
        Self::Namespaced {
            inner: Box::new(inner),
            namespace: namespace.into(),
        }
    }

    /// Key used by the graph store and for retention.
    pub fn graph_id(&self) -> String {
        match self {
            Self::DockerImage { id } => id.clone(),
            Self::Container { handle } => sha256_hex(handle),
            Self::Local { path, modified } => {
                sha256_hex(&format!("{}-{modified}", path.display()))
            }
            Self::Namespaced { inner, namespace } => {
                sha256_hex(&format!("{}@{namespace}", inner.graph_id()))
            }
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.graph_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_image_id_is_verbatim() {
        assert_eq!(LayerId::docker_image("abc123").graph_id(), "abc123");
    }

    #[test]
    fn container_id_is_hashed_handle() {
        let id = LayerId::container("my-handle").graph_id();
        assert_eq!(id.len(), 64);
        assert_eq!(id, sha256_hex("my-handle"));
        assert_ne!(id, LayerId::container("other").graph_id());
    }

    #[test]
    fn local_id_depends_on_modification_time() {
        let a = LayerId::local("/var/rootfs", 1).graph_id();
        let b = LayerId::local("/var/rootfs", 2).graph_id();
        assert_ne!(a, b);
        assert_eq!(a, sha256_hex("/var/rootfs-1"));
    }

    #[test]
    fn namespaced_id_wraps_inner_graph_id() {
        let inner = LayerId::docker_image("abc");
        let id = LayerId::namespaced(inner.clone(), "0-4294967294-1").graph_id();
        assert_eq!(id, sha256_hex("abc@0-4294967294-1"));
        assert_ne!(id, inner.graph_id());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let id = LayerId::namespaced(LayerId::docker_image("abc"), "ns");
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("\"kind\":\"namespaced\""), "{json}");
        let back: LayerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
