//! Bridge name reservation.
//!
//! Containers on the same subnet share one bridge device. The manager maps
//! each subnet to a generated bridge name and tracks which containers hold
//! it; the device is torn down through a [`Destroyer`] when the last holder
//! releases it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, CommandSpec, Privilege};

use super::error::{BridgeError, BridgeResult};
use super::subnet::Ipv4Subnet;

/// Linux `IFNAMSIZ` minus the NUL terminator.
pub const BRIDGE_NAME_LEN: usize = 15;
/// Longest prefix kept in generated names.
const MAX_PREFIX_LEN: usize = 7;
const BRIDGE_MARKER: &str = "b-";
const SUFFIX_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Tears down a bridge device.
#[async_trait]
pub trait Destroyer: Send + Sync {
    async fn destroy(&self, bridge: &str) -> Result<(), CommandError>;
}

/// Deletes bridges with `ip link delete`.
pub struct IpLinkDestroyer {
    runner: Arc<dyn CommandRunner>,
    privilege: Privilege,
}

impl IpLinkDestroyer {
    pub fn new(runner: Arc<dyn CommandRunner>, privilege: Privilege) -> Self {
        Self { runner, privilege }
    }
}

#[async_trait]
impl Destroyer for IpLinkDestroyer {
    async fn destroy(&self, bridge: &str) -> Result<(), CommandError> {
        let spec = CommandSpec::new("ip")
            .args(["link", "delete", bridge])
            .privilege(self.privilege);
        self.runner.run(&spec).await.map(|_| ())
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    by_subnet: HashMap<Ipv4Subnet, String>,
    /// Bridge name to the containers holding it.
    owners: HashMap<String, HashSet<String>>,
}

impl BridgeState {
    fn forget(&mut self, bridge: &str) {
        self.owners.remove(bridge);
        self.by_subnet.retain(|_, name| name != bridge);
    }
}

/// Reference-counted subnet to bridge name mapping.
#[derive(Debug)]
pub struct BridgeManager {
    prefix: String,
    /// Next suffix value. Starts at a random offset so names differ across
    /// restarts.
    next: AtomicU64,
    state: Mutex<BridgeState>,
}

impl BridgeManager {
    /// `prefix` is truncated to keep generated names within
    /// [`BRIDGE_NAME_LEN`].
    pub fn new(prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        while prefix.len() > MAX_PREFIX_LEN {
            prefix.pop();
        }
        let (offset, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self::starting_at(prefix, offset)
    }

    fn starting_at(prefix: String, offset: u64) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(offset),
            state: Mutex::new(BridgeState::default()),
        }
    }

    fn generate_name(&self) -> String {
        let width = BRIDGE_NAME_LEN.saturating_sub(self.prefix.len() + BRIDGE_MARKER.len());
        let mut n = self.next.fetch_add(1, Ordering::Relaxed);
        let mut suffix = vec![b'0'; width];
        for slot in suffix.iter_mut().rev() {
            let digit = usize::try_from(n % 36).unwrap_or_default();
            *slot = SUFFIX_ALPHABET.get(digit).copied().unwrap_or(b'0');
            n /= 36;
        }
        format!(
            "{}{BRIDGE_MARKER}{}",
            self.prefix,
            String::from_utf8_lossy(&suffix)
        )
    }

    /// Bridge for `subnet`, creating a name if none is bound yet.
    pub async fn reserve(&self, subnet: Ipv4Subnet, container: &str) -> BridgeResult<String> {
        let mut state = self.state.lock().await;
        let name = match state.by_subnet.get(&subnet) {
            Some(name) => name.clone(),
            None => {
                // Names restored by rereserve may come from an earlier counter
                let name = loop {
                    let candidate = self.generate_name();
                    if !state.owners.contains_key(&candidate) {
                        break candidate;
                    }
                    debug!(bridge = %candidate, "generated bridge name already in use");
                };
                state.by_subnet.insert(subnet, name.clone());
                info!(bridge = %name, %subnet, "bridge name reserved");
                name
            }
        };
        state
            .owners
            .entry(name.clone())
            .or_default()
            .insert(container.to_string());
        debug!(bridge = %name, container, "bridge reference added");
        Ok(name)
    }

    /// Drop `container`'s hold on `bridge`, destroying it with the last one.
    ///
    /// An unknown bridge is handed to the destroyer as is, so stale devices
    /// found during recovery still get cleaned up.
    pub async fn release(
        &self,
        bridge: &str,
        container: &str,
        destroyer: &dyn Destroyer,
    ) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let Some(owners) = state.owners.get_mut(bridge) else {
            warn!(bridge, container, "releasing unknown bridge");
            return destroy(destroyer, bridge).await;
        };

        owners.remove(container);
        if !owners.is_empty() {
            debug!(bridge, container, remaining = owners.len(), "bridge reference dropped");
            return Ok(());
        }

        destroy(destroyer, bridge).await?;
        state.forget(bridge);
        info!(bridge, "bridge destroyed");
        Ok(())
    }

    /// Restore a persisted binding after a restart.
    pub async fn rereserve(
        &self,
        bridge: &str,
        subnet: Ipv4Subnet,
        container: &str,
    ) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        match state.by_subnet.get(&subnet) {
            Some(existing) if existing != bridge => {
                return Err(BridgeError::SubnetBound {
                    subnet,
                    bridge: existing.clone(),
                });
            }
            _ => {}
        }
        state.by_subnet.insert(subnet, bridge.to_string());
        state
            .owners
            .entry(bridge.to_string())
            .or_default()
            .insert(container.to_string());
        debug!(bridge, %subnet, container, "bridge re-reserved");
        Ok(())
    }
}

async fn destroy(destroyer: &dyn Destroyer, bridge: &str) -> BridgeResult<()> {
    destroyer
        .destroy(bridge)
        .await
        .map_err(|source| BridgeError::Destroy {
            bridge: bridge.to_string(),
            source,
        })
}
