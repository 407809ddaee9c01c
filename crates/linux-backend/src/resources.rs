//! Per-container network and layer resources.
//!
//! Acquiring resources for a new container allocates a subnet, reserves the
//! subnet's bridge and retains the rootfs layer. Releasing undoes all three.
//! The acquired set is persisted with the container so it can be restored
//! after the backend restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::layercake::{LayerId, Retainer};
use crate::network::{
    BridgeError, BridgeManager, Destroyer, Ipv4Subnet, SubnetError, SubnetPool,
};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error(transparent)]
    Subnet(#[from] SubnetError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("invalid resource record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// What a new container asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    /// A specific subnet, or `None` for the next free one.
    pub subnet: Option<Ipv4Subnet>,
    /// Image layer the rootfs is built from.
    pub rootfs: Option<LayerId>,
}

/// Resources held by one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub handle: String,
    pub subnet: Ipv4Subnet,
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<LayerId>,
}

impl ContainerResources {
    pub fn to_json(&self) -> ResourceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ResourceResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Shared allocators every container draws from.
pub struct ResourcePool {
    subnets: Arc<SubnetPool>,
    bridges: Arc<BridgeManager>,
    retainer: Arc<Retainer>,
}

impl ResourcePool {
    pub fn new(
        subnets: Arc<SubnetPool>,
        bridges: Arc<BridgeManager>,
        retainer: Arc<Retainer>,
    ) -> Self {
        Self {
            subnets,
            bridges,
            retainer,
        }
    }

    pub fn subnets(&self) -> &SubnetPool {
        &self.subnets
    }

    /// Allocate everything `handle` needs. Nothing stays allocated on failure.
    pub async fn acquire(
        &self,
        handle: &str,
        request: ResourceRequest,
    ) -> ResourceResult<ContainerResources> {
        let subnet = match request.subnet {
            Some(subnet) => {
                self.subnets.allocate_statically(subnet)?;
                subnet
            }
            None => self.subnets.allocate_dynamically()?,
        };

        let bridge = match self.bridges.reserve(subnet, handle).await {
            Ok(bridge) => bridge,
            Err(e) => {
                if let Err(release) = self.subnets.release(subnet) {
                    warn!(%subnet, error = %release, "failed to roll back subnet");
                }
                return Err(e.into());
            }
        };

        if let Some(rootfs) = &request.rootfs {
            self.retainer.retain(rootfs);
        }

        info!(handle, %subnet, bridge = %bridge, "container resources acquired");
        Ok(ContainerResources {
            handle: handle.to_string(),
            subnet,
            bridge,
            rootfs: request.rootfs,
        })
    }

    /// Give back everything in `resources`.
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn release(
        &self,
        resources: &ContainerResources,
        destroyer: &dyn Destroyer,
    ) -> ResourceResult<()> {
        let bridge = self
            .bridges
            .release(&resources.bridge, &resources.handle, destroyer)
            .await;
        if let Err(e) = &bridge {
            warn!(handle = %resources.handle, error = %e, "failed to release bridge");
        }

        let subnet = self.subnets.release(resources.subnet);
        if let Err(e) = &subnet {
            warn!(handle = %resources.handle, error = %e, "failed to release subnet");
        }

        if let Some(rootfs) = &resources.rootfs {
            self.retainer.release(rootfs);
        }

        bridge?;
        subnet?;
        info!(handle = %resources.handle, "container resources released");
        Ok(())
    }

    /// Re-register resources persisted before a restart.
    pub async fn restore(&self, resources: &ContainerResources) -> ResourceResult<()> {
        self.subnets.recover(resources.subnet)?;
        if let Err(e) = self
            .bridges
            .rereserve(&resources.bridge, resources.subnet, &resources.handle)
            .await
        {
            if let Err(release) = self.subnets.release(resources.subnet) {
                warn!(subnet = %resources.subnet, error = %release, "failed to roll back recovered subnet");
            }
            return Err(e.into());
        }
        if let Some(rootfs) = &resources.rootfs {
            self.retainer.retain(rootfs);
        }
        info!(handle = %resources.handle, subnet = %resources.subnet, "container resources restored");
        Ok(())
    }
}
