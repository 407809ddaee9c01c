use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::LayerResult;
use super::id::LayerId;
use super::retainer::Retainer;

/// Metadata the graph store keeps per layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub id: String,
    pub parent: Option<String>,
}

/// The backing layer store, addressed by graph id.
#[async_trait]
pub trait Cake: Send + Sync {
    async fn get(&self, id: &str) -> LayerResult<Layer>;

    async fn remove(&self, id: &str) -> LayerResult<()>;

    /// Whether no other layer names `id` as its parent.
    async fn is_leaf(&self, id: &str) -> LayerResult<bool>;
}

/// Removes unheld layers, cascading up to parents that become leaves.
pub struct OvenCleaner {
    cake: Arc<dyn Cake>,
    retainer: Arc<Retainer>,
    enable_image_cleanup: bool,
}

impl OvenCleaner {
    pub fn new(cake: Arc<dyn Cake>, retainer: Arc<Retainer>, enable_image_cleanup: bool) -> Self {
        Self {
            cake,
            retainer,
            enable_image_cleanup,
        }
    }

    /// Remove `id` unless it is held.
    ///
    /// With image cleanup on, each removed layer's parent is removed next if
    /// nothing else builds on it. A store removal failure stops the cascade;
    /// layers already removed stay removed.
    pub async fn remove(&self, id: &LayerId) -> LayerResult<()> {
        let mut next = Some(id.graph_id());
        while let Some(current) = next.take() {
            if self.retainer.is_held_graph_id(&current) {
                debug!(layer = %current, "layer is held, not removing");
                return Ok(());
            }

            let parent = match self.cake.get(&current).await {
                Ok(layer) => layer.parent,
                Err(e) => {
                    warn!(layer = %current, error = %e, "layer lookup failed, removing without parent");
                    None
                }
            };

            self.cake.remove(&current).await?;
            info!(layer = %current, "layer removed");

            if !self.enable_image_cleanup {
                return Ok(());
            }
            let Some(parent) = parent else {
                return Ok(());
            };
            match self.cake.is_leaf(&parent).await {
                Ok(true) => next = Some(parent),
                Ok(false) => debug!(layer = %parent, "parent still has children"),
                Err(e) => warn!(layer = %parent, error = %e, "parent leaf check failed"),
            }
        }
        Ok(())
    }
}
