use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::trace;

use super::id::LayerId;

/// Reference counts of layers in use. A layer is held while it has an entry.
#[derive(Debug, Default)]
pub struct Retainer {
    counts: RwLock<HashMap<String, i64>>,
}

impl Retainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, id: &LayerId) {
        let key = id.graph_id();
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        trace!(layer = %key, count = *count, "layer retained");
    }

    /// Drop one hold. The entry disappears once the count reaches zero.
    pub fn release(&self, id: &LayerId) {
        let key = id.graph_id();
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = counts.get_mut(&key) else {
            return;
        };
        *count -= 1;
        trace!(layer = %key, count = *count, "layer released");
        if *count <= 0 {
            counts.remove(&key);
        }
    }

    pub fn is_held(&self, id: &LayerId) -> bool {
        self.is_held_graph_id(&id.graph_id())
    }

    pub(crate) fn is_held_graph_id(&self, graph_id: &str) -> bool {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(graph_id)
    }
}
