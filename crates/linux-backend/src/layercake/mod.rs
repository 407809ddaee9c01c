//! Image layer retention and cleanup.

mod cleaner;
mod error;
mod id;
mod retainer;

pub use cleaner::{Cake, Layer, OvenCleaner};
pub use error::{LayerError, LayerResult};
pub use id::LayerId;
pub use retainer::Retainer;
