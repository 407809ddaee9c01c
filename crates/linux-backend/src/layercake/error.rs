#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("layer {0} not found")]
    NotFound(String),

    #[error("failed to remove layer {id}: {detail}")]
    Remove { id: String, detail: String },

    #[error("failed to look up layer {id}: {detail}")]
    Lookup { id: String, detail: String },
}

pub type LayerResult<T> = std::result::Result<T, LayerError>;
