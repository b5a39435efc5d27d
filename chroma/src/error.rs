#[derive(Debug, thiserror::Error)]
pub enum ChromaError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("invalid chroma key config: {0}")]
    Config(String),
    #[error("failed to encode PNG: {0}")]
    Encode(#[source] image::ImageError),
}
