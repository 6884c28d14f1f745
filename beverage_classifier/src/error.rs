use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Model not found at: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Dataset folder not found at: {}", .0.display())]
    DatasetNotFound(PathBuf),

    /// The split has no class folders or no images inside them.
    #[error("Dataset folder is empty: {}", .0.display())]
    EmptyDataset(PathBuf),

    #[error("Backbone weights not found at: {}", .0.display())]
    BackboneWeightsNotFound(PathBuf),

    #[error("Failed to load image at '{}': {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk dataset folder: {0}")]
    Walk(#[from] walkdir::Error),

    /// Reading or writing a burn record failed.
    #[error("Record error: {0}")]
    Record(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model was trained on classes {trained:?} but the dataset has {found:?}")]
    ClassMismatch {
        trained: Vec<String>,
        found: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
