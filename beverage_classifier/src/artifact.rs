use std::path::PathBuf;

use burn::{config::Config, module::Module, record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder}, tensor::backend::Backend};
use tracing::{debug, info};

use crate::{data::IMAGE_SIZE, error::ClassifierError, model::{Classifier, ClassifierConfig}};

pub const MODEL_NAME: &str = "beverage_classifier";
pub const BACKBONE_WEIGHTS: &str = "mobilenet_v2.pth";

/// Full precision so a reloaded model predicts exactly what was saved.
pub type ArtifactRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Where the trainer and the predictor expect things below the project root:
///
/// ```text
/// <root>/dataset/train/<class>/*
/// <root>/dataset/val/<class>/*
/// <root>/models/beverage_classifier.{mpk,json}
/// ```
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn train_dir(&self) -> PathBuf {
        self.root.join("dataset").join("train")
    }

    pub fn val_dir(&self) -> PathBuf {
        self.root.join("dataset").join("val")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    /// Model path without extension, as the recorder wants it.
    fn model_stem(&self) -> PathBuf {
        self.models_dir().join(MODEL_NAME)
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_stem().with_extension("mpk")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.model_stem().with_extension("json")
    }

    pub fn backbone_weights(&self) -> PathBuf {
        self.models_dir().join(BACKBONE_WEIGHTS)
    }

    /// Scratch directory for the learner's per-epoch metric logs.
    pub fn training_dir(&self) -> PathBuf {
        self.models_dir().join("training")
    }
}

/// Stored next to the weights so the predictor can rebuild the network and
/// check the class order it was trained with.
#[derive(Config, Debug)]
pub struct ArtifactMetadata {
    pub model: ClassifierConfig,
    pub class_names: Vec<String>,
    #[config(default = 224)]
    pub image_size: usize,
}

/// Write weights and metadata, replacing any previous artifact.
pub fn save_model<B: Backend>(layout: &ProjectLayout, model: Classifier<B>, metadata: &ArtifactMetadata) -> crate::error::Result<PathBuf> {
    std::fs::create_dir_all(layout.models_dir())?;

    metadata.save(layout.metadata_path())?;
    model
        .save_file(layout.model_stem(), &ArtifactRecorder::new())
        .map_err(|e| ClassifierError::Record(format!("{:?}", e)))?;

    let model_path = layout.model_path();
    info!("Model saved at {:?}", model_path);
    Ok(model_path)
}

pub fn load_model<B: Backend>(layout: &ProjectLayout, device: &B::Device) -> crate::error::Result<(Classifier<B>, ArtifactMetadata)> {
    let model_path = layout.model_path();
    if !model_path.exists() {
        return Err(ClassifierError::ModelNotFound(model_path));
    }
    let metadata_path = layout.metadata_path();
    if !metadata_path.exists() {
        return Err(ClassifierError::ModelNotFound(metadata_path));
    }

    let metadata = ArtifactMetadata::load(&metadata_path)
        .map_err(|e| ClassifierError::Config(format!("{:?}", e)))?;
    debug!("Artifact metadata: {:?}", metadata);

    let record = ArtifactRecorder::new()
        .load(layout.model_stem(), device)
        .map_err(|e| ClassifierError::Record(format!("{:?}", e)))?;
    let model = metadata.model.init::<B>(device).load_record(record);

    Ok((model, metadata))
}

impl ArtifactMetadata {
    pub fn for_classes(class_names: Vec<String>) -> Self {
        Self::new(ClassifierConfig::new(class_names.len()), class_names).with_image_size(IMAGE_SIZE)
    }
}
