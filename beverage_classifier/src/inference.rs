use std::{fmt::Display, io::{BufRead, Write}, path::{Path, PathBuf}};

use burn::{data::dataloader::batcher::Batcher, tensor::{backend::Backend, Tensor}};
use tracing::info;

use crate::{artifact::{load_model, ProjectLayout}, data::{discover_classes, load_rgb, ImageBatcher, ImageItem}, error::{ClassifierError, Result}, model::Classifier};

pub struct LoadedClassifier<B: Backend> {
    pub model: Classifier<B>,
    /// Sorted class folder names of `dataset/train`.
    pub class_names: Vec<String>,
    pub image_size: usize,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub label: String,
    pub index: usize,
    pub confidence: f32,
    pub class_names: Vec<String>,
    /// Softmax output, aligned with `class_names`.
    pub probabilities: Vec<f32>,
}

impl Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\nPrediction Result")?;
        writeln!(f, "Predicted Class: {}", self.label)?;
        writeln!(f, "Confidence: {:.2}%", self.confidence * 100.0)?;
        write!(f, "\nClass probabilities:")?;
        for (class_name, probability) in self.class_names.iter().zip(&self.probabilities) {
            write!(f, "\n - {}: {:.2}%", class_name, probability * 100.0)?;
        }
        Ok(())
    }
}

/// Load the saved model and rebuild the class list from `dataset/train`.
pub fn load_model_and_classes<B: Backend>(layout: &ProjectLayout, device: &B::Device) -> Result<LoadedClassifier<B>> {
    let model_path = layout.model_path();
    if !model_path.exists() {
        return Err(ClassifierError::ModelNotFound(model_path));
    }
    let train_dir = layout.train_dir();
    if !train_dir.exists() {
        return Err(ClassifierError::DatasetNotFound(train_dir));
    }

    info!("Loading model...");
    let (model, metadata) = load_model::<B>(layout, device)?;

    info!("Loading class names...");
    let class_names = discover_classes(&train_dir)?;
    if class_names != metadata.class_names {
        return Err(ClassifierError::ClassMismatch { trained: metadata.class_names, found: class_names });
    }

    Ok(LoadedClassifier { model, class_names, image_size: metadata.image_size })
}

/// Decode, resize and normalise one image into a `[1, 3, size, size]` batch.
pub fn preprocess_image<B: Backend>(path: &Path, image_size: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
    let image = load_rgb(path, image_size)?;
    let item = ImageItem { pixels: image.into_raw(), label: 0 };

    let batcher = ImageBatcher::<B>::new(device.clone(), image_size);
    Ok(batcher.batch(vec![item]).images)
}

pub fn predict_image<B: Backend>(model: &Classifier<B>, class_names: &[String], input: Tensor<B, 4>) -> Prediction {
    let probabilities: Vec<f32> = model
        .forward_probabilities(input)
        .slice([0..1])
        .flatten::<1>(0, 1)
        .into_data()
        .convert()
        .value;

    let (index, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

    let label = class_names.get(index).cloned().unwrap_or_else(|| index.to_string());

    Prediction {
        label,
        index,
        confidence,
        class_names: class_names.to_vec(),
        probabilities,
    }
}

/// Interactive predictor: ask for an image path on `input`, classify it and
/// print the result on `output`. A path that does not exist is reported
/// before anything is loaded.
pub fn run<B: Backend, R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    layout: &ProjectLayout,
    device: &B::Device,
) -> Result<Option<Prediction>> {
    write!(output, "Enter image path to classify: ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let image_path = PathBuf::from(line.trim());

    if !image_path.exists() {
        writeln!(output, "Image path does not exist.")?;
        return Ok(None);
    }

    let loaded = load_model_and_classes::<B>(layout, device)?;
    let image = preprocess_image::<B>(&image_path, loaded.image_size, device)?;
    let prediction = predict_image(&loaded.model, &loaded.class_names, image);

    writeln!(output, "{}", prediction)?;
    Ok(Some(prediction))
}
