use std::{path::PathBuf, sync::Arc};

use burn::{config::Config, data::{dataloader::{DataLoader, DataLoaderBuilder}, dataset::Dataset}, module::AutodiffModule, optim::AdamConfig, tensor::backend::{AutodiffBackend, Backend}, train::{metric::{AccuracyMetric, LossMetric}, LearnerBuilder}};
use tracing::info;

use crate::{artifact::{ArtifactMetadata, ProjectLayout}, data::{ImageBatch, ImageBatcher, ImageFolderDataset}, error::ClassifierError, metric::{macro_scores, BatchF1Metric, MacroScores}, model::{Classifier, ClassifierConfig}, renderer::LogRenderer};

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 64)]
    pub hidden_size: usize,
}

impl TrainingConfig {
    /// Adam with the usual 0.9 / 0.999 / 1e-7 settings.
    pub fn with_default_optimizer() -> Self {
        Self::new(AdamConfig::new().with_epsilon(1e-7))
    }
}

/// How the backbone weights are initialised before training.
#[derive(Debug, Clone)]
pub enum BackboneInit {
    /// torchvision `mobilenet_v2` ImageNet state dict.
    ImageNet(PathBuf),
    Random,
}

pub struct TrainedClassifier<B: Backend> {
    pub model: Classifier<B>,
    pub metadata: ArtifactMetadata,
    pub scores: MacroScores,
}

/// Argmax predictions over the whole loader, scored against its targets.
pub fn evaluate<B: Backend>(model: &Classifier<B>, dataloader: Arc<dyn DataLoader<ImageBatch<B>>>) -> MacroScores {
    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();

    for batch in dataloader.iter() {
        let predicted = model.forward(batch.images).argmax(1).flatten::<1>(0, 1);

        let predicted: Vec<i64> = predicted.into_data().convert().value;
        let targets: Vec<i64> = batch.targets.into_data().convert().value;
        y_pred.extend(predicted.into_iter().map(|label| label as usize));
        y_true.extend(targets.into_iter().map(|label| label as usize));
    }

    macro_scores(&y_true, &y_pred)
}

/// Decode `dataset/train` and `dataset/val`. Both splits must hold the same
/// classes or labels would mean different things on each side.
pub fn load_splits(layout: &ProjectLayout, image_size: usize) -> crate::error::Result<(ImageFolderDataset, ImageFolderDataset)> {
    let dataset_train = ImageFolderDataset::new(layout.train_dir(), image_size)?;
    let dataset_valid = ImageFolderDataset::new(layout.val_dir(), image_size)?;
    if dataset_train.class_names() != dataset_valid.class_names() {
        return Err(ClassifierError::ClassMismatch {
            trained: dataset_train.class_names().to_vec(),
            found: dataset_valid.class_names().to_vec(),
        });
    }

    info!("Train Dataset Size: {}", dataset_train.len());
    info!("Valid Dataset Size: {}", dataset_valid.len());

    Ok((dataset_train, dataset_valid))
}

/// Fit the classification head on `dataset/train`, validating on
/// `dataset/val` after every epoch, then score the validation split once
/// more. Nothing is written to `models/` except the learner's metric logs.
pub fn train<B: AutodiffBackend>(
    layout: &ProjectLayout,
    config: &TrainingConfig,
    backbone: BackboneInit,
    device: B::Device,
) -> crate::error::Result<TrainedClassifier<B::InnerBackend>> {
    let training_dir = layout.training_dir();
    std::fs::create_dir_all(&training_dir)?;
    config.save(training_dir.join("config.json"))?;

    B::seed(config.seed);

    let (dataset_train, dataset_valid) = load_splits(layout, config.image_size)?;

    let model_config = ClassifierConfig::new(dataset_train.class_names().len()).with_hidden_size(config.hidden_size);
    let model = match backbone {
        BackboneInit::ImageNet(weights) => model_config.init_pretrained::<B>(&weights, &device)?,
        BackboneInit::Random => model_config.init::<B>(&device),
    };

    Ok(fit(layout, config, model, dataset_train, dataset_valid, device))
}

/// Run the learner over an assembled classifier. Only the head receives
/// gradients; the backbone comes back unchanged.
pub fn fit<B: AutodiffBackend>(
    layout: &ProjectLayout,
    config: &TrainingConfig,
    model: Classifier<B>,
    dataset_train: ImageFolderDataset,
    dataset_valid: ImageFolderDataset,
    device: B::Device,
) -> TrainedClassifier<B::InnerBackend> {
    let class_names = dataset_train.class_names().to_vec();
    let model_config = ClassifierConfig::new(model.num_classes()).with_hidden_size(config.hidden_size);

    let batcher_train = ImageBatcher::<B>::new(device.clone(), config.image_size);
    let batcher_valid = ImageBatcher::<B::InnerBackend>::new(device.clone(), config.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let learner = LearnerBuilder::new(&layout.training_dir().to_string_lossy())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(BatchF1Metric::new())
        .metric_valid_numeric(BatchF1Metric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .renderer(LogRenderer::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid.clone()).valid();

    let scores = evaluate(&model_trained, dataloader_valid);
    info!("Validation macro scores: {:?}", scores);

    let metadata = ArtifactMetadata::new(model_config, class_names).with_image_size(config.image_size);

    TrainedClassifier { model: model_trained, metadata, scores }
}
