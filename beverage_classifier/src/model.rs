use std::path::Path;

use burn::{config::Config, module::{AutodiffModule, Module}, nn::{loss::CrossEntropyLossConfig, pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig}, Linear, LinearConfig, ReLU}, tensor::{activation::softmax, backend::{AutodiffBackend, Backend}, Int, Tensor}, train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep}};

use crate::{data::ImageBatch, mobilenet::{MobileNetV2, FEATURE_CHANNELS}};

/// Frozen MobileNetV2 features followed by a small trainable head.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    backbone: MobileNetV2<B>,
    pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    activation: ReLU,
    output: Linear<B>,
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub num_classes: usize,
    #[config(default = 64)]
    pub hidden_size: usize,
}

impl ClassifierConfig {
    /// Randomly initialised backbone. Used when restoring a saved record.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        self.init_with_backbone(MobileNetV2::new(device), device)
    }

    /// Backbone initialised from ImageNet weights.
    pub fn init_pretrained<B: Backend>(&self, weights: &Path, device: &B::Device) -> crate::error::Result<Classifier<B>> {
        let backbone = MobileNetV2::pretrained(weights, device)?;
        Ok(self.init_with_backbone(backbone, device))
    }

    fn init_with_backbone<B: Backend>(&self, backbone: MobileNetV2<B>, device: &B::Device) -> Classifier<B> {
        Classifier {
            backbone: backbone.no_grad(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(FEATURE_CHANNELS, self.hidden_size).init(device),
            activation: ReLU::new(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> Classifier<B> {
    /// Width of the output layer.
    pub fn num_classes(&self) -> usize {
        self.output.weight.val().dims()[1]
    }

    /// Unnormalised class scores, [batch, num_classes].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.forward_head(features)
    }

    /// Softmax over the class scores. Each row sums to one.
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    fn forward_head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        // global average pooling 1280x1x1
        let x = self.pool.forward(features).reshape([batch_size, channels]);

        // fc 64
        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);

        // fc num_classes
        self.output.forward(x)
    }

    fn classification_output(&self, output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let loss = CrossEntropyLossConfig::new().init(&output.device()).forward(output.clone(), targets.clone());
        ClassificationOutput { loss, output, targets }
    }

    pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let output = self.forward(images);
        self.classification_output(output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        // The backbone runs outside the autodiff graph so batch norm keeps its
        // running statistics and no gradient reaches the frozen weights.
        let features = self.backbone.valid().forward(batch.images.inner());
        let output = self.forward_head(Tensor::from_inner(features));
        let item = self.classification_output(output, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
