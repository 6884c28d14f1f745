use std::path::Path;

use burn::{module::Module, nn::{conv::{Conv2d, Conv2dConfig}, BatchNorm, BatchNormConfig, PaddingConfig2d}, record::{FullPrecisionSettings, Recorder}, tensor::{activation::relu, backend::Backend, Tensor}};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::info;

use crate::error::{ClassifierError, Result};

pub const STEM_CHANNELS: usize = 32;
pub const FEATURE_CHANNELS: usize = 1280;

// (expansion, output channels, repeats, first stride)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    relu(x).clamp_max(6.0)
}

#[derive(Module, Debug)]
pub struct ConvNormActivation<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNormActivation<B> {
    fn new(channels: [usize; 2], kernel: usize, stride: usize, groups: usize, device: &B::Device) -> Self {
        let padding = (kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        relu6(x)
    }
}

/// Expand (1x1) -> depthwise (3x3) -> linear projection (1x1).
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNormActivation<B>>,
    depthwise: ConvNormActivation<B>,
    project: Conv2d<B>,
    project_norm: BatchNorm<B, 2>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, expansion: usize, device: &B::Device) -> Self {
        let hidden = in_channels * expansion;
        let expand = if expansion == 1 {
            None
        } else {
            Some(ConvNormActivation::new([in_channels, hidden], 1, 1, 1, device))
        };

        Self {
            expand,
            depthwise: ConvNormActivation::new([hidden, hidden], 3, stride, hidden, device),
            project: Conv2dConfig::new([hidden, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project_norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);
        let x = self.project_norm.forward(x);

        // Shapes only match when stride is 1 and channels are unchanged.
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2 feature extractor without the ImageNet classification head.
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNormActivation<B>,
    blocks: Vec<InvertedResidual<B>>,
    head: ConvNormActivation<B>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn new(device: &B::Device) -> Self {
        let stem = ConvNormActivation::new([3, STEM_CHANNELS], 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;
        for (expansion, out_channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(in_channels, out_channels, stride, expansion, device));
                in_channels = out_channels;
            }
        }

        let head = ConvNormActivation::new([in_channels, FEATURE_CHANNELS], 1, 1, 1, device);

        Self { stem, blocks, head }
    }

    /// Load ImageNet weights from a torchvision `mobilenet_v2` state dict.
    pub fn pretrained(weights: &Path, device: &B::Device) -> Result<Self> {
        if !weights.exists() {
            return Err(ClassifierError::BackboneWeightsNotFound(weights.to_path_buf()));
        }
        info!("Loading backbone weights from {:?}", weights);

        let args = torchvision_key_remaps()
            .iter()
            .fold(LoadArgs::new(weights.to_path_buf()), |args, (pattern, replacement)| {
                args.with_key_remap(pattern, replacement)
            });
        let record: MobileNetV2Record<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| ClassifierError::Record(format!("{:?}", e)))?;

        Ok(Self::new(device).load_record(record))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    // N = (W - 1) / 32 + 1
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(images);
        for block in self.blocks.iter() {
            x = block.forward(x);
        }
        self.head.forward(x)
    }
}

/// Regex remaps from torchvision `features.<n>` keys onto this module tree,
/// applied in order. 0 is the stem, 1..=17 the inverted residual blocks and
/// 18 the last 1x1 convolution. Block 0 has no expansion layer, so its
/// torchvision indices are shifted by one.
pub fn torchvision_key_remaps() -> Vec<(String, String)> {
    let mut remaps: Vec<(String, String)> = [
        (r"^features\.0\.0\.(.+)$", "stem.conv.$1"),
        (r"^features\.0\.1\.(.+)$", "stem.norm.$1"),
        (r"^features\.18\.0\.(.+)$", "head.conv.$1"),
        (r"^features\.18\.1\.(.+)$", "head.norm.$1"),
        (r"^features\.1\.conv\.0\.0\.(.+)$", "blocks.0.depthwise.conv.$1"),
        (r"^features\.1\.conv\.0\.1\.(.+)$", "blocks.0.depthwise.norm.$1"),
        (r"^features\.1\.conv\.1\.(.+)$", "blocks.0.project.$1"),
        (r"^features\.1\.conv\.2\.(.+)$", "blocks.0.project_norm.$1"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (pattern.to_string(), replacement.to_string()))
    .collect();

    let layers = [
        (r"conv\.0\.0", "expand.conv"),
        (r"conv\.0\.1", "expand.norm"),
        (r"conv\.1\.0", "depthwise.conv"),
        (r"conv\.1\.1", "depthwise.norm"),
        (r"conv\.2", "project"),
        (r"conv\.3", "project_norm"),
    ];
    for layer in 2..18 {
        let block = layer - 1;
        for (from, to) in layers {
            remaps.push((
                format!(r"^features\.{layer}\.{from}\.(.+)$"),
                format!("blocks.{block}.{to}.$1"),
            ));
        }
    }

    remaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, record::Record};
    use regex::Regex;
    use serde_json::Value;
    use std::collections::BTreeSet;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_block_layout() {
        let device = Default::default();
        let backbone = MobileNetV2::<TestBackend>::new(&device);

        assert_eq!(backbone.num_blocks(), 17);
        assert!(backbone.blocks[0].expand.is_none());
        assert!(backbone.blocks[1].expand.is_some());
    }

    #[test]
    fn test_forward_downsamples_by_32() {
        let device = Default::default();
        let backbone = MobileNetV2::<TestBackend>::new(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        let features = backbone.forward(images);

        assert_eq!(features.dims(), [2, FEATURE_CHANNELS, 2, 2]);
    }

    #[test]
    fn test_missing_weights() {
        let device = Default::default();
        let path = Path::new("does/not/exist/mobilenet_v2.pth");

        match MobileNetV2::<TestBackend>::pretrained(path, &device) {
            Err(ClassifierError::BackboneWeightsNotFound(missing)) => assert_eq!(missing, path),
            other => panic!("unexpected result: {:?}", other.map(|m| m.num_blocks())),
        }
    }

    /// State dict keys of torchvision's `mobilenet_v2().features`.
    fn torchvision_feature_keys() -> Vec<String> {
        let norm = |prefix: String| {
            ["weight", "bias", "running_mean", "running_var", "num_batches_tracked"]
                .map(|name| format!("{}.{}", prefix, name))
        };

        let mut keys = vec!["features.0.0.weight".to_string()];
        keys.extend(norm("features.0.1".to_string()));

        keys.push("features.1.conv.0.0.weight".to_string());
        keys.extend(norm("features.1.conv.0.1".to_string()));
        keys.push("features.1.conv.1.weight".to_string());
        keys.extend(norm("features.1.conv.2".to_string()));

        for layer in 2..18 {
            for conv in ["conv.0.0", "conv.1.0", "conv.2"] {
                keys.push(format!("features.{}.{}.weight", layer, conv));
            }
            for bn in ["conv.0.1", "conv.1.1", "conv.3"] {
                keys.extend(norm(format!("features.{}.{}", layer, bn)));
            }
        }

        keys.push("features.18.0.weight".to_string());
        keys.extend(norm("features.18.1".to_string()));
        keys
    }

    fn param_paths(value: &Value, path: &str, paths: &mut Vec<String>) {
        let child = |name: &str| if path.is_empty() { name.to_string() } else { format!("{}.{}", path, name) };
        match value {
            Value::Object(fields) if fields.contains_key("param") => paths.push(path.to_string()),
            Value::Object(fields) => {
                for (name, field) in fields {
                    param_paths(field, &child(name), paths);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    param_paths(item, &child(&i.to_string()), paths);
                }
            }
            _ => {}
        }
    }

    fn parent(path: &str) -> String {
        path.rsplit_once('.').map(|(parent, _)| parent.to_string()).unwrap_or_default()
    }

    #[test]
    fn test_torchvision_keys_cover_every_layer() {
        let remaps: Vec<(Regex, String)> = torchvision_key_remaps()
            .into_iter()
            .map(|(pattern, replacement)| (Regex::new(&pattern).unwrap(), replacement))
            .collect();

        let remapped: Vec<String> = torchvision_feature_keys()
            .into_iter()
            .map(|key| {
                remaps.iter().fold(key, |key, (pattern, replacement)| {
                    pattern.replace_all(&key, replacement.as_str()).into_owned()
                })
            })
            .collect();
        assert!(remapped.iter().all(|key| !key.starts_with("features")), "{:?}", remapped);

        let backbone = MobileNetV2::<TestBackend>::new(&Default::default());
        let item = backbone.into_record().into_item::<FullPrecisionSettings>();
        let mut paths = Vec::new();
        param_paths(&serde_json::to_value(item).unwrap(), "", &mut paths);

        // Batch norm parameters are renamed (weight -> gamma) by the recorder,
        // so layers are compared rather than leaf names.
        let torchvision_layers: BTreeSet<String> = remapped.iter().map(|key| parent(key)).collect();
        let module_layers: BTreeSet<String> = paths.iter().map(|path| parent(path)).collect();
        assert_eq!(torchvision_layers, module_layers);

        assert!(module_layers.contains("blocks.0.depthwise.conv"));
        assert!(!module_layers.contains("blocks.0.expand.conv"));
        assert!(module_layers.contains("blocks.16.expand.norm"));
        // stem, head, 3 layers in block 0 and 6 in each of the other 16
        assert_eq!(module_layers.len(), 2 * 2 + 4 + 6 * 16);
    }
}
