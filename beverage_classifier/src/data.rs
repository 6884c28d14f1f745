use std::path::{Path, PathBuf};

use burn::{data::{dataloader::batcher::Batcher, dataset::Dataset}, tensor::{backend::Backend, Data, Int, Shape, Tensor}};
use derive_new::new;
use image::{imageops::FilterType, io::Reader as ImageReader, RgbImage};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{ClassifierError, Result};

pub const IMAGE_SIZE: usize = 224;
pub const CHANNELS: usize = 3;

const IMAGE_EXTENSIONS: [&str; 5] = ["bmp", "gif", "jpeg", "jpg", "png"];

/// ImageNet statistics (RGB) the torchvision MobileNetV2 weights expect.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Sorted names of the class folders directly below `dir`.
pub fn discover_classes(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(ClassifierError::DatasetNotFound(dir.to_path_buf()));
    }

    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                class_names.push(name.to_string_lossy().into_owned());
            }
        }
    }
    class_names.sort();

    Ok(class_names)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Decode an image file and resize it to `image_size`x`image_size` RGB.
pub fn load_rgb(path: &Path, image_size: usize) -> Result<RgbImage> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| ClassifierError::Image { path: path.to_path_buf(), source })?;

    let size = image_size as u32;
    let image = if image.width() != size || image.height() != size {
        image.resize_exact(size, size, FilterType::Triangle)
    } else {
        image
    };

    Ok(image.to_rgb8())
}

/// Interleaved HWC bytes to planar CHW floats, standardised with the ImageNet
/// mean and std. Shared by the batcher and single-image preprocessing.
pub fn normalize(pixels: &[u8], image_size: usize) -> Vec<f32> {
    let plane = image_size * image_size;
    debug_assert_eq!(pixels.len(), plane * CHANNELS);

    let mut values = vec![0f32; plane * CHANNELS];
    for (i, rgb) in pixels.chunks_exact(CHANNELS).enumerate() {
        for (c, value) in rgb.iter().enumerate() {
            values[c * plane + i] = (*value as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    values
}

#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Resized RGB bytes in HWC order.
    pub pixels: Vec<u8>,
    pub label: usize,
}

/// One split of a `<split>/<class>/<image>` folder tree, decoded in memory.
/// Labels follow the alphabetical order of the class folders.
#[derive(Debug)]
pub struct ImageFolderDataset {
    items: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl ImageFolderDataset {
    pub fn new<P: AsRef<Path>>(root: P, image_size: usize) -> Result<Self> {
        let root = root.as_ref();
        let class_names = discover_classes(root)?;
        if class_names.is_empty() {
            return Err(ClassifierError::EmptyDataset(root.to_path_buf()));
        }

        let mut files: Vec<(PathBuf, usize)> = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            for entry in WalkDir::new(root.join(class_name)).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && is_image(entry.path()) {
                    files.push((entry.into_path(), label));
                }
            }
        }
        if files.is_empty() {
            return Err(ClassifierError::EmptyDataset(root.to_path_buf()));
        }

        info!("Found {} files belonging to {} classes in {:?}", files.len(), class_names.len(), root);
        debug!("Classes: {:?}", class_names);

        let items = files
            .into_par_iter()
            .map(|(path, label)| {
                let image = load_rgb(&path, image_size)?;
                Ok(ImageItem { pixels: image.into_raw(), label })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { items, class_names })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

#[derive(new)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch, 3, height, width]
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut values = Vec::with_capacity(batch_size * CHANNELS * size * size);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items.iter() {
            values.extend(normalize(&item.pixels, size));
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_data(
            Data::new(values, Shape::new([batch_size, CHANNELS, size, size])).convert(),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            Data::new(labels, Shape::new([batch_size])).convert(),
            &self.device,
        );

        ImageBatch { images, targets }
    }
}
