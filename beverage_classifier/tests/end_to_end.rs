use std::{io::Cursor, path::Path};

use beverage_classifier::{
    artifact::{load_model, save_model, ProjectLayout},
    data::{ImageBatcher, ImageFolderDataset},
    inference,
    training::{train, BackboneInit, TrainingConfig},
};
use burn::{
    backend::{Autodiff, NdArray},
    data::{dataloader::batcher::Batcher, dataset::Dataset},
};
use tempfile::TempDir;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const IMAGE_SIZE: usize = 32;

fn write_class_images(dir: &Path, count: u32, base: [u8; 3]) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let img = image::ImageBuffer::from_fn(48, 40, |x, y| {
            let jitter = ((x + y + i * 7) % 16) as u8;
            image::Rgb([base[0].saturating_add(jitter), base[1].saturating_add(jitter), base[2].saturating_add(jitter)])
        });
        img.save(dir.join(format!("{:02}.png", i))).unwrap();
    }
}

fn beverage_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let layout = ProjectLayout::new(dir.path());

    write_class_images(&layout.train_dir().join("cola"), 10, [90, 20, 10]);
    write_class_images(&layout.train_dir().join("water"), 10, [170, 210, 235]);
    write_class_images(&layout.val_dir().join("cola"), 4, [95, 25, 15]);
    write_class_images(&layout.val_dir().join("water"), 4, [165, 205, 230]);

    dir
}

fn test_config() -> TrainingConfig {
    TrainingConfig::with_default_optimizer()
        .with_num_epochs(2)
        .with_num_workers(1)
        .with_image_size(IMAGE_SIZE)
}

#[test]
fn test_train_predict_round_trip() {
    let project = beverage_project();
    let layout = ProjectLayout::new(project.path());
    let device = Default::default();

    let trained = train::<TestAutodiffBackend>(&layout, &test_config(), BackboneInit::Random, device).unwrap();

    assert_eq!(trained.metadata.class_names, vec!["cola".to_string(), "water".to_string()]);
    assert_eq!(trained.model.num_classes(), 2);
    for score in [trained.scores.precision, trained.scores.recall, trained.scores.f1] {
        assert!((0.0..=1.0).contains(&score), "score out of range: {}", score);
    }

    // Probabilities over a validation batch are normalised per image.
    let dataset = ImageFolderDataset::new(layout.val_dir(), IMAGE_SIZE).unwrap();
    let items = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
    let batch = ImageBatcher::<TestBackend>::new(device, IMAGE_SIZE).batch(items);
    let probabilities = trained.model.forward_probabilities(batch.images.clone());
    assert_eq!(probabilities.dims(), [8, 2]);

    let sums: Vec<f32> = probabilities.clone().sum_dim(1).into_data().convert().value;
    for sum in sums {
        assert!((sum - 1.0).abs() < 1e-5, "row sums to {}", sum);
    }

    // Persistence keeps the arg-max of every image.
    let before: Vec<i64> = probabilities.argmax(1).into_data().convert().value;
    save_model(&layout, trained.model, &trained.metadata).unwrap();
    let (reloaded, _) = load_model::<TestBackend>(&layout, &device).unwrap();
    let after: Vec<i64> = reloaded.forward_probabilities(batch.images).argmax(1).into_data().convert().value;
    assert_eq!(before, after);

    // The interactive predictor picks up the saved artifact.
    let image_path = layout.val_dir().join("water").join("00.png");
    let mut input = Cursor::new(format!("{}\n", image_path.display()));
    let mut output = Vec::new();
    let prediction = inference::run::<TestBackend, _, _>(&mut input, &mut output, &layout, &device)
        .unwrap()
        .unwrap();

    assert_eq!(prediction.class_names, vec!["cola".to_string(), "water".to_string()]);
    assert!((prediction.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert!(String::from_utf8(output).unwrap().contains("Class probabilities:"));
}
