use std::{collections::BTreeSet, fmt::Display, marker::PhantomData};

use burn::{tensor::{activation::softmax, backend::Backend, Int, Tensor}, train::{metric::{state::{FormatOptions, NumericMetricState}, Adaptor, Metric, MetricEntry, MetricMetadata, Numeric}, ClassificationOutput}};

const EPSILON: f64 = 1e-8;

/// Mean per-class F1 of a single batch, with every probability rounded to a
/// hard 0/1 vote (ties go to 0). Only meant as a training-time indicator;
/// see [`macro_scores`] for the validation numbers.
///
/// `probabilities` is row-major `[targets.len(), num_classes]`.
pub fn batch_f1(targets: &[usize], probabilities: &[f32], num_classes: usize) -> f64 {
    debug_assert_eq!(probabilities.len(), targets.len() * num_classes);
    if num_classes == 0 {
        return 0.0;
    }

    let mut tp = vec![0f64; num_classes];
    let mut fp = vec![0f64; num_classes];
    let mut fn_ = vec![0f64; num_classes];

    for (row, target) in probabilities.chunks_exact(num_classes).zip(targets) {
        for (class, probability) in row.iter().enumerate() {
            let predicted = probability.round_ties_even() as f64;
            let actual = if class == *target { 1.0 } else { 0.0 };
            tp[class] += actual * predicted;
            fp[class] += (1.0 - actual) * predicted;
            fn_[class] += actual * (1.0 - predicted);
        }
    }

    let total: f64 = (0..num_classes)
        .map(|class| {
            let precision = tp[class] / (tp[class] + fp[class] + EPSILON);
            let recall = tp[class] / (tp[class] + fn_[class] + EPSILON);
            2.0 * precision * recall / (precision + recall + EPSILON)
        })
        .sum();

    total / num_classes as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Display for MacroScores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Precision: {:.4}", self.precision)?;
        writeln!(f, "Recall: {:.4}", self.recall)?;
        write!(f, "F1-score: {:.4}", self.f1)
    }
}

/// Unweighted mean of per-class precision, recall and F1 over every label
/// seen in either `y_true` or `y_pred`. A class whose denominator is zero
/// scores 0.
pub fn macro_scores(y_true: &[usize], y_pred: &[usize]) -> MacroScores {
    debug_assert_eq!(y_true.len(), y_pred.len());

    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred.iter()).copied().collect();
    if labels.is_empty() {
        return MacroScores { precision: 0.0, recall: 0.0, f1: 0.0 };
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for label in labels.iter() {
        let pairs = y_true.iter().zip(y_pred);
        let tp = pairs.clone().filter(|(t, p)| *t == label && *p == label).count();
        let fp = pairs.clone().filter(|(t, p)| *t != label && *p == label).count();
        let fn_ = pairs.filter(|(t, p)| *t == label && *p != label).count();

        precision += ratio(tp, tp + fp);
        recall += ratio(tp, tp + fn_);
        f1 += ratio(2 * tp, 2 * tp + fp + fn_);
    }

    let n = labels.len() as f64;
    MacroScores { precision: precision / n, recall: recall / n, f1: f1 / n }
}

pub struct BatchF1Input<B: Backend> {
    probabilities: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Adaptor<BatchF1Input<B>> for ClassificationOutput<B> {
    fn adapt(&self) -> BatchF1Input<B> {
        BatchF1Input {
            probabilities: softmax(self.output.clone(), 1),
            targets: self.targets.clone(),
        }
    }
}

/// Unweighted running mean of [`batch_f1`] over an epoch.
#[derive(Default)]
pub struct BatchF1Metric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> BatchF1Metric<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Metric for BatchF1Metric<B> {
    const NAME: &'static str = "F1 (batch)";

    type Input = BatchF1Input<B>;

    fn update(&mut self, input: &BatchF1Input<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [_, num_classes] = input.probabilities.dims();

        let probabilities: Vec<f32> = input.probabilities.clone().into_data().convert().value;
        let targets: Vec<usize> = input
            .targets
            .clone()
            .into_data()
            .convert::<i64>()
            .value
            .into_iter()
            .map(|target| target as usize)
            .collect();

        // Every batch counts once, whatever its size.
        let f1 = batch_f1(&targets, &probabilities, num_classes);
        self.state.update(f1, 1, FormatOptions::new(Self::NAME).precision(4))
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for BatchF1Metric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
