//! Transfer-learning image classifier: a frozen ImageNet MobileNetV2 with a
//! small trainable head, trained on a `dataset/{train,val}/<class>/*` tree.

pub mod artifact;
pub mod data;
pub mod error;
pub mod inference;
pub mod logging;
pub mod metric;
pub mod mobilenet;
pub mod model;
pub mod renderer;
pub mod training;

pub use error::{ClassifierError, Result};
