//! Model parameter containers
//!
//! Parameters travel as ordered sequences of name-free tensors. The
//! ordering contract matters: aggregation is element-wise per position,
//! and poison detection reads the *last* tensor by declaration order.
//! The concrete network architectures live client-side; this module only
//! knows their layer-shape templates for building untrained models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoordinatorError;

/// Model kind selected at coordinator construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    /// Mobile image classifier
    ImageClassification,
    /// Sparse-autoencoder anomaly detector
    ImageAnomalyDetection,
}

impl ModelType {
    /// Layer shapes of the untrained model, in declaration order.
    ///
    /// The final tensor is the classifier/decoder bias so that
    /// last-tensor extraction lands on the output layer.
    pub fn layer_shapes(&self) -> Vec<Vec<usize>> {
        match self {
            ModelType::ImageClassification => vec![
                vec![16, 3, 3, 3],
                vec![16],
                vec![16, 1, 3, 3],
                vec![32, 16, 1, 1],
                vec![32],
                vec![10, 32],
                vec![10],
            ],
            ModelType::ImageAnomalyDetection => vec![
                vec![64, 784],
                vec![64],
                vec![784, 64],
                vec![784],
            ],
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::ImageClassification => write!(f, "Image Classification"),
            ModelType::ImageAnomalyDetection => write!(f, "Image Anomaly Detection"),
        }
    }
}

impl FromStr for ModelType {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Image Classification" => Ok(ModelType::ImageClassification),
            "Image Anomaly Detection" => Ok(ModelType::ImageAnomalyDetection),
            other => Err(CoordinatorError::UnsupportedModelType {
                model_type: other.to_string(),
            }),
        }
    }
}

/// A single parameter tensor with its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Tensor dimensions
    pub shape: Vec<usize>,
    /// Values in row-major order
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from shape and data.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Creates a zero-filled tensor of the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A zero tensor with the same shape.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }
}

/// An ordered sequence of parameter tensors for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Tensors in declaration order
    pub tensors: Vec<Tensor>,
}

impl ParameterSet {
    /// Wraps a tensor sequence.
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Builds the untrained (all-zero) model for the given type.
    pub fn zeroed(model_type: ModelType) -> Self {
        Self {
            tensors: model_type
                .layer_shapes()
                .into_iter()
                .map(Tensor::zeros)
                .collect(),
        }
    }

    /// Concatenates all tensor values into one flat feature vector.
    pub fn flatten(&self) -> Vec<f32> {
        let total: usize = self.tensors.iter().map(Tensor::len).sum();
        let mut flat = Vec::with_capacity(total);
        for tensor in &self.tensors {
            flat.extend_from_slice(&tensor.data);
        }
        flat
    }

    /// The last tensor in declaration order, if any.
    pub fn last_tensor(&self) -> Option<&Tensor> {
        self.tensors.last()
    }

    /// A parameter set of zero tensors with matching shapes.
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self.tensors.iter().map(Tensor::zeros_like).collect(),
        }
    }

    /// Total number of parameters.
    pub fn num_parameters(&self) -> usize {
        self.tensors.iter().map(Tensor::len).sum()
    }
}

/// Cosine similarity between two flat vectors.
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_roundtrip() {
        assert_eq!(
            "Image Classification".parse::<ModelType>().unwrap(),
            ModelType::ImageClassification
        );
        assert_eq!(
            ModelType::ImageAnomalyDetection.to_string(),
            "Image Anomaly Detection"
        );
    }

    #[test]
    fn test_model_type_unsupported() {
        let err = "Tabular Regression".parse::<ModelType>().unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::UnsupportedModelType { .. }
        ));
    }

    #[test]
    fn test_zeroed_shapes() {
        let params = ParameterSet::zeroed(ModelType::ImageClassification);
        assert_eq!(params.tensors.len(), 7);
        assert_eq!(params.last_tensor().unwrap().shape, vec![10]);
        assert!(params.flatten().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_flatten_order() {
        let params = ParameterSet::new(vec![
            Tensor::new(vec![2], vec![1.0, 2.0]),
            Tensor::new(vec![1], vec![3.0]),
        ]);
        assert_eq!(params.flatten(), vec![1.0, 2.0, 3.0]);
        assert_eq!(params.num_parameters(), 3);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
