//! Similarity-based dynamic clustering
//!
//! Clients are grouped from the pairwise cosine similarity of their
//! flattened parameter vectors. Clients whose average similarity falls
//! below the lower quartile are treated as outliers and pinned to
//! cluster 0; the remaining clients are split across the other labels
//! with k-means over the similarity sub-matrix. When the quartile split
//! is degenerate (no outliers, or everyone an outlier) k-means runs
//! directly on the full matrix.

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::model::{cosine_similarity, ParameterSet};

const KMEANS_MAX_ITER: usize = 100;

/// Assigns cluster labels from parameter similarity.
#[derive(Debug, Clone)]
pub struct SimilarityClusterer {
    num_clusters: usize,
    seed: u64,
}

impl SimilarityClusterer {
    /// Creates a clusterer producing labels in `[0, num_clusters)`.
    pub fn new(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            seed: 0,
        }
    }

    /// Sets the k-means seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Clusters the given parameter sets, one label per client.
    pub fn assign(&self, parameter_sets: &[ParameterSet]) -> Vec<usize> {
        let flattened: Vec<Vec<f32>> = parameter_sets.iter().map(ParameterSet::flatten).collect();
        let similarity = cosine_similarity_matrix(&flattened);
        self.assign_from_similarity(&similarity)
    }

    /// Clusters from a precomputed pairwise similarity matrix.
    pub fn assign_from_similarity(&self, similarity: &Array2<f32>) -> Vec<usize> {
        let n = similarity.nrows();
        if n == 0 {
            return Vec::new();
        }

        let avg_similarities: Vec<f32> = similarity
            .rows()
            .into_iter()
            .map(|row| row.sum() / n as f32)
            .collect();
        let threshold = percentile(&avg_similarities, 25.0);

        let outliers: Vec<usize> = (0..n)
            .filter(|&i| avg_similarities[i] < threshold)
            .collect();
        let normals: Vec<usize> = (0..n)
            .filter(|&i| avg_similarities[i] >= threshold)
            .collect();

        debug!(
            clients = n,
            outliers = outliers.len(),
            threshold,
            "similarity clustering"
        );

        // No meaningful split: fall back to plain k-means on the matrix.
        if outliers.is_empty() || outliers.len() == n {
            let k = self.num_clusters.min(n).max(1);
            return kmeans(similarity.view(), k, self.seed, KMEANS_MAX_ITER);
        }

        let mut labels = vec![0usize; n];
        if self.num_clusters == 1 {
            // Single-cluster setups collapse normals back into label 0.
            for &i in &normals {
                labels[i] = 1 % self.num_clusters;
            }
        } else {
            let sub = similarity
                .select(Axis(0), &normals)
                .select(Axis(1), &normals);
            let k = (self.num_clusters - 1).min(normals.len());
            let sub_labels = kmeans(sub.view(), k, self.seed, KMEANS_MAX_ITER);
            for (position, &i) in normals.iter().enumerate() {
                labels[i] = sub_labels[position] + 1;
            }
        }
        labels
    }
}

/// Pairwise cosine similarity matrix over flattened parameter vectors.
pub fn cosine_similarity_matrix(vectors: &[Vec<f32>]) -> Array2<f32> {
    let n = vectors.len();
    let mut matrix = Array2::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let sim = cosine_similarity(&vectors[i], &vectors[j]);
            matrix[[i, j]] = sim;
            matrix[[j, i]] = sim;
        }
    }
    matrix
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f32], pct: f32) -> f32 {
    assert!(!values.is_empty(), "percentile of empty slice");
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = pct / 100.0 * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let fraction = rank - lower as f32;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// Lloyd's k-means over matrix rows with k-means++ seeding.
///
/// Deterministic for a fixed seed. Empty clusters keep their previous
/// centroid.
fn kmeans(data: ArrayView2<'_, f32>, k: usize, seed: u64, max_iter: usize) -> Vec<usize> {
    let n = data.nrows();
    if n == 0 {
        return Vec::new();
    }
    if k <= 1 {
        return vec![0; n];
    }
    let k = k.min(n);
    let mut rng = StdRng::seed_from_u64(seed);

    // k-means++ initialisation
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    let first = rng.gen_range(0..n);
    centroids.push(data.row(first).to_vec());
    while centroids.len() < k {
        let distances: Vec<f32> = (0..n)
            .map(|i| {
                centroids
                    .iter()
                    .map(|c| squared_distance(&data.row(i).to_vec(), c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = distances.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f32>() * total;
            let mut chosen = n - 1;
            for (i, &d) in distances.iter().enumerate() {
                if target < d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };
        centroids.push(data.row(next).to_vec());
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iter {
        let mut changed = false;
        for i in 0..n {
            let row = data.row(i).to_vec();
            let nearest = centroids
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    squared_distance(&row, a)
                        .partial_cmp(&squared_distance(&row, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(c, _)| c)
                .unwrap_or(0);
            if labels[i] != nearest {
                labels[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == c).collect();
            if members.is_empty() {
                continue;
            }
            for (dim, value) in centroid.iter_mut().enumerate() {
                *value = members.iter().map(|&i| data[[i, dim]]).sum::<f32>()
                    / members.len() as f32;
            }
        }
    }
    labels
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
