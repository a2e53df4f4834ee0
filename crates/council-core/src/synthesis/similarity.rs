//! Cosine similarity over embedding vectors, and the pairwise matrix built
//! from a round's negotiation responses.

/// Cosine similarity of two equal-length vectors. Returns `0.0` if either is
/// the zero vector (avoids a division by zero rather than producing `NaN`).
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Symmetric n×n similarity matrix with a unit diagonal.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    pub values: Vec<Vec<f64>>,
}

impl SimilarityMatrix {
    #[must_use]
    pub fn build(embeddings: &[Vec<f32>]) -> Self {
        let n = embeddings.len();
        let mut values = vec![vec![1.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = cosine_similarity(&embeddings[i], &embeddings[j]);
                values[i][j] = s;
                values[j][i] = s;
            }
        }
        Self { values }
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the upper-triangle entries (excludes the diagonal). `1.0` for
    /// a single-element matrix, since a lone response trivially agrees with itself.
    #[must_use]
    pub fn average(&self) -> f64 {
        let n = self.len();
        if n <= 1 {
            return 1.0;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                sum += self.values[i][j];
                count += 1;
            }
        }
        sum / count as f64
    }

    /// Whether every off-diagonal pair meets `threshold`.
    #[must_use]
    pub fn all_pairs_converged(&self, threshold: f64) -> bool {
        let n = self.len();
        if n <= 1 {
            return true;
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if self.values[i][j] < threshold {
                    return false;
                }
            }
        }
        true
    }
}
