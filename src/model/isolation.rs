//! Isolation forest over dense feature rows
//!
//! Points that are easy to separate from the rest by random axis-aligned splits
//! end up near the root; the raw score is `2^(-E[h] / c(ψ))` where `E[h]` is the
//! mean path length across trees and `ψ` the per-tree subsample size.
//!
//! Refinements over the textbook algorithm keep scores meaningful on the small
//! corpora this pipeline trains on:
//! - a point that differs (beyond float noise) on a feature the tree's
//!   subsample never varies on is isolated at the root,
//! - a point outside a tree's training range on the split feature is isolated
//!   at that split,
//! - a leaf that holds several identical samples isolates any point that is not
//!   equal to them.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Relative tolerance below which a value equals a constant training feature
const NOVELTY_TOLERANCE: f64 = 1e-9;

fn differs(value: f64, constant: f64) -> bool {
    (value - constant).abs() > NOVELTY_TOLERANCE * constant.abs().max(1.0)
}

/// Average path length of an unsuccessful BST search over `n` points
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_samples: usize,
    pub seed: u64,
}

// ============================================================================
// Tree
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
        /// Set when every sample in the leaf is the same point
        #[serde(default, skip_serializing_if = "Option::is_none")]
        point: Option<Vec<f64>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
    /// Per-feature minimum of the tree's subsample
    lo: Vec<f64>,
    /// Per-feature maximum of the tree's subsample
    hi: Vec<f64>,
}

impl IsolationTree {
    fn build(rows: &[Vec<f64>], sample: &[usize], max_depth: usize, rng: &mut ChaCha8Rng) -> Self {
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut lo = vec![f64::INFINITY; n_features];
        let mut hi = vec![f64::NEG_INFINITY; n_features];
        for &i in sample {
            for f in 0..n_features {
                lo[f] = lo[f].min(rows[i][f]);
                hi[f] = hi[f].max(rows[i][f]);
            }
        }

        let mut tree = Self {
            nodes: Vec::new(),
            lo,
            hi,
        };
        tree.grow(rows, sample.to_vec(), 0, max_depth, rng);
        tree
    }

    /// Append the subtree for `members` and return its node index.
    fn grow(
        &mut self,
        rows: &[Vec<f64>],
        members: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            size: members.len(),
            point: None,
        });

        if members.len() <= 1 {
            return id;
        }

        // Features that still vary inside this node.
        let n_features = rows[members[0]].len();
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(n_features);
        for f in 0..n_features {
            let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
            for &i in &members {
                min = min.min(rows[i][f]);
                max = max.max(rows[i][f]);
            }
            if max > min {
                candidates.push((f, min, max));
            }
        }

        if candidates.is_empty() {
            self.nodes[id] = Node::Leaf {
                size: members.len(),
                point: Some(rows[members[0]].clone()),
            };
            return id;
        }
        if depth >= max_depth {
            return id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);
        let (left, right): (Vec<usize>, Vec<usize>) =
            members.iter().partition(|&&i| rows[i][feature] < threshold);

        if left.is_empty() || right.is_empty() {
            return id;
        }

        let left = self.grow(rows, left, depth + 1, max_depth, rng);
        let right = self.grow(rows, right, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let novel = (0..x.len().min(self.lo.len()))
            .any(|f| self.lo[f] == self.hi[f] && differs(x[f], self.lo[f]));
        if novel {
            return 1.0;
        }

        let mut id = 0;
        let mut depth = 0usize;
        loop {
            match &self.nodes[id] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = x[*feature];
                    if v < self.lo[*feature] || v > self.hi[*feature] {
                        return (depth + 1) as f64;
                    }
                    id = if v < *threshold { *left } else { *right };
                    depth += 1;
                }
                Node::Leaf { size, point } => {
                    if let Some(p) = point {
                        if p.iter().zip(x).any(|(c, v)| differs(*v, *c)) {
                            return (depth + 1) as f64;
                        }
                    }
                    return depth as f64 + average_path_length(*size);
                }
            }
        }
    }

    fn is_consistent(&self, n_features: usize) -> bool {
        if self.nodes.is_empty() || self.lo.len() != n_features || self.hi.len() != n_features {
            return false;
        }
        self.nodes.iter().all(|node| match node {
            Node::Split {
                feature,
                left,
                right,
                threshold,
            } => {
                *feature < n_features
                    && *left < self.nodes.len()
                    && *right < self.nodes.len()
                    && threshold.is_finite()
            }
            Node::Leaf { point, .. } => point.as_ref().map_or(true, |p| p.len() == n_features),
        })
    }
}

// ============================================================================
// Forest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    n_features: usize,
    /// Subsample size per tree (ψ)
    subsample: usize,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    /// Fit on dense rows. Every row must have the same length and at least two
    /// rows are needed for a non-degenerate forest.
    pub fn fit(rows: &[Vec<f64>], params: ForestParams) -> Self {
        let n = rows.len();
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        let subsample = params.max_samples.min(n).max(1);
        let max_depth = (subsample as f64).log2().ceil().max(1.0) as usize;

        let trees: Vec<IsolationTree> = (0..params.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let mut sample = index::sample(&mut rng, n, subsample).into_vec();
                // Sorted membership keeps node statistics independent of draw order.
                sample.sort_unstable();
                IsolationTree::build(rows, &sample, max_depth, &mut rng)
            })
            .collect();

        Self {
            n_features,
            subsample,
            trees,
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn mean_path_length(&self, x: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        total / self.trees.len().max(1) as f64
    }

    /// Raw isolation score in (0, 1]; higher is more anomalous.
    pub fn raw_score(&self, x: &[f64]) -> f64 {
        let c = average_path_length(self.subsample);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-self.mean_path_length(x) / c)
    }

    pub fn raw_scores(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.par_iter().map(|r| self.raw_score(r)).collect()
    }

    /// Structural check used after deserializing an artifact.
    pub fn is_consistent(&self) -> bool {
        !self.trees.is_empty()
            && self.subsample >= 1
            && self.trees.iter().all(|t| t.is_consistent(self.n_features))
    }
}
