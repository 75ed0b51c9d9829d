//! Isolation forest anomaly scoring.
//!
//! Points that are easy to isolate with random axis-aligned splits get short
//! average path lengths and therefore high scores. The forest flags the
//! configured fraction of highest-scoring points as outliers.

use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::models::{AnomalyFlag, FeatureVector, FEATURE_COUNT};

const N_TREES: usize = 100;
const MAX_SAMPLES: usize = 256;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

impl Node {
    fn path_length(&self, point: &FeatureVector, depth: f64) -> f64 {
        match self {
            Node::Leaf { size } => depth + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if point[*feature] < *threshold {
                    left.path_length(point, depth + 1.0)
                } else {
                    right.path_length(point, depth + 1.0)
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful search in a binary tree of `n`
/// points, used to normalize depths.
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

#[derive(Debug, Clone)]
pub struct IsolationForest {
    pub n_trees: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct AnomalyFit {
    pub scores: Vec<f64>,
    pub threshold: f64,
    pub flags: Vec<AnomalyFlag>,
}

impl AnomalyFit {
    pub fn outliers(&self) -> usize {
        self.flags.iter().filter(|flag| flag.is_outlier()).count()
    }
}

impl IsolationForest {
    pub fn new(contamination: f64, seed: u64) -> Self {
        Self {
            n_trees: N_TREES,
            max_samples: MAX_SAMPLES,
            contamination,
            seed,
        }
    }

    pub fn fit_predict(&self, points: &[FeatureVector]) -> AnomalyFit {
        if points.is_empty() {
            return AnomalyFit {
                scores: Vec::new(),
                threshold: 0.0,
                flags: Vec::new(),
            };
        }

        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        let subsample = self.max_samples.min(points.len());
        let height_limit = (subsample.max(2) as f64).log2().ceil() as usize;
        let trees: Vec<Node> = (0..self.n_trees.max(1))
            .map(|_| {
                let mut rows: Vec<usize> = sample(&mut rng, points.len(), subsample).into_vec();
                build(points, &mut rows, 0, height_limit, &mut rng)
            })
            .collect();

        let normalizer = average_path_length(subsample).max(f64::EPSILON);
        let scores: Vec<f64> = points
            .iter()
            .map(|point| {
                let mean_depth = trees
                    .iter()
                    .map(|tree| tree.path_length(point, 0.0))
                    .sum::<f64>()
                    / trees.len() as f64;
                2f64.powf(-mean_depth / normalizer)
            })
            .collect();

        let threshold = quantile(&scores, 1.0 - self.contamination);
        let flags = scores
            .iter()
            .map(|&score| {
                if score > threshold {
                    AnomalyFlag::Outlier
                } else {
                    AnomalyFlag::Normal
                }
            })
            .collect();

        AnomalyFit {
            scores,
            threshold,
            flags,
        }
    }
}

fn build(
    points: &[FeatureVector],
    rows: &mut [usize],
    depth: usize,
    height_limit: usize,
    rng: &mut ChaCha20Rng,
) -> Node {
    if depth >= height_limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    let spread: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
        .filter_map(|feature| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &row| {
                let value = points[row][feature];
                (lo.min(value), hi.max(value))
            });
            (hi > lo).then_some((feature, lo, hi))
        })
        .collect();
    if spread.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = spread[rng.random_range(0..spread.len())];
    let threshold = lo + rng.random::<f64>() * (hi - lo);
    let mut split = 0;
    for i in 0..rows.len() {
        if points[rows[i]][feature] < threshold {
            rows.swap(i, split);
            split += 1;
        }
    }
    // A draw landing exactly on `lo` leaves one side empty; that side is a leaf.
    let (left_rows, right_rows) = rows.split_at_mut(split);
    Node::Split {
        feature,
        threshold,
        left: Box::new(build(points, left_rows, depth + 1, height_limit, rng)),
        right: Box::new(build(points, right_rows, depth + 1, height_limit, rng)),
    }
}

/// Linear-interpolated quantile, `q` in [0, 1].
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud_with_outliers() -> Vec<FeatureVector> {
        let mut points = Vec::new();
        for i in 0..190 {
            let t = i as f64;
            points.push([(t * 0.37).sin() * 0.5, (t * 0.11).cos() * 0.5, (t * 0.23).sin() * 0.5]);
        }
        for i in 0..10 {
            let far = 8.0 + i as f64;
            points.push([far, -far, far]);
        }
        points
    }

    #[test]
    fn flags_roughly_the_contaminated_fraction() {
        let points = cloud_with_outliers();
        let fit = IsolationForest::new(0.05, 42).fit_predict(&points);
        assert_eq!(fit.flags.len(), points.len());
        let outliers = fit.outliers();
        assert!((8..=11).contains(&outliers), "got {outliers}");
    }

    #[test]
    fn distant_points_score_highest() {
        let points = cloud_with_outliers();
        let fit = IsolationForest::new(0.05, 42).fit_predict(&points);
        let far_min = fit.scores[190..].iter().cloned().fold(f64::INFINITY, f64::min);
        let near_mean = fit.scores[..190].iter().sum::<f64>() / 190.0;
        assert!(far_min > near_mean);
        let far_flagged = fit.flags[190..].iter().filter(|flag| flag.is_outlier()).count();
        assert!(far_flagged >= 8, "got {far_flagged}");
    }

    #[test]
    fn deterministic_for_a_fixed_seed() {
        let points = cloud_with_outliers();
        let a = IsolationForest::new(0.05, 42).fit_predict(&points);
        let b = IsolationForest::new(0.05, 42).fit_predict(&points);
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.flags, b.flags);
    }

    #[test]
    fn average_path_length_matches_known_values() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!((c256 - 10.2448).abs() < 1e-3, "got {c256}");
    }

    #[test]
    fn quantile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&values, 0.0), 1.0);
        assert_eq!(quantile(&values, 1.0), 4.0);
        assert!((quantile(&values, 0.3) - 1.9).abs() < 1e-12);
    }

    #[test]
    fn identical_points_are_never_outliers() {
        let points = vec![[0.5, 0.5, 0.5]; 40];
        let fit = IsolationForest::new(0.05, 42).fit_predict(&points);
        assert_eq!(fit.outliers(), 0);
    }
}
