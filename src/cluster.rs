use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::models::{FeatureVector, FEATURE_COUNT};

const MAX_ITER: usize = 300;
const TOLERANCE: f64 = 1e-4;
const N_INIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Vec<FeatureVector>,
    pub labels: Vec<usize>,
    pub inertia: f64,
}

impl KMeansFit {
    /// Cluster ids as written to the result table.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.labels.iter().map(|label| label.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    pub k: usize,
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
}

impl KMeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            seed,
            n_init: N_INIT,
            max_iter: MAX_ITER,
        }
    }

    /// Fits `k` centroids, keeping the restart with the lowest inertia.
    /// Callers guarantee `points.len() >= k > 0`.
    pub fn fit(&self, points: &[FeatureVector]) -> KMeansFit {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        let mut best: Option<KMeansFit> = None;

        for _ in 0..self.n_init.max(1) {
            let seeds = plus_plus_init(points, self.k, &mut rng);
            let fit = self.lloyd(points, seeds);
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }

        best.unwrap_or_else(|| KMeansFit {
            centroids: Vec::new(),
            labels: Vec::new(),
            inertia: 0.0,
        })
    }

    fn lloyd(&self, points: &[FeatureVector], mut centroids: Vec<FeatureVector>) -> KMeansFit {
        let mut labels = vec![0usize; points.len()];

        for _ in 0..self.max_iter {
            assign(points, &centroids, &mut labels);

            let mut sums = vec![[0.0; FEATURE_COUNT]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (point, &label) in points.iter().zip(&labels) {
                counts[label] += 1;
                for (acc, value) in sums[label].iter_mut().zip(point) {
                    *acc += value;
                }
            }

            let mut next = centroids.clone();
            for (cluster, centroid) in next.iter_mut().enumerate() {
                if counts[cluster] == 0 {
                    *centroid = farthest_point(points, &centroids, &labels);
                    continue;
                }
                for (value, sum) in centroid.iter_mut().zip(&sums[cluster]) {
                    *value = sum / counts[cluster] as f64;
                }
            }

            let shift: f64 = centroids
                .iter()
                .zip(&next)
                .map(|(old, new)| squared_distance(old, new))
                .sum();
            centroids = next;
            if shift <= TOLERANCE {
                break;
            }
        }

        assign(points, &centroids, &mut labels);
        let inertia = points
            .iter()
            .zip(&labels)
            .map(|(point, &label)| squared_distance(point, &centroids[label]))
            .sum();

        KMeansFit {
            centroids,
            labels,
            inertia,
        }
    }
}

pub fn squared_distance(a: &FeatureVector, b: &FeatureVector) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(point: &FeatureVector, centroids: &[FeatureVector]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(index, centroid)| (index, squared_distance(point, centroid)))
        .fold((0, f64::INFINITY), |best, candidate| {
            if candidate.1 < best.1 {
                candidate
            } else {
                best
            }
        })
}

fn assign(points: &[FeatureVector], centroids: &[FeatureVector], labels: &mut [usize]) {
    for (point, label) in points.iter().zip(labels.iter_mut()) {
        *label = nearest(point, centroids).0;
    }
}

fn farthest_point(
    points: &[FeatureVector],
    centroids: &[FeatureVector],
    labels: &[usize],
) -> FeatureVector {
    points
        .iter()
        .zip(labels)
        .map(|(point, &label)| (point, squared_distance(point, &centroids[label])))
        .fold((None, f64::NEG_INFINITY), |best, (point, dist)| {
            if dist > best.1 {
                (Some(point), dist)
            } else {
                best
            }
        })
        .0
        .copied()
        .unwrap_or([0.0; FEATURE_COUNT])
}

/// k-means++ seeding: each new centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn plus_plus_init(points: &[FeatureVector], k: usize, rng: &mut ChaCha20Rng) -> Vec<FeatureVector> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())]);
    let mut distances: Vec<f64> = points
        .iter()
        .map(|point| squared_distance(point, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = distances.iter().sum();
        let chosen = if total > 0.0 {
            let mut target = rng.random::<f64>() * total;
            let mut pick = points.len() - 1;
            for (index, dist) in distances.iter().enumerate() {
                if target < *dist {
                    pick = index;
                    break;
                }
                target -= dist;
            }
            pick
        } else {
            rng.random_range(0..points.len())
        };

        let centroid = points[chosen];
        for (dist, point) in distances.iter_mut().zip(points) {
            *dist = dist.min(squared_distance(point, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_blobs() -> Vec<FeatureVector> {
        let mut points = Vec::new();
        for i in 0..20 {
            let jitter = i as f64 * 0.01;
            points.push([-5.0 + jitter, -5.0, 0.0]);
            points.push([0.0, 5.0 - jitter, 0.0]);
            points.push([5.0, 0.0, 5.0 + jitter]);
        }
        points
    }

    #[test]
    fn separates_well_spaced_blobs() {
        let points = three_blobs();
        let fit = KMeans::new(3, 42).fit(&points);

        assert_eq!(fit.centroids.len(), 3);
        for blob in 0..3 {
            let first = fit.labels[blob];
            for i in 0..20 {
                assert_eq!(fit.labels[i * 3 + blob], first);
            }
        }
        assert_ne!(fit.labels[0], fit.labels[1]);
        assert_ne!(fit.labels[1], fit.labels[2]);
        assert_ne!(fit.labels[0], fit.labels[2]);
        assert!(fit.inertia < 1.0);
    }

    #[test]
    fn same_seed_gives_same_assignment() {
        let points = three_blobs();
        let a = KMeans::new(4, 7).fit(&points);
        let b = KMeans::new(4, 7).fit(&points);
        assert_eq!(a, b);
    }

    #[test]
    fn every_label_is_within_k() {
        let points = three_blobs();
        let fit = KMeans::new(5, 42).fit(&points);
        assert!(fit.labels.iter().all(|&label| label < 5));
        assert_eq!(fit.cluster_ids().len(), points.len());
    }

    #[test]
    fn identical_points_do_not_panic() {
        let points = vec![[1.0, 1.0, 1.0]; 6];
        let fit = KMeans::new(3, 42).fit(&points);
        assert_eq!(fit.labels.len(), 6);
        assert_eq!(fit.inertia, 0.0);
    }
}
