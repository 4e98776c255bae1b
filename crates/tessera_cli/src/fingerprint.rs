//! The reference fingerprint: sorted neighbor distances per atom.

use serde::{Deserialize, Serialize};
use tessera_common::{CacheKey, Compute, Structure};

/// A cutoff that is not a positive finite distance.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("cutoff must be a positive finite distance, got {0}")]
pub struct InvalidCutoff(pub f64);

/// For every atom, the ascending distances to all other atoms within
/// `cutoff`. Periodic axes use the minimum image over the neighboring cells.
///
/// Serves as its own descriptor: a worker needs nothing but the cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborDistances {
    cutoff: f64,
}

impl NeighborDistances {
    pub fn new(cutoff: f64) -> Result<Self, InvalidCutoff> {
        if cutoff.is_finite() && cutoff > 0.0 {
            Ok(Self { cutoff })
        } else {
            Err(InvalidCutoff(cutoff))
        }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }
}

impl Compute for NeighborDistances {
    type Item = Structure;
    type Value = Vec<Vec<f64>>;
    type Descriptor = NeighborDistances;

    fn descriptor(&self) -> Self::Descriptor {
        self.clone()
    }

    fn compute(&self, structure: &Structure, _key: &CacheKey) -> Vec<Vec<f64>> {
        let shifts = image_shifts(structure);
        let positions = &structure.positions;
        positions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let mut distances: Vec<f64> = positions
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, b)| {
                        shifts
                            .iter()
                            .map(|shift| distance(a, b, shift))
                            .fold(f64::INFINITY, f64::min)
                    })
                    .filter(|d| *d <= self.cutoff)
                    .collect();
                distances.sort_by(f64::total_cmp);
                distances
            })
            .collect()
    }
}

/// Translations to every neighboring cell image, including the zero shift.
fn image_shifts(structure: &Structure) -> Vec<[f64; 3]> {
    let range = |axis: usize| if structure.pbc[axis] { -1..=1 } else { 0..=0 };
    let mut shifts = Vec::with_capacity(27);
    for a in range(0) {
        for b in range(1) {
            for c in range(2) {
                let mut shift = [0.0; 3];
                for (n, row) in [a, b, c].into_iter().zip(&structure.cell) {
                    for (s, x) in shift.iter_mut().zip(row) {
                        *s += f64::from(n) * x;
                    }
                }
                shifts.push(shift);
            }
        }
    }
    shifts
}

fn distance(a: &[f64; 3], b: &[f64; 3], shift: &[f64; 3]) -> f64 {
    (0..3)
        .map(|k| {
            let d = b[k] + shift[k] - a[k];
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
