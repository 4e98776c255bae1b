//! Atomic structures, the reference item type.

use serde::{Deserialize, Serialize};

/// An atomic configuration: a periodic cell plus species and positions.
///
/// Only the four structural fields take part in the cache key. Anything
/// else a caller wants to carry around belongs in its own item type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Periodic boundary flag per cell axis.
    #[serde(default)]
    pub pbc: [bool; 3],
    /// Cell vectors, one row per axis.
    #[serde(default)]
    pub cell: [[f64; 3]; 3],
    /// Species code (atomic number) per atom.
    pub numbers: Vec<u32>,
    /// Cartesian position per atom.
    pub positions: Vec<[f64; 3]>,
}

impl Structure {
    /// Creates a non-periodic structure with a zero cell.
    pub fn molecule(numbers: Vec<u32>, positions: Vec<[f64; 3]>) -> Self {
        Self {
            pbc: [false; 3],
            cell: [[0.0; 3]; 3],
            numbers,
            positions,
        }
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// Returns `true` if the structure holds no atoms.
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}
