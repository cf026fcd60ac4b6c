use serde::{Deserialize, Serialize};
use crate::{error::RunnerError, Float};

/// Velocity-space model selectable from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GridModel {
    D2Q9,
    D3Q19,
    D3Q27,
}

/// Discrete velocity set of a lattice-Boltzmann model.
///
/// Basis vectors are always stored with three components (x, y, z); 2-D
/// models keep z at zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityGrid {
    pub model: GridModel,
    pub dim: usize,
    pub basis: &'static [[i32; 3]],
    pub weights: &'static [Float],
}

const D2Q9_BASIS: [[i32; 3]; 9] = [
    [0, 0, 0],
    [1, 0, 0], [0, 1, 0], [-1, 0, 0], [0, -1, 0],
    [1, 1, 0], [-1, 1, 0], [-1, -1, 0], [1, -1, 0],
];

const D2Q9_WEIGHTS: [Float; 9] = [
    4.0/9.0,
    1.0/9.0, 1.0/9.0, 1.0/9.0, 1.0/9.0,
    1.0/36.0, 1.0/36.0, 1.0/36.0, 1.0/36.0,
];

const D3Q19_BASIS: [[i32; 3]; 19] = [
    // Center
    [0, 0, 0],
    // Face neighbors (6)
    [1, 0, 0], [-1, 0, 0], [0, 1, 0], [0, -1, 0], [0, 0, 1], [0, 0, -1],
    // Edge neighbors (12)
    [1, 1, 0], [1, -1, 0], [-1, 1, 0], [-1, -1, 0],
    [1, 0, 1], [1, 0, -1], [-1, 0, 1], [-1, 0, -1],
    [0, 1, 1], [0, 1, -1], [0, -1, 1], [0, -1, -1],
];

const D3Q19_WEIGHTS: [Float; 19] = [
    1.0/3.0,
    1.0/18.0, 1.0/18.0, 1.0/18.0, 1.0/18.0, 1.0/18.0, 1.0/18.0,
    1.0/36.0, 1.0/36.0, 1.0/36.0, 1.0/36.0,
    1.0/36.0, 1.0/36.0, 1.0/36.0, 1.0/36.0,
    1.0/36.0, 1.0/36.0, 1.0/36.0, 1.0/36.0,
];

const D3Q27_BASIS: [[i32; 3]; 27] = [
    // Center
    [0, 0, 0],
    // Face neighbors (6)
    [1, 0, 0], [-1, 0, 0], [0, 1, 0], [0, -1, 0], [0, 0, 1], [0, 0, -1],
    // Edge neighbors (12)
    [1, 1, 0], [1, -1, 0], [-1, 1, 0], [-1, -1, 0],
    [1, 0, 1], [1, 0, -1], [-1, 0, 1], [-1, 0, -1],
    [0, 1, 1], [0, 1, -1], [0, -1, 1], [0, -1, -1],
    // Corner neighbors (8)
    [1, 1, 1], [1, 1, -1], [1, -1, 1], [1, -1, -1],
    [-1, 1, 1], [-1, 1, -1], [-1, -1, 1], [-1, -1, -1],
];

const D3Q27_WEIGHTS: [Float; 27] = [
    8.0/27.0,
    2.0/27.0, 2.0/27.0, 2.0/27.0, 2.0/27.0, 2.0/27.0, 2.0/27.0,
    1.0/54.0, 1.0/54.0, 1.0/54.0, 1.0/54.0,
    1.0/54.0, 1.0/54.0, 1.0/54.0, 1.0/54.0,
    1.0/54.0, 1.0/54.0, 1.0/54.0, 1.0/54.0,
    1.0/216.0, 1.0/216.0, 1.0/216.0, 1.0/216.0,
    1.0/216.0, 1.0/216.0, 1.0/216.0, 1.0/216.0,
];

/// Speed of sound squared in lattice units.
pub const CS2: Float = 1.0 / 3.0;

impl VelocityGrid {
    pub const D2Q9: VelocityGrid = VelocityGrid {
        model: GridModel::D2Q9,
        dim: 2,
        basis: &D2Q9_BASIS,
        weights: &D2Q9_WEIGHTS,
    };

    pub const D3Q19: VelocityGrid = VelocityGrid {
        model: GridModel::D3Q19,
        dim: 3,
        basis: &D3Q19_BASIS,
        weights: &D3Q19_WEIGHTS,
    };

    pub const D3Q27: VelocityGrid = VelocityGrid {
        model: GridModel::D3Q27,
        dim: 3,
        basis: &D3Q27_BASIS,
        weights: &D3Q27_WEIGHTS,
    };

    pub fn from_model(model: GridModel) -> Self {
        match model {
            GridModel::D2Q9 => Self::D2Q9,
            GridModel::D3Q19 => Self::D3Q19,
            GridModel::D3Q27 => Self::D3Q27,
        }
    }

    /// Checks that the model matches the dimensionality of the lattice.
    pub fn for_dim(model: GridModel, dim: usize) -> anyhow::Result<Self> {
        let grid = Self::from_model(model);
        if grid.dim != dim {
            return Err(RunnerError::config(format!(
                "{:?} is a {}-D model, lattice is {}-D", model, grid.dim, dim
            ))
            .into());
        }
        Ok(grid)
    }

    /// Number of discrete velocities.
    pub fn q(&self) -> usize {
        self.basis.len()
    }

    /// Directions whose velocity component along `axis` equals `direction`
    /// (+1 or -1), i.e. the distributions that cross a boundary normal to
    /// `axis` when moving in that sense. Returned in table order.
    pub fn prop_dists(&self, direction: i32, axis: usize) -> Vec<usize> {
        self.basis
            .iter()
            .enumerate()
            .filter(|(_, c)| c[axis] == direction)
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the direction with the reversed velocity vector.
    pub fn opposite(&self, direction: usize) -> usize {
        let c = self.basis[direction];
        self.basis
            .iter()
            .position(|o| o[0] == -c[0] && o[1] == -c[1] && o[2] == -c[2])
            .unwrap_or(direction)
    }

    /// Second-order equilibrium distribution for one direction.
    pub fn equilibrium(&self, direction: usize, density: Float, velocity: [Float; 3]) -> Float {
        let weight = self.weights[direction];
        let c = self.basis[direction];

        let cu = c[0] as Float * velocity[0] + c[1] as Float * velocity[1] + c[2] as Float * velocity[2];
        let u2 = velocity[0] * velocity[0] + velocity[1] * velocity[1] + velocity[2] * velocity[2];

        weight * density * (1.0 + cu / CS2 +
                           cu * cu / (2.0 * CS2 * CS2) -
                           u2 / (2.0 * CS2))
    }
}
