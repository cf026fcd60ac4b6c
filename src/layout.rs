//! In-memory shape of a block's lattice arrays.
//!
//! All size vectors in this module are ordered with the fastest-varying
//! axis last (`[z, y, x]` or `[y, x]`), matching the row-major storage of
//! the distribution and field arrays. Launch geometry vectors follow the
//! device convention instead and list X first.

use crate::error::RunnerError;

/// Integer division rounding up.
pub fn ceil_div(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalLayout {
    /// Logical size of the lattice, ghost nodes included.
    pub lat_size: Vec<usize>,
    /// Allocated size; the X extent is rounded up to a multiple of `block_size`.
    pub physical_size: Vec<usize>,
    /// Workgroups per launch axis for the standard (bulk) kernel call.
    pub kernel_grid_size: Vec<usize>,
    /// Threads per workgroup for the standard kernel call.
    pub kernel_block_size: Vec<usize>,
    pub block_size: usize,
}

impl PhysicalLayout {
    /// Computes the layout from a block's `actual_size` (X first, envelope
    /// included) and the device alignment quantum.
    pub fn new(actual_size: &[usize], block_size: usize) -> anyhow::Result<Self> {
        if block_size == 0 {
            return Err(RunnerError::config("block_size must be positive").into());
        }
        if !(2..=3).contains(&actual_size.len()) {
            return Err(RunnerError::config(format!(
                "unsupported lattice dimension {}", actual_size.len()
            ))
            .into());
        }
        if actual_size.iter().any(|&n| n == 0) {
            return Err(RunnerError::config(format!(
                "empty block geometry {:?}", actual_size
            ))
            .into());
        }

        let lat_size: Vec<usize> = actual_size.iter().rev().copied().collect();

        let mut physical_size = lat_size.clone();
        let last = physical_size.len() - 1;
        physical_size[last] = ceil_div(physical_size[last], block_size) * block_size;

        let mut kernel_grid_size: Vec<usize> = physical_size.iter().rev().copied().collect();
        kernel_grid_size[0] /= block_size;

        let mut kernel_block_size = vec![1; lat_size.len()];
        kernel_block_size[0] = block_size;

        Ok(Self {
            lat_size,
            physical_size,
            kernel_grid_size,
            kernel_block_size,
            block_size,
        })
    }

    pub fn dim(&self) -> usize {
        self.lat_size.len()
    }

    /// Total number of allocated nodes, padding included.
    pub fn num_nodes(&self) -> usize {
        self.physical_size.iter().product()
    }

    /// Row-major strides in bytes for elements of `elem_size` bytes.
    pub fn strides(&self, elem_size: usize) -> Vec<usize> {
        let n = self.physical_size.len();
        let mut strides = vec![elem_size; n];
        for i in (0..n - 1).rev() {
            strides[i] = strides[i + 1] * self.physical_size[i + 1];
        }
        strides
    }

    /// Bytes needed for one set of distributions of a `q`-velocity model.
    pub fn dist_bytes(&self, q: usize) -> usize {
        self.num_nodes() * q * std::mem::size_of::<crate::Float>()
    }

    pub fn lat_nx(&self) -> usize {
        self.lat_size[self.dim() - 1]
    }

    pub fn lat_ny(&self) -> usize {
        self.lat_size[self.dim() - 2]
    }

    pub fn lat_nz(&self) -> usize {
        if self.dim() == 3 { self.lat_size[0] } else { 1 }
    }

    pub fn arr_nx(&self) -> usize {
        self.physical_size[self.dim() - 1]
    }

    pub fn arr_ny(&self) -> usize {
        self.physical_size[self.dim() - 2]
    }

    pub fn arr_nz(&self) -> usize {
        if self.dim() == 3 { self.physical_size[0] } else { 1 }
    }

    /// Linear node offset of `(x, y, z)` within one distribution plane.
    pub fn node_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.arr_nx() * (y + self.arr_ny() * z)
    }

    /// Launch geometry of the kernel as `[x, y, z]` workgroup counts.
    pub fn grid3(&self) -> [u32; 3] {
        let mut grid = [1u32; 3];
        for (g, &n) in grid.iter_mut().zip(&self.kernel_grid_size) {
            *g = n as u32;
        }
        grid
    }

    /// Thread counts per workgroup as `[x, y, z]`.
    pub fn block3(&self) -> [u32; 3] {
        let mut block = [1u32; 3];
        for (b, &n) in block.iter_mut().zip(&self.kernel_block_size) {
            *b = n as u32;
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_fastest_axis_only() {
        for bs in [1, 4, 16, 32, 64] {
            for nx in 1..70 {
                let layout = PhysicalLayout::new(&[nx, 7, 3], bs).unwrap();
                assert_eq!(layout.lat_size, vec![3, 7, nx]);
                assert_eq!(layout.physical_size[2] % bs, 0);
                assert!(layout.physical_size[2] >= nx);
                assert!(layout.physical_size[2] < nx + bs);
                assert_eq!(&layout.physical_size[..2], &[3, 7]);
            }
        }
    }

    #[test]
    fn launch_geometry() {
        let layout = PhysicalLayout::new(&[12, 10], 8).unwrap();
        assert_eq!(layout.physical_size, vec![10, 16]);
        assert_eq!(layout.kernel_grid_size, vec![2, 10]);
        assert_eq!(layout.kernel_block_size, vec![8, 1]);
        assert_eq!(layout.grid3(), [2, 10, 1]);
        assert_eq!(layout.block3(), [8, 1, 1]);
    }

    #[test]
    fn strides_are_row_major() {
        let layout = PhysicalLayout::new(&[5, 6, 7], 4).unwrap();
        assert_eq!(layout.physical_size, vec![7, 6, 8]);
        assert_eq!(layout.strides(4), vec![6 * 8 * 4, 8 * 4, 4]);
        assert_eq!(layout.num_nodes(), 7 * 6 * 8);
        assert_eq!(layout.node_index(1, 2, 3), 1 + 8 * (2 + 6 * 3));
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(PhysicalLayout::new(&[10, 10], 0).is_err());
        assert!(PhysicalLayout::new(&[10], 4).is_err());
        assert!(PhysicalLayout::new(&[10, 0], 4).is_err());
    }
}
