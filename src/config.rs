use serde::{Deserialize, Serialize};

use crate::{error::RunnerError, lattice::{GridModel, VelocityGrid}, Float};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub domain: DomainConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    pub physics: PhysicsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub geometry: Option<GeometryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub lat_nx: usize,
    pub lat_ny: usize,
    #[serde(default)]
    pub lat_nz: Option<usize>,
    #[serde(default)]
    pub periodic_x: bool,
    #[serde(default)]
    pub periodic_y: bool,
    #[serde(default)]
    pub periodic_z: bool,
    #[serde(default = "default_envelope_size")]
    pub envelope_size: usize,
    /// Number of slabs the lattice is split into along X.
    #[serde(default = "default_blocks")]
    pub blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Host,
    Wgpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Device alignment quantum and workgroup width.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// 0 runs until cancelled.
    #[serde(default)]
    pub max_iters: usize,
    /// Output period in iterations.
    #[serde(default = "default_every")]
    pub every: usize,
    /// Save the initial state and register fields with the writer.
    #[serde(default)]
    pub output: bool,
    /// Save at every `every`-th iteration.
    #[serde(default)]
    pub output_required: bool,
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_iters: 0,
            every: default_every(),
            output: false,
            output_required: false,
            backend: BackendKind::Host,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub grid: GridModel,
    #[serde(default = "default_density")]
    pub density: Float,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default = "default_base_name")]
    pub base_name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            base_name: default_base_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub stl: String,
    /// Lattice spacing in STL units.
    pub dx: f32,
}

fn default_envelope_size() -> usize { 1 }
fn default_blocks() -> usize { 1 }
fn default_block_size() -> usize { 64 }
fn default_every() -> usize { 100 }
fn default_density() -> Float { 1.0 }
fn default_output_directory() -> String { "output".to_string() }
fn default_base_name() -> String { "lbm".to_string() }

impl DomainConfig {
    pub fn dim(&self) -> usize {
        if self.lat_nz.is_some() { 3 } else { 2 }
    }

    /// Global lattice size, X first.
    pub fn global_size(&self) -> Vec<usize> {
        let mut size = vec![self.lat_nx, self.lat_ny];
        size.extend(self.lat_nz);
        size
    }

    pub fn periodicity(&self) -> [bool; 3] {
        [self.periodic_x, self.periodic_y, self.periodic_z]
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Single-block configuration with default runner settings.
    pub fn for_lattice(size: &[usize], grid: GridModel) -> Self {
        Self {
            domain: DomainConfig {
                lat_nx: size[0],
                lat_ny: size.get(1).copied().unwrap_or(1),
                lat_nz: size.get(2).copied(),
                periodic_x: false,
                periodic_y: false,
                periodic_z: false,
                envelope_size: default_envelope_size(),
                blocks: default_blocks(),
            },
            runner: RunnerConfig::default(),
            physics: PhysicsConfig { grid, density: default_density() },
            output: OutputConfig::default(),
            geometry: None,
        }
    }

    pub fn velocity_grid(&self) -> anyhow::Result<VelocityGrid> {
        VelocityGrid::for_dim(self.physics.grid, self.domain.dim())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let d = &self.domain;
        if d.global_size().iter().any(|&n| n == 0) {
            return Err(RunnerError::config(format!("empty lattice {:?}", d.global_size())).into());
        }
        if d.envelope_size == 0 {
            return Err(RunnerError::config("envelope_size must be at least 1").into());
        }
        if d.blocks == 0 || d.blocks > d.lat_nx {
            return Err(RunnerError::config(format!(
                "cannot split lat_nx={} across {} blocks", d.lat_nx, d.blocks
            ))
            .into());
        }
        if d.blocks > 1 && d.envelope_size != 1 {
            return Err(RunnerError::config(format!(
                "envelope_size {} cannot be exchanged between blocks, use 1", d.envelope_size
            ))
            .into());
        }
        if d.periodic_z && d.dim() != 3 {
            return Err(RunnerError::config("periodic_z requires a 3-D lattice").into());
        }
        if self.runner.block_size == 0 {
            return Err(RunnerError::config("block_size must be positive").into());
        }
        if self.runner.every == 0 {
            return Err(RunnerError::config("output period 'every' must be positive").into());
        }
        if self.geometry.is_some() && d.dim() != 3 {
            return Err(RunnerError::config("STL geometry requires a 3-D lattice").into());
        }
        self.velocity_grid()?;
        Ok(())
    }
}
