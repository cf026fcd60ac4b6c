pub mod backend;
pub mod block;
pub mod config;
pub mod connector;
pub mod error;
pub mod field;
pub mod geometry;
pub mod ghost;
pub mod gpu;
pub mod host;
pub mod kernels;
pub mod lattice;
pub mod layout;
pub mod output;
pub mod runner;
pub mod sim;
pub mod solver;
pub mod streaming;

pub use backend::{Backend, BackendExt};
pub use block::{decompose_x, Block};
pub use config::Config;
pub use connector::{ChannelConnector, Connector, QuitEvent};
pub use error::RunnerError;
pub use host::HostBackend;
pub use gpu::WgpuBackend;
pub use layout::PhysicalLayout;
pub use runner::{BlockRunner, RunOutcome};
pub use solver::Solver;
pub use streaming::FreeStreaming;

pub type Float = f32;
