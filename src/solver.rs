use std::sync::Arc;

use anyhow::Result;
use futures::future::try_join_all;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info};

use crate::{
    backend::Backend,
    block::{decompose_x, Block},
    config::{BackendKind, Config},
    connector::{ChannelConnector, Connector, QuitEvent},
    error::RunnerError,
    geometry::{GeoBlock, OpenBox, StlGeometry},
    gpu::WgpuBackend,
    host::HostBackend,
    output::{NullWriter, OutputWriter, VtkWriter},
    runner::{BlockRunner, RunOutcome},
    streaming::FreeStreaming,
};

/// Runs every block of a decomposed lattice on its own thread.
pub struct Solver {
    config: Arc<Config>,
    runners: Vec<BlockRunner>,
    progress: MultiProgress,
}

async fn make_backend(kind: BackendKind) -> Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::Host => Box::new(HostBackend::new()),
        BackendKind::Wgpu => Box::new(WgpuBackend::new().await?),
    })
}

fn progress_bar(max_iters: usize, block: &Block) -> ProgressBar {
    let bar = if max_iters > 0 {
        let bar = ProgressBar::new(max_iters as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} ({eta})") {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        bar
    } else {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{prefix} {spinner:.cyan} {pos} iterations") {
            bar.set_style(style);
        }
        bar
    };
    bar.set_prefix(format!("block {}", block.id));
    bar
}

/// One connector pair per pair of neighboring blocks, indexed by block id.
fn connect(blocks: &[Block]) -> Vec<Vec<Box<dyn Connector>>> {
    let mut connectors: Vec<Vec<Box<dyn Connector>>> = blocks.iter().map(|_| Vec::new()).collect();
    for block in blocks {
        for neighbor in block.neighbors() {
            if block.id < neighbor {
                let (a, b) = ChannelConnector::pair(block.id, neighbor);
                connectors[block.id].push(Box::new(a));
                connectors[neighbor].push(Box::new(b));
            }
        }
    }
    connectors
}

impl Solver {
    pub async fn new(config: Config, quit: QuitEvent) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let d = &config.domain;
        info!("Initializing solver with domain size: {:?} in {} block(s)", d.global_size(), d.blocks);

        let blocks = decompose_x(&d.global_size(), d.blocks, d.envelope_size, d.periodicity())?;
        let grid = config.velocity_grid()?;
        let stl = match &config.geometry {
            Some(geo) => Some(StlGeometry::from_stl(&geo.stl, geo.dx)?),
            None => None,
        };

        let progress = MultiProgress::new();
        let mut connectors = connect(&blocks);
        let mut runners = Vec::with_capacity(blocks.len());
        for block in blocks {
            let geometry: Box<dyn GeoBlock> = match &stl {
                Some(stl) => Box::new(stl.clone()),
                None => Box::new(OpenBox::new()),
            };
            let output: Box<dyn OutputWriter> = if config.runner.output || config.runner.output_required {
                Box::new(VtkWriter::new(&config.output, &block))
            } else {
                Box::new(NullWriter)
            };
            let bar = progress.add(progress_bar(config.runner.max_iters, &block));
            let block_connectors = std::mem::take(&mut connectors[block.id]);
            let sim = Box::new(FreeStreaming::new(grid, config.physics.density));
            let backend = make_backend(config.runner.backend).await?;

            let runner = BlockRunner::new(config.clone(), block, sim, backend)?
                .with_geometry(geometry)
                .with_output(output)
                .with_connectors(block_connectors)
                .with_quit_event(quit.clone())
                .with_progress(bar);
            runners.push(runner);
        }

        Ok(Self { config, runners, progress })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_blocks(&self) -> usize {
        self.runners.len()
    }

    /// Runs all blocks to completion. Fails if any block fails.
    pub async fn run(self) -> Result<Vec<RunOutcome>> {
        let handles = self.runners.into_iter().map(|mut runner| {
            tokio::task::spawn_blocking(move || {
                let id = runner.block().id;
                runner.run().map(|outcome| (id, outcome))
            })
        });

        let results = try_join_all(handles)
            .await
            .map_err(|e| RunnerError::State(format!("block thread panicked: {}", e)))?;
        if let Err(e) = self.progress.clear() {
            debug!("Failed to clear progress bars: {}", e);
        }

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            let (id, outcome) = result?;
            info!("Block {}: {:?}", id, outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::GridModel;

    #[tokio::test]
    async fn blocks_run_in_lockstep() {
        let mut config = Config::for_lattice(&[24, 6], GridModel::D2Q9);
        config.domain.blocks = 3;
        config.domain.periodic_x = true;
        config.runner.block_size = 4;
        config.runner.max_iters = 7;
        let solver = Solver::new(config, QuitEvent::new()).await.unwrap();
        assert_eq!(solver.num_blocks(), 3);
        let outcomes = solver.run().await.unwrap();
        assert_eq!(outcomes, vec![RunOutcome::Completed { iterations: 7 }; 3]);
    }

    #[tokio::test]
    async fn quit_event_cancels_infinite_run() {
        let mut config = Config::for_lattice(&[16, 4], GridModel::D2Q9);
        config.domain.blocks = 2;
        config.runner.block_size = 4;
        let quit = QuitEvent::new();
        let solver = Solver::new(config, quit.clone()).await.unwrap();

        let setter = quit.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            setter.set();
        });
        let outcomes = solver.run().await.unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, RunOutcome::Cancelled { .. })));
    }

    #[test]
    fn ring_of_two_shares_one_connector_pair() {
        let blocks = decompose_x(&[16, 4], 2, 1, [true, false, false]).unwrap();
        let connectors = connect(&blocks);
        assert_eq!(connectors[0].len(), 1);
        assert_eq!(connectors[1].len(), 1);
        assert_eq!(connectors[0][0].neighbor(), 1);
    }
}
