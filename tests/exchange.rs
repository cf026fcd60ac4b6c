use std::sync::Arc;
use std::thread;

use lbm_blocks::{
    block::Side,
    config::Config,
    connector::Connector,
    lattice::{GridModel, VelocityGrid},
    runner::RunOutcome,
    streaming::InitialState,
    BlockRunner, ChannelConnector, FreeStreaming, HostBackend, QuitEvent, decompose_x,
};

fn sloped_density() -> InitialState {
    Arc::new(|g: [i64; 3]| (1.0 + 0.01 * g[0] as f32 + 0.001 * g[1] as f32 + 0.0001 * g[2] as f32, [0.0; 3]))
}

/// Like `sloped_density`, with coordinates wrapped along periodic axes.
fn wrapped_density(size: &[usize], periodic: [bool; 3]) -> InitialState {
    let size = size.to_vec();
    Arc::new(move |g: [i64; 3]| {
        let mut c = [0i64; 3];
        for axis in 0..size.len() {
            c[axis] = if periodic[axis] { g[axis].rem_euclid(size[axis] as i64) } else { g[axis] };
        }
        (1.0 + 0.01 * c[0] as f32 + 0.001 * c[1] as f32 + 0.0001 * c[2] as f32, [0.0; 3])
    })
}

/// Runs the X slabs of a lattice on threads and returns the stopped runners.
fn run_blocks(
    size: &[usize],
    grid: GridModel,
    blocks: usize,
    periodic: [bool; 3],
    max_iters: usize,
    density: InitialState,
) -> Vec<BlockRunner> {
    let mut config = Config::for_lattice(size, grid);
    config.domain.blocks = blocks;
    config.domain.periodic_x = periodic[0];
    config.domain.periodic_y = periodic[1];
    config.domain.periodic_z = periodic[2];
    config.runner.block_size = 4;
    config.runner.max_iters = max_iters;
    config.validate().unwrap();
    let config = Arc::new(config);
    let velocity_grid = config.velocity_grid().unwrap();

    let chain = decompose_x(size, blocks, 1, periodic).unwrap();
    let mut connectors: Vec<Vec<Box<dyn Connector>>> = chain.iter().map(|_| Vec::new()).collect();
    for block in &chain {
        for neighbor in block.neighbors() {
            if block.id < neighbor {
                let (a, b) = ChannelConnector::pair(block.id, neighbor);
                connectors[block.id].push(Box::new(a));
                connectors[neighbor].push(Box::new(b));
            }
        }
    }

    let quit = QuitEvent::new();
    let handles: Vec<_> = chain
        .into_iter()
        .zip(connectors)
        .map(|(block, conns)| {
            let sim = Box::new(FreeStreaming::with_initial_state(velocity_grid, density.clone()));
            let mut runner = BlockRunner::new(config.clone(), block, sim, Box::new(HostBackend::new()))
                .unwrap()
                .with_connectors(conns)
                .with_quit_event(quit.clone());
            thread::spawn(move || {
                let outcome = runner.run().unwrap();
                assert_eq!(outcome, RunOutcome::Completed { iterations: max_iters });
                runner
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn run_chain(size: &[usize], grid: GridModel, blocks: usize, max_iters: usize) -> Vec<BlockRunner> {
    run_blocks(size, grid, blocks, [false; 3], max_iters, sloped_density())
}

/// Runs the lattice once as a single block and once split into `blocks`
/// slabs, and checks that every interior value of every slab equals the
/// single-block value at the same global node.
fn assert_matches_single_block(size: &[usize], grid: GridModel, blocks: usize, periodic: [bool; 3], iters: usize) {
    let density = wrapped_density(size, periodic);
    let mut whole = run_blocks(size, grid, 1, periodic, iters, density.clone());
    let mut parts = run_blocks(size, grid, blocks, periodic, iters, density);

    // Odd iteration counts end on the secondary buffer.
    let which = iters % 2;
    let whole_layout = whole[0].layout().clone();
    let whole_dist = whole[0].core_mut().download_dist(0, which).unwrap();
    let q = VelocityGrid::for_dim(grid, size.len()).unwrap().q();

    let mut checked = 0;
    for part in &mut parts {
        let layout = part.layout().clone();
        let dist = part.core_mut().download_dist(0, which).unwrap();
        let block = part.block().clone();
        let z_range = if size.len() == 3 { 1..=size[2] } else { 0..=0 };
        for z in z_range {
            for y in 1..=size[1] {
                for x in 1..=block.size[0] {
                    let wx = block.offset[0] + x;
                    for d in 0..q {
                        let got = dist[layout.node_index(x, y, z) + layout.num_nodes() * d];
                        let want = whole_dist[whole_layout.node_index(wx, y, z) + whole_layout.num_nodes() * d];
                        assert_eq!(
                            got, want,
                            "periodic={:?} blocks={} block={} x={} y={} z={} d={}",
                            periodic, blocks, block.id, x, y, z, d
                        );
                        checked += 1;
                    }
                }
            }
        }
    }
    assert!(checked > 0);
}

/// Checks that `upper`'s lower ghost plane holds `lower`'s last interior
/// plane for the +X directions, and the reverse for the -X directions.
fn assert_ghosts_match(lower: &mut BlockRunner, upper: &mut BlockRunner, grid: &VelocityGrid) {
    // After an even number of iterations the last distributed data sits in
    // the secondary buffers.
    let lo_layout = lower.layout().clone();
    let up_layout = upper.layout().clone();
    let lo_dist = lower.core_mut().download_dist(0, 1).unwrap();
    let up_dist = upper.core_mut().download_dist(0, 1).unwrap();

    let size = lower.block().size.clone();
    let z_range = if size.len() == 3 { 1..=size[2] } else { 0..=0 };
    let lo_last = lo_layout.lat_nx() - 2;
    let lo_ghost = lo_layout.lat_nx() - 1;
    let mut checked = 0;
    for z in z_range {
        for y in 1..=size[1] {
            for d in grid.prop_dists(1, 0) {
                let sent = lo_dist[lo_layout.node_index(lo_last, y, z) + lo_layout.num_nodes() * d];
                let ghost = up_dist[up_layout.node_index(0, y, z) + up_layout.num_nodes() * d];
                assert_eq!(sent, ghost, "+x d={} y={} z={}", d, y, z);
                checked += 1;
            }
            for d in grid.prop_dists(-1, 0) {
                let sent = up_dist[up_layout.node_index(1, y, z) + up_layout.num_nodes() * d];
                let ghost = lo_dist[lo_layout.node_index(lo_ghost, y, z) + lo_layout.num_nodes() * d];
                assert_eq!(sent, ghost, "-x d={} y={} z={}", d, y, z);
            }
        }
    }
    assert!(checked > 0);
}

#[test]
fn split_chain_matches_single_block() {
    assert_matches_single_block(&[12, 6], GridModel::D2Q9, 3, [false; 3], 3);
}

#[test]
fn split_ring_matches_single_block() {
    assert_matches_single_block(&[12, 6], GridModel::D2Q9, 2, [true, false, false], 3);
    assert_matches_single_block(&[12, 6], GridModel::D2Q9, 3, [true, false, false], 4);
}

#[test]
fn periodic_y_seams_match_single_block() {
    assert_matches_single_block(&[12, 6], GridModel::D2Q9, 2, [false, true, false], 3);
    assert_matches_single_block(&[12, 6], GridModel::D2Q9, 3, [true, true, false], 5);
}

#[test]
fn periodic_z_seams_match_single_block() {
    assert_matches_single_block(&[8, 4, 4], GridModel::D3Q19, 2, [true, false, true], 3);
}

#[test]
fn chain_of_three_exchanges_ghost_columns() {
    let mut runners = run_chain(&[30, 10], GridModel::D2Q9, 3, 2);
    assert_eq!(runners[1].ghost_tables().collect_size(), 2 * 10 * 3);
    assert_eq!(runners[0].ghost_tables().collect_size(), 10 * 3);
    assert!(runners[1].ghost_tables().segment(0, Side::Lower).is_some());
    assert!(runners[1].ghost_tables().segment(2, Side::Upper).is_some());

    let grid = VelocityGrid::D2Q9;
    let (head, tail) = runners.split_at_mut(1);
    assert_ghosts_match(&mut head[0], &mut tail[0], &grid);
    let (head, tail) = runners.split_at_mut(2);
    assert_ghosts_match(&mut head[1], &mut tail[0], &grid);
}

#[test]
fn three_dimensional_pair_exchanges_ghost_planes() {
    let mut runners = run_chain(&[12, 5, 4], GridModel::D3Q19, 2, 2);
    assert_eq!(runners[0].ghost_tables().collect_size(), 5 * 4 * 5);
    let (head, tail) = runners.split_at_mut(1);
    assert_ghosts_match(&mut head[0], &mut tail[0], &VelocityGrid::D3Q19);
}

#[test]
fn uneven_chain_finishes_in_lockstep() {
    let runners = run_chain(&[23, 7], GridModel::D2Q9, 4, 9);
    for runner in &runners {
        assert_eq!(runner.iteration(), 9);
    }
    let widths: Vec<usize> = runners.iter().map(|r| r.block().size[0]).collect();
    assert_eq!(widths, vec![6, 6, 6, 5]);
}
