use std::ops::Range;

use crate::{error::RunnerError, kernels::CodegenContext, lattice::VelocityGrid};

pub type BlockId = usize;

/// Side of a block along a connection axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    /// Towards lower coordinates (direction -1).
    Lower,
    /// Towards higher coordinates (direction +1).
    Upper,
}

impl Side {
    pub fn direction(self) -> i32 {
        match self {
            Side::Lower => -1,
            Side::Upper => 1,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Lower => Side::Upper,
            Side::Upper => Side::Lower,
        }
    }
}

/// Shared boundary of two blocks, in the local interior coordinates of the
/// block holding the span. `rows[0]` spans Y, `rows[1]` spans Z (3-D only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpan {
    pub rows: Vec<Range<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub neighbor: BlockId,
    pub axis: usize,
    pub side: Side,
    pub span: ConnectionSpan,
}

/// A rectangular sub-region of the global lattice.
///
/// `offset` and `size` describe the interior only and are ordered X first.
/// The envelope of ghost nodes surrounds the interior on every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub offset: Vec<usize>,
    pub size: Vec<usize>,
    pub envelope_size: usize,
    pub periodic: [bool; 3],
    connections: Vec<Connection>,
}

impl Block {
    pub fn new(id: BlockId, offset: Vec<usize>, size: Vec<usize>, envelope_size: usize) -> Self {
        Self {
            id,
            offset,
            size,
            envelope_size,
            periodic: [false; 3],
            connections: Vec::new(),
        }
    }

    pub fn with_periodicity(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn dim(&self) -> usize {
        self.size.len()
    }

    /// Extent of the block arrays along each axis (X first), envelope included.
    pub fn actual_size(&self) -> Vec<usize> {
        self.size.iter().map(|n| n + 2 * self.envelope_size).collect()
    }

    pub fn periodic_x(&self) -> bool {
        self.periodic[0]
    }

    pub fn periodic_y(&self) -> bool {
        self.periodic[1]
    }

    pub fn periodic_z(&self) -> bool {
        self.dim() == 3 && self.periodic[2]
    }

    pub fn add_connection(&mut self, connection: Connection) {
        self.connections.push(connection);
        self.connections.sort_by_key(|c| (c.neighbor, c.axis, c.side));
    }

    /// Connections in exchange order: by neighbor, then axis, then side.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connecting_blocks(&self) -> Vec<(usize, Side, BlockId)> {
        self.connections
            .iter()
            .map(|c| (c.axis, c.side, c.neighbor))
            .collect()
    }

    /// Distinct neighbor ids in exchange order.
    pub fn neighbors(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.connections.iter().map(|c| c.neighbor).collect();
        ids.dedup();
        ids
    }

    pub fn get_connection_span(&self, axis: usize, side: Side, neighbor: BlockId) -> Option<&ConnectionSpan> {
        self.connections
            .iter()
            .find(|c| c.axis == axis && c.side == side && c.neighbor == neighbor)
            .map(|c| &c.span)
    }

    /// Array rows (envelope included) exchanged over a connection with
    /// `span`, `[Y, Z]` order. Along a periodic axis a span over the whole
    /// extent also carries the envelope rows on both sides.
    pub fn exchange_rows(&self, span: &ConnectionSpan) -> Vec<Range<usize>> {
        let env = self.envelope_size;
        span.rows
            .iter()
            .enumerate()
            .map(|(i, rows)| {
                let axis = i + 1;
                if self.periodic[axis] && rows.start == 0 && rows.end == self.size[axis] {
                    0..rows.end + 2 * env
                } else {
                    rows.start + env..rows.end + env
                }
            })
            .collect()
    }

    /// Number of distribution values exchanged over one connection.
    pub fn connection_buf_size(&self, grid: &VelocityGrid, axis: usize, side: Side, neighbor: BlockId) -> usize {
        self.get_connection_span(axis, side, neighbor)
            .map(|span| {
                let nodes: usize = self.exchange_rows(span).iter().map(|r| r.len()).product();
                nodes * grid.prop_dists(side.direction(), axis).len()
            })
            .unwrap_or(0)
    }

    pub fn update_context(&self, ctx: &mut CodegenContext) {
        ctx.insert("block_id", self.id);
        ctx.insert("envelope_size", self.envelope_size);
        ctx.insert("dim", self.dim());
        ctx.insert("block_offset", self.offset.clone());
    }

    /// Connects `lower` and `upper` along X if `lower`'s interior ends where
    /// `upper`'s begins (`wrap` treats the global X extent as periodic) and
    /// the orthogonal extents overlap. Returns whether a connection was made.
    pub fn connect_x(lower: &mut Block, upper: &mut Block, wrap: bool) -> anyhow::Result<bool> {
        if lower.dim() != upper.dim() || lower.envelope_size != upper.envelope_size {
            return Err(RunnerError::config(format!(
                "blocks {} and {} have incompatible geometry", lower.id, upper.id
            ))
            .into());
        }
        let touching = wrap || lower.offset[0] + lower.size[0] == upper.offset[0];
        if !touching {
            return Ok(false);
        }

        let mut lower_rows = Vec::new();
        let mut upper_rows = Vec::new();
        for axis in 1..lower.dim() {
            let start = lower.offset[axis].max(upper.offset[axis]);
            let end = (lower.offset[axis] + lower.size[axis]).min(upper.offset[axis] + upper.size[axis]);
            if start >= end {
                return Ok(false);
            }
            lower_rows.push(start - lower.offset[axis]..end - lower.offset[axis]);
            upper_rows.push(start - upper.offset[axis]..end - upper.offset[axis]);
        }

        lower.add_connection(Connection {
            neighbor: upper.id,
            axis: 0,
            side: Side::Upper,
            span: ConnectionSpan { rows: lower_rows },
        });
        upper.add_connection(Connection {
            neighbor: lower.id,
            axis: 0,
            side: Side::Lower,
            span: ConnectionSpan { rows: upper_rows },
        });
        Ok(true)
    }
}

/// Splits the global lattice (X first) into `count` slabs of near-equal
/// width along X and connects adjacent slabs.
///
/// With periodic X and more than one slab, the first and last slabs are
/// connected across the wrap and the slabs lose their local X periodicity.
pub fn decompose_x(
    global_size: &[usize],
    count: usize,
    envelope_size: usize,
    periodic: [bool; 3],
) -> anyhow::Result<Vec<Block>> {
    if count == 0 {
        return Err(RunnerError::config("at least one block is required").into());
    }
    if !(2..=3).contains(&global_size.len()) {
        return Err(RunnerError::config(format!(
            "unsupported lattice dimension {}", global_size.len()
        ))
        .into());
    }
    let nx = global_size[0];
    if count > nx {
        return Err(RunnerError::config(format!(
            "cannot split lat_nx={} across {} blocks", nx, count
        ))
        .into());
    }

    let base = nx / count;
    let rem = nx % count;
    let mut blocks = Vec::with_capacity(count);
    let mut cursor = 0;
    for id in 0..count {
        let width = base + usize::from(id < rem);
        let mut offset = vec![0; global_size.len()];
        offset[0] = cursor;
        let mut size = global_size.to_vec();
        size[0] = width;
        cursor += width;

        let mut block_periodic = periodic;
        if count > 1 {
            block_periodic[0] = false;
        }
        blocks.push(Block::new(id, offset, size, envelope_size).with_periodicity(block_periodic));
    }

    for id in 1..count {
        let (head, tail) = blocks.split_at_mut(id);
        Block::connect_x(&mut head[id - 1], &mut tail[0], false)?;
    }
    if periodic[0] && count > 1 {
        let (head, tail) = blocks.split_at_mut(count - 1);
        Block::connect_x(&mut tail[0], &mut head[0], true)?;
    }

    Ok(blocks)
}
