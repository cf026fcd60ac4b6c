//! Index tables mapping a block's distribution storage to its ghost
//! exchange buffers.
//!
//! Tables are built locally on every block from the shared connection
//! topology and never exchanged. For a connection on side `s`, entry `i` of
//! this block's segment corresponds to entry `i` of the neighbor's segment
//! on side `-s`: both enumerate the same boundary rows (z outer, y inner)
//! and, per row, the same propagating directions in table order.

use crate::{
    block::{Block, BlockId, Side},
    error::RunnerError,
    lattice::VelocityGrid,
    layout::PhysicalLayout,
};

/// The part of the exchange buffers owned by one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostSegment {
    pub neighbor: BlockId,
    pub axis: usize,
    pub side: Side,
    pub offset: usize,
    pub len: usize,
    /// Boundary nodes in one plane of the connection.
    pub nodes: usize,
    pub dists_collect: Vec<usize>,
    pub dists_distrib: Vec<usize>,
}

impl GhostSegment {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhostIndexTables {
    pub collect_idx: Vec<u32>,
    pub distrib_idx: Vec<u32>,
    segments: Vec<GhostSegment>,
}

impl GhostIndexTables {
    pub fn build(block: &Block, layout: &PhysicalLayout, grid: &VelocityGrid) -> anyhow::Result<Self> {
        let env = block.envelope_size;
        let num_nodes = layout.num_nodes();
        let lat_nx = layout.lat_nx();

        if env != 1 && !block.connections().is_empty() {
            return Err(RunnerError::config(format!(
                "block {}: ghost exchange needs envelope_size 1, got {}", block.id, env
            ))
            .into());
        }

        let mut segments = Vec::with_capacity(block.connections().len());
        let mut total = 0;
        for conn in block.connections() {
            if conn.axis != 0 {
                return Err(RunnerError::config(format!(
                    "block {}: connections along non-X axis {} unsupported", block.id, conn.axis
                ))
                .into());
            }
            let dists_collect = grid.prop_dists(conn.side.direction(), conn.axis);
            let dists_distrib = grid.prop_dists(-conn.side.direction(), conn.axis);
            let nodes: usize = block.exchange_rows(&conn.span).iter().map(|r| r.len()).product();
            let len = block.connection_buf_size(grid, conn.axis, conn.side, conn.neighbor);
            segments.push(GhostSegment {
                neighbor: conn.neighbor,
                axis: conn.axis,
                side: conn.side,
                offset: total,
                len,
                nodes,
                dists_collect,
                dists_distrib,
            });
            total += len;
        }

        let mut collect_idx = vec![0u32; total];
        let mut distrib_idx = vec![0u32; total];

        for (conn, seg) in block.connections().iter().zip(&segments) {
            // Collection reads the in-domain plane next to the boundary,
            // distribution writes the ghost plane one envelope further out.
            let (collect_x, distrib_x) = match conn.side {
                Side::Lower => (env, env - env),
                Side::Upper => (lat_nx - 1 - env, lat_nx - 1 - env + env),
            };

            let rows = block.exchange_rows(&conn.span);
            let y_rows = rows[0].clone();
            let z_rows = rows.get(1).cloned().unwrap_or(0..1);

            let mut i = seg.offset;
            for z in z_rows {
                for y in y_rows.clone() {
                    for (&dc, &dd) in seg.dists_collect.iter().zip(&seg.dists_distrib) {
                        collect_idx[i] = (layout.node_index(collect_x, y, z) + num_nodes * dc) as u32;
                        distrib_idx[i] = (layout.node_index(distrib_x, y, z) + num_nodes * dd) as u32;
                        i += 1;
                    }
                }
            }
            debug_assert_eq!(i, seg.offset + seg.len);
        }

        Ok(Self { collect_idx, distrib_idx, segments })
    }

    /// Total length of the send (and receive) buffer.
    pub fn collect_size(&self) -> usize {
        self.collect_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collect_idx.is_empty()
    }

    pub fn segments(&self) -> &[GhostSegment] {
        &self.segments
    }

    pub fn segment(&self, neighbor: BlockId, side: Side) -> Option<&GhostSegment> {
        self.segments.iter().find(|s| s.neighbor == neighbor && s.side == side)
    }

    /// Segments sent to `neighbor`, in wire order (lower side first).
    pub fn send_segments(&self, neighbor: BlockId) -> Vec<&GhostSegment> {
        [Side::Lower, Side::Upper]
            .into_iter()
            .filter_map(|side| self.segment(neighbor, side))
            .collect()
    }

    /// Segments filled by a message from `neighbor`, in wire order. The
    /// neighbor's lower side faces this block's upper side, so the order is
    /// the mirror of `send_segments`.
    pub fn recv_segments(&self, neighbor: BlockId) -> Vec<&GhostSegment> {
        [Side::Upper, Side::Lower]
            .into_iter()
            .filter_map(|side| self.segment(neighbor, side))
            .collect()
    }

    /// Number of values exchanged with `neighbor` in each direction.
    pub fn message_len(&self, neighbor: BlockId) -> usize {
        self.send_segments(neighbor).iter().map(|s| s.len).sum()
    }
}
