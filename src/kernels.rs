//! Code generation context and the ghost exchange kernels.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::{
    backend::{BufferId, KernelEntry, KernelSource, KernelUnit},
    error::RunnerError,
    host::{HostKernel, HostMemory, Launch},
};

pub const COLLECT_KERNEL: &str = "CollectXGhostData";
pub const DISTRIBUTE_KERNEL: &str = "DistributeXGhostData";

/// Named values consumed by kernel source providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CodegenContext {
    values: BTreeMap<String, Value>,
}

impl CodegenContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn extend(&mut self, other: CodegenContext) {
        self.values.extend(other.values);
    }

    pub fn get_usize(&self, key: &str) -> anyhow::Result<usize> {
        self.values
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .ok_or_else(|| RunnerError::config(format!("codegen context lacks integer '{}'", key)).into())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(v) => v.as_u64().is_some_and(|n| n != 0),
            None => false,
        }
    }
}

fn ghost_wgsl(size: usize, block_size: usize) -> String {
    format!(
        r#"const DISTRIB_COLLECT_SIZE: u32 = {size}u;

@group(0) @binding(0) var<storage, read> ghost_idx: array<u32>;
@group(0) @binding(1) var<storage, read_write> dist: array<f32>;
@group(0) @binding(2) var<storage, read_write> ghost_buf: array<f32>;

@compute @workgroup_size({block_size})
fn {collect}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= DISTRIB_COLLECT_SIZE) {{
        return;
    }}
    ghost_buf[i] = dist[ghost_idx[i]];
}}

@compute @workgroup_size({block_size})
fn {distribute}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= DISTRIB_COLLECT_SIZE) {{
        return;
    }}
    dist[ghost_idx[i]] = ghost_buf[i];
}}
"#,
        collect = COLLECT_KERNEL,
        distribute = DISTRIBUTE_KERNEL,
    )
}

// args: [index table, distributions, send buffer]
fn host_collect(size: usize) -> HostKernel {
    Arc::new(move |mem: &mut HostMemory, args: &[BufferId], launch: &Launch| {
        let idx = mem.words(args[0])?.to_vec();
        let mut buf = mem.take(args[2])?;
        {
            let dist = mem.floats(args[1])?;
            for [i, _, _] in launch.threads() {
                if i < size {
                    buf[i] = dist[idx[i] as usize];
                }
            }
        }
        mem.restore(args[2], buf)
    })
}

// args: [index table, distributions, receive buffer]
fn host_distribute(size: usize) -> HostKernel {
    Arc::new(move |mem: &mut HostMemory, args: &[BufferId], launch: &Launch| {
        let idx = mem.words(args[0])?.to_vec();
        let buf = mem.floats(args[2])?.to_vec();
        let dist = mem.floats_mut(args[1])?;
        for [i, _, _] in launch.threads() {
            if i < size {
                dist[idx[i] as usize] = buf[i];
            }
        }
        Ok(())
    })
}

/// Gather/scatter kernels moving ghost data between a block's distribution
/// storage and its flat exchange buffers. Sized by `distrib_collect_size`.
pub fn ghost_exchange_source(ctx: &CodegenContext) -> anyhow::Result<KernelSource> {
    let size = ctx.get_usize("distrib_collect_size")?;
    let block_size = ctx.get_usize("block_size")?;
    Ok(KernelSource::new().with_unit(KernelUnit {
        label: "ghost_exchange".to_string(),
        wgsl: ghost_wgsl(size, block_size),
        entries: vec![
            KernelEntry { name: COLLECT_KERNEL.to_string(), host: host_collect(size) },
            KernelEntry { name: DISTRIBUTE_KERNEL.to_string(), host: host_distribute(size) },
        ],
    }))
}
