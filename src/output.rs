use anyhow::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    block::Block,
    config::OutputConfig,
    field::{FieldId, FieldStore, VectorFieldId},
    layout::PhysicalLayout,
};

/// Sink for periodic snapshots of a block's macroscopic fields.
pub trait OutputWriter: Send {
    fn register_scalar(&mut self, name: &str, id: FieldId);

    fn register_vector(&mut self, name: &str, id: VectorFieldId);

    /// Node type map over the logical lattice (padding stripped).
    fn register_geometry(&mut self, _vis_map: &[u32]) {}

    fn save(&mut self, iteration: usize, fields: &FieldStore) -> Result<()>;
}

/// Writer that drops every snapshot.
#[derive(Debug, Default)]
pub struct NullWriter;

impl OutputWriter for NullWriter {
    fn register_scalar(&mut self, _name: &str, _id: FieldId) {}

    fn register_vector(&mut self, _name: &str, _id: VectorFieldId) {}

    fn save(&mut self, _iteration: usize, _fields: &FieldStore) -> Result<()> {
        Ok(())
    }
}

/// Legacy ASCII VTK writer for the interior nodes of one block.
pub struct VtkWriter {
    directory: PathBuf,
    base_name: String,
    block_id: usize,
    offset: Vec<usize>,
    size: Vec<usize>,
    envelope_size: usize,
    scalars: Vec<(String, FieldId)>,
    vectors: Vec<(String, VectorFieldId)>,
    geometry: Option<Vec<u32>>,
    collection_entries: Vec<(usize, String)>, // (iteration, filename)
}

impl VtkWriter {
    pub fn new(config: &OutputConfig, block: &Block) -> Self {
        Self {
            directory: PathBuf::from(&config.output_directory),
            base_name: config.base_name.clone(),
            block_id: block.id,
            offset: block.offset.clone(),
            size: block.size.clone(),
            envelope_size: block.envelope_size,
            scalars: Vec::new(),
            vectors: Vec::new(),
            geometry: None,
            collection_entries: Vec::new(),
        }
    }

    pub fn file_name(&self, iteration: usize) -> String {
        format!("{}.{}.{:06}.vtk", self.base_name, self.block_id, iteration)
    }

    /// Interior extent as `[nx, ny, nz]`.
    fn extent(&self) -> [usize; 3] {
        [self.size[0], self.size[1], self.size.get(2).copied().unwrap_or(1)]
    }

    /// Physical node indices of the interior, X fastest.
    fn interior_nodes(&self, layout: &PhysicalLayout) -> Vec<usize> {
        let env = self.envelope_size;
        let z_env = if self.size.len() == 3 { env } else { 0 };
        let [nx, ny, nz] = self.extent();
        let mut nodes = Vec::with_capacity(nx * ny * nz);
        for z in z_env..z_env + nz {
            for y in env..env + ny {
                for x in env..env + nx {
                    nodes.push(layout.node_index(x, y, z));
                }
            }
        }
        nodes
    }

    pub fn write(&mut self, path: &Path, iteration: usize, fields: &FieldStore) -> Result<()> {
        let layout = fields.layout();
        let nodes = self.interior_nodes(layout);
        let [nx, ny, nz] = self.extent();
        let mut file = BufWriter::new(File::create(path)?);

        writeln!(file, "# vtk DataFile Version 3.0")?;
        writeln!(file, "LBM block {} - Iteration {}", self.block_id, iteration)?;
        writeln!(file, "ASCII")?;
        writeln!(file, "DATASET STRUCTURED_POINTS")?;
        writeln!(file, "DIMENSIONS {} {} {}", nx, ny, nz)?;
        writeln!(
            file,
            "ORIGIN {} {} {}",
            self.offset[0],
            self.offset[1],
            self.offset.get(2).copied().unwrap_or(0)
        )?;
        writeln!(file, "SPACING 1 1 1")?;
        writeln!(file, "POINT_DATA {}", nodes.len())?;

        if let Some(map) = &self.geometry {
            let env = self.envelope_size;
            let z_env = if self.size.len() == 3 { env } else { 0 };
            let (lat_nx, lat_ny) = (layout.lat_nx(), layout.lat_ny());
            writeln!(file, "SCALARS node_type int")?;
            writeln!(file, "LOOKUP_TABLE default")?;
            for z in z_env..z_env + nz {
                for y in env..env + ny {
                    for x in env..env + nx {
                        writeln!(file, "{}", map[x + lat_nx * (y + lat_ny * z)])?;
                    }
                }
            }
        }

        for (name, id) in &self.scalars {
            let data = &fields.field(*id)?.data;
            writeln!(file, "SCALARS {} float", name)?;
            writeln!(file, "LOOKUP_TABLE default")?;
            for &n in &nodes {
                writeln!(file, "{:.6}", data[n])?;
            }
        }

        for (name, id) in &self.vectors {
            let components = fields
                .components(*id)?
                .iter()
                .map(|c| fields.field(*c).map(|f| f.data.as_slice()))
                .collect::<Result<Vec<_>>>()?;
            writeln!(file, "VECTORS {} float", name)?;
            for &n in &nodes {
                let v = |i: usize| components.get(i).map_or(0.0, |c| c[n]);
                writeln!(file, "{:.6} {:.6} {:.6}", v(0), v(1), v(2))?;
            }
        }

        file.flush()?;
        Ok(())
    }

    /// Write a ParaView collection file that groups all VTK files of this block.
    pub fn write_collection(&self, collection_filename: &Path) -> Result<()> {
        let mut file = File::create(collection_filename)?;

        writeln!(file, "<?xml version=\"1.0\"?>")?;
        writeln!(file, "<VTKFile type=\"Collection\" version=\"0.1\">")?;
        writeln!(file, "  <Collection>")?;
        for (iteration, filename) in &self.collection_entries {
            writeln!(file, "    <DataSet timestep=\"{}\" part=\"{}\" file=\"{}\"/>",
                     iteration, self.block_id, filename)?;
        }
        writeln!(file, "  </Collection>")?;
        writeln!(file, "</VTKFile>")?;

        Ok(())
    }

    pub fn collection_path(&self) -> PathBuf {
        self.directory.join(format!("{}.{}.pvd", self.base_name, self.block_id))
    }

    /// Get the number of files written so far
    pub fn get_file_count(&self) -> usize {
        self.collection_entries.len()
    }
}

impl OutputWriter for VtkWriter {
    fn register_scalar(&mut self, name: &str, id: FieldId) {
        self.scalars.push((name.to_string(), id));
    }

    fn register_vector(&mut self, name: &str, id: VectorFieldId) {
        self.vectors.push((name.to_string(), id));
    }

    fn register_geometry(&mut self, vis_map: &[u32]) {
        self.geometry = Some(vis_map.to_vec());
    }

    fn save(&mut self, iteration: usize, fields: &FieldStore) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let name = self.file_name(iteration);
        let path = self.directory.join(&name);
        self.write(&path, iteration, fields)?;
        self.collection_entries.push((iteration, name));
        self.write_collection(&self.collection_path())?;
        debug!("Wrote output file: {} ({} in collection)", path.display(), self.get_file_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::decompose_x;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lbm-blocks-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn writes_interior_only() {
        let blocks = decompose_x(&[6, 3], 1, 1, [false; 3]).unwrap();
        let block = &blocks[0];
        let layout = PhysicalLayout::new(&block.actual_size(), 4).unwrap();
        let mut fields = FieldStore::new(layout.clone());
        let rho = fields.allocate_scalar(Some("rho"));
        let v = fields.allocate_vector(Some("v"));
        {
            let data = &mut fields.field_mut(rho).unwrap().data;
            for y in 0..layout.lat_ny() {
                for x in 0..layout.lat_nx() {
                    data[layout.node_index(x, y, 0)] = (10 * y + x) as f32;
                }
            }
        }

        let dir = scratch_dir("vtk");
        let config = OutputConfig {
            output_directory: dir.to_string_lossy().into_owned(),
            base_name: "run".into(),
        };
        let mut writer = VtkWriter::new(&config, block);
        writer.register_scalar("rho", rho);
        writer.register_vector("v", v);
        writer.save(0, &fields).unwrap();
        writer.save(5, &fields).unwrap();

        let text = std::fs::read_to_string(dir.join("run.0.000005.vtk")).unwrap();
        assert!(text.contains("DIMENSIONS 6 3 1"));
        assert!(text.contains("POINT_DATA 18"));
        let rho_values: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.starts_with("SCALARS rho"))
            .skip(2)
            .take(18)
            .collect();
        // First interior row is y = 1, x = 1..=6.
        assert_eq!(rho_values[0], "11.000000");
        assert_eq!(rho_values[5], "16.000000");
        assert_eq!(rho_values[6], "21.000000");
        assert!(text.contains("VECTORS v float"));

        let pvd = std::fs::read_to_string(writer.collection_path()).unwrap();
        assert_eq!(pvd.matches("<DataSet").count(), 2);
        assert_eq!(writer.get_file_count(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
