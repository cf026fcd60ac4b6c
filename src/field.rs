//! Host-resident macroscopic fields and their device mirrors.

use crate::{
    backend::{Backend, BackendExt, BufferId},
    error::RunnerError,
    layout::PhysicalLayout,
    Float,
};

/// Handle of a scalar field (or a vector component) in a `FieldStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(usize);

impl FieldId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle of a vector field, a group of `dim` scalar components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorFieldId(usize);

/// One scalar array shaped to the physical layout of the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub shape: Vec<usize>,
    /// Byte strides, fastest axis last.
    pub strides: Vec<usize>,
    pub data: Vec<Float>,
}

#[cfg(test)]
impl Field {
    /// Value at a multi-index ordered like `shape`.
    pub fn at(&self, index: &[usize]) -> Float {
        let elem = std::mem::size_of::<Float>();
        let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        self.data[offset / elem]
    }
}

/// Named field waiting to be registered with the output writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRegistration {
    Scalar(String, FieldId),
    Vector(String, VectorFieldId),
}

pub struct FieldStore {
    layout: PhysicalLayout,
    scalars: Vec<Field>,
    vectors: Vec<Vec<FieldId>>,
    device: Vec<Option<BufferId>>,
    registrations: Vec<OutputRegistration>,
}

impl FieldStore {
    pub fn new(layout: PhysicalLayout) -> Self {
        Self {
            layout,
            scalars: Vec::new(),
            vectors: Vec::new(),
            device: Vec::new(),
            registrations: Vec::new(),
        }
    }

    pub fn layout(&self) -> &PhysicalLayout {
        &self.layout
    }

    /// Allocates a zeroed scalar field; named fields are queued for output.
    pub fn allocate_scalar(&mut self, name: Option<&str>) -> FieldId {
        let field = Field {
            shape: self.layout.physical_size.clone(),
            strides: self.layout.strides(std::mem::size_of::<Float>()),
            data: vec![0.0; self.layout.num_nodes()],
        };
        self.scalars.push(field);
        self.device.push(None);
        let id = FieldId(self.scalars.len() - 1);
        if let Some(name) = name {
            self.registrations.push(OutputRegistration::Scalar(name.to_string(), id));
        }
        id
    }

    /// Allocates one scalar component per lattice dimension.
    pub fn allocate_vector(&mut self, name: Option<&str>) -> VectorFieldId {
        let components = (0..self.layout.dim()).map(|_| self.allocate_scalar(None)).collect();
        self.vectors.push(components);
        let id = VectorFieldId(self.vectors.len() - 1);
        if let Some(name) = name {
            self.registrations.push(OutputRegistration::Vector(name.to_string(), id));
        }
        id
    }

    pub fn take_registrations(&mut self) -> Vec<OutputRegistration> {
        std::mem::take(&mut self.registrations)
    }

    pub fn len(&self) -> usize {
        self.scalars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty()
    }

    pub fn field(&self, id: FieldId) -> anyhow::Result<&Field> {
        self.scalars
            .get(id.0)
            .ok_or_else(|| RunnerError::UnknownField(id.0).into())
    }

    pub fn field_mut(&mut self, id: FieldId) -> anyhow::Result<&mut Field> {
        self.scalars
            .get_mut(id.0)
            .ok_or_else(|| RunnerError::UnknownField(id.0).into())
    }

    pub fn components(&self, id: VectorFieldId) -> anyhow::Result<&[FieldId]> {
        self.vectors
            .get(id.0)
            .map(|c| c.as_slice())
            .ok_or_else(|| RunnerError::UnknownField(id.0).into())
    }

    /// Allocates the device buffer backing `id` and uploads its host data.
    /// Mirroring twice returns the existing buffer.
    pub fn mirror_to_device(&mut self, backend: &mut dyn Backend, id: FieldId) -> anyhow::Result<BufferId> {
        let field = self
            .scalars
            .get(id.0)
            .ok_or(RunnerError::UnknownField(id.0))?;
        if let Some(buf) = self.device[id.0] {
            return Ok(buf);
        }
        let buf = backend.alloc_like(&field.data, &format!("field {}", id.0))?;
        self.device[id.0] = Some(buf);
        Ok(buf)
    }

    pub fn mirror_all(&mut self, backend: &mut dyn Backend) -> anyhow::Result<()> {
        for i in 0..self.scalars.len() {
            self.mirror_to_device(backend, FieldId(i))?;
        }
        Ok(())
    }

    pub fn device_buffer(&self, id: FieldId) -> anyhow::Result<BufferId> {
        self.device
            .get(id.0)
            .copied()
            .flatten()
            .ok_or_else(|| RunnerError::UnknownField(id.0).into())
    }

    /// Host to device copy of one mirrored field.
    pub fn upload(&self, backend: &mut dyn Backend, id: FieldId) -> anyhow::Result<()> {
        let buf = self.device_buffer(id)?;
        backend.upload(buf, &self.field(id)?.data)
    }

    pub fn upload_all(&self, backend: &mut dyn Backend) -> anyhow::Result<()> {
        for (field, buf) in self.scalars.iter().zip(&self.device) {
            if let Some(buf) = buf {
                backend.upload(*buf, &field.data)?;
            }
        }
        Ok(())
    }

    /// Copies every mirrored field back into its host array.
    pub fn flush_to_host(&mut self, backend: &mut dyn Backend) -> anyhow::Result<()> {
        for (field, buf) in self.scalars.iter_mut().zip(&self.device) {
            if let Some(buf) = buf {
                backend.download(*buf, &mut field.data)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;

    fn store() -> FieldStore {
        FieldStore::new(PhysicalLayout::new(&[6, 4], 4).unwrap())
    }

    #[test]
    fn scalar_shape_and_strides() {
        let mut fields = store();
        let rho = fields.allocate_scalar(Some("rho"));
        let field = fields.field(rho).unwrap();
        assert_eq!(field.shape, vec![4, 8]);
        assert_eq!(field.strides, vec![32, 4]);
        assert_eq!(field.data.len(), 32);
        assert_eq!(
            fields.take_registrations(),
            vec![OutputRegistration::Scalar("rho".into(), rho)]
        );
    }

    #[test]
    fn vector_has_dim_components() {
        let mut fields = store();
        let v = fields.allocate_vector(Some("v"));
        assert_eq!(fields.components(v).unwrap().len(), 2);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.take_registrations().len(), 1);
    }

    #[test]
    fn mirror_flush_roundtrip() {
        let mut backend = HostBackend::new();
        let mut fields = store();
        let a = fields.allocate_scalar(None);
        let buf = fields.mirror_to_device(&mut backend, a).unwrap();
        assert_eq!(fields.mirror_to_device(&mut backend, a).unwrap(), buf);

        let values: Vec<Float> = (0..32).map(|v| v as Float).collect();
        backend.upload(buf, &values).unwrap();
        fields.flush_to_host(&mut backend).unwrap();
        assert_eq!(fields.field(a).unwrap().data, values);
        assert_eq!(fields.field(a).unwrap().at(&[1, 2]), 10.0);
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut backend = HostBackend::new();
        let mut other = store();
        other.allocate_scalar(None);
        let foreign = other.allocate_scalar(None);

        let mut fields = store();
        let err = fields.mirror_to_device(&mut backend, foreign).unwrap_err();
        assert_eq!(err.downcast_ref::<RunnerError>(), Some(&RunnerError::UnknownField(1)));
        assert!(fields.device_buffer(foreign).is_err());
    }
}
