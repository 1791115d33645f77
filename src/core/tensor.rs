use crate::core::types::{DataType, Shape};
use crate::error::RuntimeError;

/// Host tensor: typed view over little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: Shape,
    data: Vec<u8>,
}

impl Tensor {
    pub fn from_bytes(dtype: DataType, shape: Shape, data: Vec<u8>) -> anyhow::Result<Self> {
        let expected = shape.byte_size(dtype);
        if expected != data.len() {
            return Err(RuntimeError::malformed(format!(
                "Tensor of shape {} and type {:?} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> anyhow::Result<Self> {
        Self::from_bytes(DataType::F32, shape, bytemuck::cast_slice(values).to_vec())
    }

    pub fn from_i64(shape: Shape, values: &[i64]) -> anyhow::Result<Self> {
        Self::from_bytes(DataType::I64, shape, bytemuck::cast_slice(values).to_vec())
    }

    /// 1-D int64 tensor, the layout of sampler id buffers.
    pub fn ids(values: &[i64]) -> Self {
        Self {
            dtype: DataType::I64,
            shape: Shape::new(vec![values.len()]),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self {
            dtype: DataType::I64,
            shape: Shape::scalar(),
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn to_f32_vec(&self) -> anyhow::Result<Vec<f32>> {
        if self.dtype != DataType::F32 {
            anyhow::bail!("Tensor holds {:?}, not F32", self.dtype);
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    pub fn to_i64_vec(&self) -> anyhow::Result<Vec<i64>> {
        if self.dtype != DataType::I64 {
            anyhow::bail!("Tensor holds {:?}, not I64", self.dtype);
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Element `index` of an int64 tensor.
    pub fn item_i64(&self, index: usize) -> anyhow::Result<i64> {
        let values = self.to_i64_vec()?;
        values.get(index).copied().ok_or_else(|| {
            RuntimeError::unexpected(format!(
                "Index {} out of range for tensor of {} elements",
                index,
                values.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mismatch_is_rejected() {
        let err = Tensor::from_bytes(DataType::F32, Shape::new(vec![3]), vec![0; 8]).unwrap_err();
        assert!(matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::MalformedGraph(_))));
    }

    #[test]
    fn typed_views() {
        let t = Tensor::from_f32(Shape::new(vec![2]), &[1.5, -2.0]).unwrap();
        assert_eq!(t.byte_size(), 8);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.5, -2.0]);
        assert!(t.to_i64_vec().is_err());

        let ids = Tensor::ids(&[5, 2, 8]);
        assert_eq!(ids.item_i64(2).unwrap(), 8);
        assert!(ids.item_i64(3).is_err());
    }
}
