use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    Bool,
    I8,
    U8,
    I16,
    F16,
    I32,
    U32,
    #[default]
    F32,
    I64,
    F64,
    /// Untyped bytes (workspaces)
    Unknown,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::I8 | DataType::U8 | DataType::Unknown => 1,
            DataType::I16 | DataType::F16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }
}

/// Device layout tag of a buffer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Default,
    Nchw,
    Nhwc,
    Nc1hwc0,
    FracZ,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Default => "DefaultFormat",
            Format::Nchw => "NCHW",
            Format::Nhwc => "NHWC",
            Format::Nc1hwc0 => "NC1HWC0",
            Format::FracZ => "FracZ",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    /// Number of elements, a scalar holds one.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_size(&self, dtype: DataType) -> usize {
        self.num_elements() * dtype.size_in_bytes()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_uses_element_width() {
        assert_eq!(Shape::new(vec![2, 3]).byte_size(DataType::F32), 24);
        assert_eq!(Shape::scalar().byte_size(DataType::I64), 8);
        assert_eq!(Shape::new(vec![4, 0]).byte_size(DataType::F16), 0);
    }
}
