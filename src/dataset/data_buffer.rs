use crate::core::Tensor;

pub type TensorRow = Vec<Tensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFlag {
    Data,
    /// End of epoch
    Eoe,
    /// End of data
    Eof,
}

/// Unit of transfer between dataset operators.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    id: i64,
    flag: BufferFlag,
    rows: Vec<TensorRow>,
}

impl DataBuffer {
    pub fn new(id: i64, rows: Vec<TensorRow>) -> Self {
        Self { id, flag: BufferFlag::Data, rows }
    }

    pub fn eoe() -> Self {
        Self { id: 0, flag: BufferFlag::Eoe, rows: Vec::new() }
    }

    pub fn eof() -> Self {
        Self { id: 0, flag: BufferFlag::Eof, rows: Vec::new() }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn flag(&self) -> BufferFlag {
        self.flag
    }

    pub fn is_eoe(&self) -> bool {
        self.flag == BufferFlag::Eoe
    }

    pub fn is_eof(&self) -> bool {
        self.flag == BufferFlag::Eof
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[TensorRow] {
        &self.rows
    }

    pub fn get_row(&self, index: usize) -> Option<&TensorRow> {
        self.rows.get(index)
    }

    pub fn into_rows(self) -> Vec<TensorRow> {
        self.rows
    }
}
