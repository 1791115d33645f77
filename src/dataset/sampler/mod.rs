//! Index generators for leaf operators.
//!
//! A sampler learns the population size through a handshake with its
//! source, then hands out ids in buffers until the epoch ends. A sampler
//! may own a child: its own ids are then positions into the child's epoch.

pub mod callback;
pub mod pk;
pub mod random;
pub mod sequential;

pub use callback::{CallbackSampler, SamplingPolicy};
pub use pk::PkSampler;
pub use random::RandomSampler;
pub use sequential::SequentialSampler;

use std::collections::BTreeMap;

use crate::core::Tensor;
use crate::dataset::data_buffer::DataBuffer;
use crate::error::RuntimeError;

/// One buffer covers the whole epoch.
pub const UNBOUNDED_SAMPLES_PER_BUFFER: i64 = i64::MAX;

/// Source side of the handshake.
pub trait RandomAccessOp {
    fn get_num_rows_in_dataset(&self) -> anyhow::Result<i64>;

    fn get_class_ids(&self) -> anyhow::Result<BTreeMap<i64, Vec<i64>>> {
        Err(RuntimeError::unexpected("Source does not provide class ids"))
    }
}

/// State shared by every sampler.
pub struct SamplerCore {
    pub num_rows: i64,
    pub num_samples: i64,
    pub samples_per_buffer: i64,
    pub initialized: bool,
    child: Option<Box<dyn Sampler>>,
    child_ids: Option<Vec<i64>>,
}

impl SamplerCore {
    pub fn new(num_samples: i64, samples_per_buffer: i64) -> Self {
        Self {
            num_rows: 0,
            num_samples,
            samples_per_buffer,
            initialized: false,
            child: None,
            child_ids: None,
        }
    }

    pub fn child_ids(&self) -> Option<&[i64]> {
        self.child_ids.as_deref()
    }

    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        if self.num_rows <= 0 {
            return Err(RuntimeError::unexpected(format!("{}: num_rows must be positive", name)));
        }
        if self.num_samples < 0 {
            return Err(RuntimeError::unexpected(format!("{}: num_samples must not be negative", name)));
        }
        if self.samples_per_buffer <= 0 {
            return Err(RuntimeError::unexpected(format!(
                "{}: samples_per_buffer must be positive",
                name
            )));
        }
        Ok(())
    }
}

/// Wraps a chunk of ids into a one-row buffer.
pub fn ids_buffer(ids: &[i64]) -> DataBuffer {
    DataBuffer::new(0, vec![vec![Tensor::ids(ids)]])
}

/// Ids carried by a sampler buffer.
pub fn buffer_ids(buffer: &DataBuffer) -> anyhow::Result<Vec<i64>> {
    match buffer.get_row(0).and_then(|row| row.first()) {
        Some(tensor) => tensor.to_i64_vec(),
        None => Ok(Vec::new()),
    }
}

pub trait Sampler: Send {
    fn core(&self) -> &SamplerCore;
    fn core_mut(&mut self) -> &mut SamplerCore;
    fn name(&self) -> &str;

    /// Derives internal state from `num_rows`/`num_samples`.
    fn init_sampler(&mut self) -> anyhow::Result<()>;

    /// Next chunk of ids, an EOE buffer once the epoch is complete.
    fn get_next_buffer(&mut self) -> anyhow::Result<DataBuffer>;

    /// Rewinds for a new epoch, the child included.
    fn reset(&mut self) -> anyhow::Result<()>;

    fn handshake_random_access_op(&mut self, op: &dyn RandomAccessOp) -> anyhow::Result<()> {
        if let Some(child) = self.core_mut().child.as_mut() {
            child.handshake_random_access_op(op)?;
        }
        let num_rows = match self.core().child.as_ref() {
            Some(child) => child.core().num_samples,
            None => op.get_num_rows_in_dataset()?,
        };
        if num_rows <= 0 {
            return Err(RuntimeError::unexpected(format!(
                "{}: data source reports {} rows",
                self.name(),
                num_rows
            )));
        }
        self.core_mut().num_rows = num_rows;
        self.init_sampler()
    }

    fn add_child(&mut self, child: Box<dyn Sampler>) -> anyhow::Result<()> {
        if self.core().child.is_some() {
            return Err(RuntimeError::unexpected(format!("{} already has a child sampler", self.name())));
        }
        self.core_mut().child = Some(child);
        Ok(())
    }

    fn has_child_sampler(&self) -> bool {
        self.core().child.is_some()
    }

    fn num_samples(&self) -> i64 {
        self.core().num_samples
    }

    fn num_rows(&self) -> i64 {
        self.core().num_rows
    }

    fn set_num_samples(&mut self, num_samples: i64) -> anyhow::Result<()> {
        if num_samples < 0 {
            return Err(RuntimeError::unexpected(format!("Invalid num_samples {}", num_samples)));
        }
        self.core_mut().num_samples = num_samples;
        Ok(())
    }

    fn set_num_rows_in_dataset(&mut self, num_rows: i64) -> anyhow::Result<()> {
        if num_rows <= 0 {
            return Err(RuntimeError::unexpected(format!("Invalid num_rows {}", num_rows)));
        }
        self.core_mut().num_rows = num_rows;
        Ok(())
    }

    /// Drains the child's whole epoch once, later calls keep the cached ids.
    fn fetch_child_ids(&mut self) -> anyhow::Result<()> {
        let core = self.core_mut();
        if core.child_ids.is_some() {
            return Ok(());
        }
        if let Some(child) = core.child.as_mut() {
            let mut ids = Vec::new();
            loop {
                let buffer = child.get_next_buffer()?;
                if buffer.is_eoe() || buffer.is_eof() {
                    break;
                }
                ids.extend(buffer_ids(&buffer)?);
            }
            core.child_ids = Some(ids);
        }
        Ok(())
    }

    /// Child id at position `id` of the child's last epoch.
    fn get_associated_child_id(&self, id: i64) -> anyhow::Result<i64> {
        let ids = self.core().child_ids.as_ref().ok_or_else(|| {
            RuntimeError::unexpected("Trying to get associated child id, but there are no child ids")
        })?;
        usize::try_from(id)
            .ok()
            .and_then(|i| ids.get(i).copied())
            .ok_or_else(|| {
                RuntimeError::unexpected(format!("Child id index {} out of range ({} ids)", id, ids.len()))
            })
    }

    /// Maps own ids through the child when one is attached.
    fn translate_ids(&self, ids: Vec<i64>) -> anyhow::Result<Vec<i64>> {
        if !self.has_child_sampler() {
            return Ok(ids);
        }
        ids.into_iter().map(|id| self.get_associated_child_id(id)).collect()
    }

    /// Resets the child and forgets its cached epoch.
    fn reset_child(&mut self) -> anyhow::Result<()> {
        let core = self.core_mut();
        core.child_ids = None;
        if let Some(child) = core.child.as_mut() {
            child.reset()?;
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> anyhow::Result<()> {
        if !self.core().initialized {
            return Err(RuntimeError::unexpected(format!("{} used before InitSampler", self.name())));
        }
        Ok(())
    }

    /// Every id of one epoch in a flat list, then rewinds.
    fn get_all_ids_then_reset(&mut self) -> anyhow::Result<Vec<i64>> {
        let mut ids = Vec::new();
        loop {
            let buffer = self.get_next_buffer()?;
            if buffer.is_eoe() {
                break;
            }
            ids.extend(buffer_ids(&buffer)?);
        }
        self.reset()?;
        Ok(ids)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub struct Rows(pub i64);

    impl RandomAccessOp for Rows {
        fn get_num_rows_in_dataset(&self) -> anyhow::Result<i64> {
            Ok(self.0)
        }
    }

    struct Fixed(Vec<i64>);

    impl SamplingPolicy for Fixed {
        fn next_ids(&mut self, _num_rows: i64, _num_samples: i64) -> anyhow::Result<Vec<i64>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn zero_rows_fail_the_handshake() {
        let mut sampler = SequentialSampler::new(0, 0);
        let err = sampler.handshake_random_access_op(&Rows(0)).unwrap_err();
        assert!(matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::Unexpected(_))));
    }

    #[test]
    fn chained_sampler_reindexes_child_ids() {
        let child = CallbackSampler::new(3, Box::new(Fixed(vec![5, 2, 8])));
        let mut sampler = SequentialSampler::new(0, 0);
        sampler.add_child(Box::new(child)).unwrap();
        sampler.handshake_random_access_op(&Rows(10)).unwrap();
        assert_eq!(sampler.num_rows(), 3);
        assert_eq!(sampler.num_samples(), 3);

        let buffer = sampler.get_next_buffer().unwrap();
        assert_eq!(buffer_ids(&buffer).unwrap(), vec![5, 2, 8]);
        assert_eq!(sampler.get_associated_child_id(1).unwrap(), 2);
        assert!(sampler.get_associated_child_id(3).is_err());
        assert!(sampler.get_next_buffer().unwrap().is_eoe());
    }

    #[test]
    fn associated_child_id_needs_a_child() {
        let mut sampler = SequentialSampler::new(0, 0);
        sampler.handshake_random_access_op(&Rows(4)).unwrap();
        sampler.get_next_buffer().unwrap();
        assert!(sampler.get_associated_child_id(0).is_err());
    }

    #[test]
    fn only_one_child() {
        let mut sampler = SequentialSampler::new(0, 0);
        sampler.add_child(Box::new(SequentialSampler::new(0, 0))).unwrap();
        assert!(sampler.add_child(Box::new(SequentialSampler::new(0, 0))).is_err());
    }

    #[test]
    fn setters_validate() {
        let mut sampler = SequentialSampler::new(0, 0);
        assert!(sampler.set_num_samples(-1).is_err());
        assert!(sampler.set_num_rows_in_dataset(0).is_err());
        sampler.set_num_rows_in_dataset(7).unwrap();
        sampler.init_sampler().unwrap();
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), (0..7).collect::<Vec<_>>());
    }
}
