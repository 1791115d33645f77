use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::sampler::{ids_buffer, Sampler, SamplerCore, UNBOUNDED_SAMPLES_PER_BUFFER};
use crate::error::RuntimeError;

/// Ids `start_index..start_index + num_samples` in order.
pub struct SequentialSampler {
    core: SamplerCore,
    start_index: i64,
    next_id: i64,
}

impl SequentialSampler {
    pub fn new(num_samples: i64, start_index: i64) -> Self {
        Self {
            core: SamplerCore::new(num_samples, UNBOUNDED_SAMPLES_PER_BUFFER),
            start_index,
            next_id: 0,
        }
    }

    pub fn with_samples_per_buffer(mut self, samples_per_buffer: i64) -> Self {
        self.core.samples_per_buffer = samples_per_buffer;
        self
    }
}

impl Sampler for SequentialSampler {
    fn core(&self) -> &SamplerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SamplerCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "SequentialSampler"
    }

    fn init_sampler(&mut self) -> anyhow::Result<()> {
        self.core.validate(self.name())?;
        if self.start_index < 0 || self.start_index >= self.core.num_rows {
            return Err(RuntimeError::unexpected(format!(
                "SequentialSampler: start index {} outside of {} rows",
                self.start_index, self.core.num_rows
            )));
        }
        let available = self.core.num_rows - self.start_index;
        self.core.num_samples = if self.core.num_samples == 0 {
            available
        } else {
            self.core.num_samples.min(available)
        };
        self.next_id = 0;
        self.core.initialized = true;
        Ok(())
    }

    fn get_next_buffer(&mut self) -> anyhow::Result<DataBuffer> {
        self.ensure_initialized()?;
        if self.next_id > self.core.num_samples {
            return Err(RuntimeError::unexpected("SequentialSampler: index out of bounds"));
        }
        if self.next_id == self.core.num_samples {
            return Ok(DataBuffer::eoe());
        }
        self.fetch_child_ids()?;
        let count = self.core.samples_per_buffer.min(self.core.num_samples - self.next_id);
        let first = self.start_index + self.next_id;
        let ids = self.translate_ids((first..first + count).collect())?;
        self.next_id += count;
        Ok(ids_buffer(&ids))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.next_id = 0;
        self.reset_child()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::sampler::buffer_ids;
    use crate::dataset::sampler::tests::Rows;

    #[test]
    fn covers_population_in_order_and_repeats_after_reset() {
        let mut sampler = SequentialSampler::new(0, 0);
        sampler.handshake_random_access_op(&Rows(6)).unwrap();
        let first = sampler.get_all_ids_then_reset().unwrap();
        assert_eq!(first, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), first);
    }

    #[test]
    fn respects_buffer_size_and_start_index() {
        let mut sampler = SequentialSampler::new(5, 3).with_samples_per_buffer(2);
        sampler.handshake_random_access_op(&Rows(6)).unwrap();
        assert_eq!(sampler.num_samples(), 3);
        assert_eq!(buffer_ids(&sampler.get_next_buffer().unwrap()).unwrap(), vec![3, 4]);
        assert_eq!(buffer_ids(&sampler.get_next_buffer().unwrap()).unwrap(), vec![5]);
        assert!(sampler.get_next_buffer().unwrap().is_eoe());
    }

    #[test]
    fn fetch_before_init_fails() {
        let mut sampler = SequentialSampler::new(0, 0);
        assert!(sampler.get_next_buffer().is_err());
    }
}
