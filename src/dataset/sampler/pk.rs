use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::sampler::{
    ids_buffer, RandomAccessOp, Sampler, SamplerCore, UNBOUNDED_SAMPLES_PER_BUFFER,
};
use crate::error::RuntimeError;

/// `samples_per_class` ids from every class the source reports.
/// Classes smaller than that wrap around.
pub struct PkSampler {
    core: SamplerCore,
    samples_per_class: i64,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    label_to_ids: BTreeMap<i64, Vec<i64>>,
    labels: Vec<i64>,
    next_id: i64,
}

impl PkSampler {
    pub fn new(num_samples: i64, samples_per_class: i64, shuffle: bool, seed: u64) -> Self {
        Self {
            core: SamplerCore::new(num_samples, UNBOUNDED_SAMPLES_PER_BUFFER),
            samples_per_class,
            shuffle,
            seed,
            epoch: 0,
            label_to_ids: BTreeMap::new(),
            labels: Vec::new(),
            next_id: 0,
        }
    }

    fn order_labels(&mut self) {
        self.labels = self.label_to_ids.keys().copied().collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            self.labels.shuffle(&mut rng);
        }
    }
}

impl Sampler for PkSampler {
    fn core(&self) -> &SamplerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SamplerCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "PkSampler"
    }

    /// Ids come straight from the source's class map, there is nothing to chain.
    fn add_child(&mut self, _child: Box<dyn Sampler>) -> anyhow::Result<()> {
        Err(RuntimeError::unexpected("PkSampler does not accept a child sampler"))
    }

    fn handshake_random_access_op(&mut self, op: &dyn RandomAccessOp) -> anyhow::Result<()> {
        if self.samples_per_class <= 0 {
            return Err(RuntimeError::unexpected("PkSampler: samples_per_class must be positive"));
        }
        let label_to_ids = op.get_class_ids()?;
        if label_to_ids.is_empty() || label_to_ids.values().any(|ids| ids.is_empty()) {
            return Err(RuntimeError::unexpected("PkSampler: source reports an empty class"));
        }
        self.core.num_rows = label_to_ids.len() as i64 * self.samples_per_class;
        self.label_to_ids = label_to_ids;
        self.init_sampler()
    }

    fn init_sampler(&mut self) -> anyhow::Result<()> {
        self.core.validate(self.name())?;
        if self.label_to_ids.is_empty() {
            return Err(RuntimeError::unexpected("PkSampler needs class ids from its source"));
        }
        self.core.num_samples = if self.core.num_samples == 0 {
            self.core.num_rows
        } else {
            self.core.num_samples.min(self.core.num_rows)
        };
        self.next_id = 0;
        self.order_labels();
        self.core.initialized = true;
        Ok(())
    }

    fn get_next_buffer(&mut self) -> anyhow::Result<DataBuffer> {
        self.ensure_initialized()?;
        if self.next_id >= self.core.num_samples {
            return Ok(DataBuffer::eoe());
        }
        let count = self.core.samples_per_buffer.min(self.core.num_samples - self.next_id);
        let k = self.samples_per_class;
        let mut ids = Vec::with_capacity(count as usize);
        for i in self.next_id..self.next_id + count {
            let label = self.labels[(i / k) as usize];
            let class_ids = &self.label_to_ids[&label];
            ids.push(class_ids[((i % k) as usize) % class_ids.len()]);
        }
        self.next_id += count;
        Ok(ids_buffer(&ids))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.next_id = 0;
        self.epoch += 1;
        self.order_labels();
        self.reset_child()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Labeled;

    impl RandomAccessOp for Labeled {
        fn get_num_rows_in_dataset(&self) -> anyhow::Result<i64> {
            Ok(5)
        }

        fn get_class_ids(&self) -> anyhow::Result<BTreeMap<i64, Vec<i64>>> {
            Ok(BTreeMap::from([(0, vec![0, 3]), (1, vec![1, 2, 4])]))
        }
    }

    #[test]
    fn takes_k_per_class() {
        let mut sampler = PkSampler::new(0, 2, false, 0);
        sampler.handshake_random_access_op(&Labeled).unwrap();
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), vec![0, 3, 1, 2]);
    }

    #[test]
    fn small_classes_wrap() {
        let mut sampler = PkSampler::new(0, 3, false, 0);
        sampler.handshake_random_access_op(&Labeled).unwrap();
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), vec![0, 3, 0, 1, 2, 4]);
    }

    #[test]
    fn child_sampler_is_rejected() {
        let mut sampler = PkSampler::new(0, 2, false, 0);
        let err = sampler
            .add_child(Box::new(crate::dataset::sampler::SequentialSampler::new(0, 0)))
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::Unexpected(_))));
        assert!(!sampler.has_child_sampler());
        sampler.handshake_random_access_op(&Labeled).unwrap();
        assert_eq!(sampler.num_rows(), 4);
    }

    #[test]
    fn source_without_classes_is_rejected() {
        let mut sampler = PkSampler::new(0, 1, false, 0);
        assert!(sampler.handshake_random_access_op(&crate::dataset::sampler::tests::Rows(4)).is_err());
    }
}
