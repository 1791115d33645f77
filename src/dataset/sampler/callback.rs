use std::collections::VecDeque;

use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::sampler::{ids_buffer, Sampler, SamplerCore, UNBOUNDED_SAMPLES_PER_BUFFER};
use crate::error::RuntimeError;

/// Sampling decisions supplied by the embedding application.
pub trait SamplingPolicy: Send {
    /// Ids of a whole epoch.
    fn next_ids(&mut self, num_rows: i64, num_samples: i64) -> anyhow::Result<Vec<i64>>;

    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> SamplingPolicy for F
where
    F: FnMut(i64, i64) -> anyhow::Result<Vec<i64>> + Send,
{
    fn next_ids(&mut self, num_rows: i64, num_samples: i64) -> anyhow::Result<Vec<i64>> {
        self(num_rows, num_samples)
    }
}

/// Sampler delegating to a `SamplingPolicy`. The policy is reset lazily,
/// right before the first fetch after construction or `reset`.
pub struct CallbackSampler {
    core: SamplerCore,
    policy: Box<dyn SamplingPolicy>,
    need_to_reset: bool,
    fetched: bool,
    pending: VecDeque<i64>,
}

impl CallbackSampler {
    pub fn new(num_samples: i64, policy: Box<dyn SamplingPolicy>) -> Self {
        Self {
            core: SamplerCore::new(num_samples, UNBOUNDED_SAMPLES_PER_BUFFER),
            policy,
            need_to_reset: true,
            fetched: false,
            pending: VecDeque::new(),
        }
    }

    pub fn with_samples_per_buffer(mut self, samples_per_buffer: i64) -> Self {
        self.core.samples_per_buffer = samples_per_buffer;
        self
    }

    fn fetch_epoch(&mut self) -> anyhow::Result<()> {
        let mut ids = self.policy.next_ids(self.core.num_rows, self.core.num_samples)?;
        if let Some(bad) = ids.iter().find(|&&id| id < 0 || id >= self.core.num_rows) {
            return Err(RuntimeError::unexpected(format!(
                "Sampling policy returned id {} outside of {} rows",
                bad, self.core.num_rows
            )));
        }
        ids.truncate(self.core.num_samples as usize);
        self.pending = self.translate_ids(ids)?.into();
        self.fetched = true;
        Ok(())
    }
}

impl Sampler for CallbackSampler {
    fn core(&self) -> &SamplerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SamplerCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "CallbackSampler"
    }

    fn init_sampler(&mut self) -> anyhow::Result<()> {
        self.core.validate(self.name())?;
        self.core.num_samples = if self.core.num_samples == 0 {
            self.core.num_rows
        } else {
            self.core.num_samples.min(self.core.num_rows)
        };
        self.core.initialized = true;
        Ok(())
    }

    fn get_next_buffer(&mut self) -> anyhow::Result<DataBuffer> {
        self.ensure_initialized()?;
        if self.need_to_reset {
            self.policy.reset()?;
            self.need_to_reset = false;
        }
        if !self.fetched {
            self.fetch_child_ids()?;
            self.fetch_epoch()?;
        }
        if self.pending.is_empty() {
            return Ok(DataBuffer::eoe());
        }
        let count = (self.core.samples_per_buffer as usize).min(self.pending.len());
        let ids: Vec<i64> = self.pending.drain(..count).collect();
        Ok(ids_buffer(&ids))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.need_to_reset = true;
        self.fetched = false;
        self.pending.clear();
        self.reset_child()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::sampler::tests::Rows;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Reversed {
        resets: Arc<AtomicUsize>,
    }

    impl SamplingPolicy for Reversed {
        fn next_ids(&mut self, num_rows: i64, _num_samples: i64) -> anyhow::Result<Vec<i64>> {
            Ok((0..num_rows).rev().collect())
        }

        fn reset(&mut self) -> anyhow::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn policy_is_reset_before_first_fetch() {
        let resets = Arc::new(AtomicUsize::new(0));
        let mut sampler =
            CallbackSampler::new(0, Box::new(Reversed { resets: resets.clone() })).with_samples_per_buffer(2);
        sampler.handshake_random_access_op(&Rows(5)).unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn closures_are_policies() {
        let mut sampler = CallbackSampler::new(2, Box::new(|_rows: i64, _n: i64| -> anyhow::Result<Vec<i64>> { Ok(vec![3, 1, 0]) }));
        sampler.handshake_random_access_op(&Rows(4)).unwrap();
        assert_eq!(sampler.get_all_ids_then_reset().unwrap(), vec![3, 1]);
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let mut sampler = CallbackSampler::new(0, Box::new(|_rows: i64, _n: i64| -> anyhow::Result<Vec<i64>> { Ok(vec![9]) }));
        sampler.handshake_random_access_op(&Rows(4)).unwrap();
        assert!(sampler.get_next_buffer().is_err());
    }
}
