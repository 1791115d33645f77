use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::sampler::{ids_buffer, Sampler, SamplerCore, UNBOUNDED_SAMPLES_PER_BUFFER};

/// Shuffled ids. Without replacement every row appears once per epoch.
/// Each reset reseeds with the next seed, so runs are reproducible while
/// epochs differ.
pub struct RandomSampler {
    core: SamplerCore,
    replacement: bool,
    seed: u64,
    epoch: u64,
    rng: StdRng,
    shuffled_ids: Vec<i64>,
    next_id: i64,
}

impl RandomSampler {
    pub fn new(num_samples: i64, replacement: bool, seed: u64) -> Self {
        Self {
            core: SamplerCore::new(num_samples, UNBOUNDED_SAMPLES_PER_BUFFER),
            replacement,
            seed,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
            shuffled_ids: Vec::new(),
            next_id: 0,
        }
    }

    pub fn with_samples_per_buffer(mut self, samples_per_buffer: i64) -> Self {
        self.core.samples_per_buffer = samples_per_buffer;
        self
    }

    fn reshuffle(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        if !self.replacement {
            self.shuffled_ids = (0..self.core.num_rows).collect();
            self.shuffled_ids.shuffle(&mut self.rng);
        }
    }
}

impl Sampler for RandomSampler {
    fn core(&self) -> &SamplerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SamplerCore {
        &mut self.core
    }

    fn name(&self) -> &str {
        "RandomSampler"
    }

    fn init_sampler(&mut self) -> anyhow::Result<()> {
        self.core.validate(self.name())?;
        if self.core.num_samples == 0 {
            self.core.num_samples = self.core.num_rows;
        } else if !self.replacement {
            self.core.num_samples = self.core.num_samples.min(self.core.num_rows);
        }
        self.next_id = 0;
        self.reshuffle();
        self.core.initialized = true;
        Ok(())
    }

    fn get_next_buffer(&mut self) -> anyhow::Result<DataBuffer> {
        self.ensure_initialized()?;
        if self.next_id >= self.core.num_samples {
            return Ok(DataBuffer::eoe());
        }
        self.fetch_child_ids()?;
        let count = self.core.samples_per_buffer.min(self.core.num_samples - self.next_id);
        let ids: Vec<i64> = if self.replacement {
            let num_rows = self.core.num_rows;
            (0..count).map(|_| self.rng.gen_range(0..num_rows)).collect()
        } else {
            let start = self.next_id as usize;
            self.shuffled_ids[start..start + count as usize].to_vec()
        };
        let ids = self.translate_ids(ids)?;
        self.next_id += count;
        Ok(ids_buffer(&ids))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.next_id = 0;
        self.epoch += 1;
        self.reshuffle();
        self.reset_child()
    }
}
