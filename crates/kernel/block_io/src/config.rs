use pintfs_params::NUM_CACHE_SLOTS;
use strum::{Display, EnumString, IntoStaticStr};

/// How a victim slot is chosen when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum EvictionPolicy {
    /// Uniformly random slot among the slots that are not locked.
    #[default]
    Random,
    /// Second-chance clock over the reference bits of the slots.
    Clock,
}

/// Runtime configuration of a [`BufferCache`](crate::BufferCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of slots in the pool.
    pub num_slots: usize,
    /// Victim selection policy.
    pub policy: EvictionPolicy,
    /// Seed of the generator used by [`EvictionPolicy::Random`].
    pub seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_slots: NUM_CACHE_SLOTS,
            policy: EvictionPolicy::default(),
            seed: 0x5eed,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_num_slots(mut self, num_slots: usize) -> Self {
        self.num_slots = num_slots;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
