use crate::{
    Error, Result,
    pool::{POOL_ALIGN, POOL_SLOT_SIZE, PoolSpec},
};

/// Size tiers for pooled buffers, smallest first. Requests larger than the
/// last tier go straight to the system allocator.
pub const DEFAULT_POOL_TIERS: [PoolSpec; 12] = [
    PoolSpec::new(16, 512),
    PoolSpec::new(32, 1024),
    PoolSpec::new(48, 512),
    PoolSpec::new(64, 512),
    PoolSpec::new(96, 256),
    PoolSpec::new(128, 256),
    PoolSpec::new(192, 128),
    PoolSpec::new(256, 128),
    PoolSpec::new(512, 64),
    PoolSpec::new(1024, 32),
    PoolSpec::new(2048, 16),
    PoolSpec::new(4096, 8),
];

// TODO: let the ballast adapt to the live set after each collection
// instead of resetting to a constant
#[derive(Debug, Default, Clone)]
pub struct RuntimeCreateInfo {
    pub pool_tiers: Option<Vec<PoolSpec>>,
    /// units per segment of the stub pool
    pub stub_units: Option<usize>,
    /// units per segment of the API cell pool
    pub cell_units: Option<usize>,
    /// multiplies every pool's units per segment
    pub segment_scale: Option<usize>,
    /// stub allocations between requested collections
    pub ballast: Option<usize>,
    /// cells added each time the value stack runs out of room
    pub stack_chunk: Option<usize>,
    /// upper bound for segment + system allocation bytes
    pub memory_limit: Option<usize>,
    /// protocol assertions, poisoning and tail-release
    pub checked: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub pool_tiers: Vec<PoolSpec>,
    pub stub_units: usize,
    pub cell_units: usize,
    pub segment_scale: usize,
    pub ballast: usize,
    pub stack_chunk: usize,
    pub memory_limit: Option<usize>,
    pub checked: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            pool_tiers: DEFAULT_POOL_TIERS.to_vec(),
            stub_units: 4096,
            cell_units: 256,
            segment_scale: 1,
            ballast: 10_000,
            stack_chunk: 100,
            memory_limit: None,
            checked: cfg!(debug_assertions),
        }
    }
}

impl RuntimeSettings {
    pub fn from_info(info: RuntimeCreateInfo) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(tiers) = info.pool_tiers {
            settings.pool_tiers = tiers;
        }
        info.stub_units.inspect(|&val| settings.stub_units = val);
        info.cell_units.inspect(|&val| settings.cell_units = val);
        info.segment_scale
            .inspect(|&val| settings.segment_scale = val);
        info.ballast.inspect(|&val| settings.ballast = val);
        info.stack_chunk.inspect(|&val| settings.stack_chunk = val);
        settings.memory_limit = info.memory_limit;
        info.checked.inspect(|&val| settings.checked = val);

        settings.validate().map_err(Error::InvalidSettings)?;
        Ok(settings)
    }

    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.pool_tiers.is_empty() {
            return Err("at least one pool tier is required");
        }
        if self
            .pool_tiers
            .windows(2)
            .any(|pair| pair[0].width >= pair[1].width)
        {
            return Err("pool tiers must be strictly ascending by width");
        }
        for tier in &self.pool_tiers {
            if tier.width < POOL_SLOT_SIZE {
                return Err("pool width too small to hold a free slot");
            }
            if !tier.width.is_multiple_of(POOL_ALIGN) {
                return Err("pool width must be a multiple of the pool alignment");
            }
            if tier.units == 0 {
                return Err("pool tiers need at least one unit per segment");
            }
        }
        if self.stub_units == 0 || self.cell_units == 0 {
            return Err("node pools need at least one unit per segment");
        }
        if self.segment_scale == 0 {
            return Err("segment_scale must be > 0");
        }
        if self.ballast == 0 {
            return Err("ballast must be > 0");
        }
        if self.stack_chunk == 0 {
            return Err("stack_chunk must be > 0");
        }
        if self.memory_limit == Some(0) {
            return Err("memory_limit must be > 0 when set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = RuntimeSettings::from_info(RuntimeCreateInfo::default())
            .expect("defaults are valid");
        assert_eq!(settings.pool_tiers.len(), DEFAULT_POOL_TIERS.len());
        assert_eq!(settings.checked, cfg!(debug_assertions));
    }

    #[test]
    fn overrides_are_applied() {
        let settings = RuntimeSettings::from_info(RuntimeCreateInfo {
            ballast: Some(7),
            stack_chunk: Some(3),
            memory_limit: Some(1 << 20),
            checked: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.ballast, 7);
        assert_eq!(settings.stack_chunk, 3);
        assert_eq!(settings.memory_limit, Some(1 << 20));
        assert!(settings.checked);
    }

    #[test]
    fn unsorted_tiers_are_rejected() {
        let err = RuntimeSettings::from_info(RuntimeCreateInfo {
            pool_tiers: Some(vec![PoolSpec::new(64, 4), PoolSpec::new(32, 4)]),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));
    }

    #[test]
    fn tiny_tiers_are_rejected() {
        let err = RuntimeSettings::from_info(RuntimeCreateInfo {
            pool_tiers: Some(vec![PoolSpec::new(8, 4)]),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidSettings("pool width too small to hold a free slot")
        );
    }

    #[test]
    fn zero_ballast_is_rejected() {
        assert!(
            RuntimeSettings::from_info(RuntimeCreateInfo {
                ballast: Some(0),
                ..Default::default()
            })
            .is_err()
        );
    }
}
