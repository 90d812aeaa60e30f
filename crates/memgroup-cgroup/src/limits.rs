//! Memory limit policy for a resource group

use memgroup_core::{GroupError, Result};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Lowest working-set bound the group accepts (200 KiB)
pub const MIN_WORKING_SET: u64 = 200 * 1024;

/// Which limits of a [`ResourceGroupLimits`] are in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitFlags(u32);

impl LimitFlags {
    pub const NONE: LimitFlags = LimitFlags(0);
    /// Aggregate cap over all members (`memory.max`)
    pub const JOB_MEMORY: LimitFlags = LimitFlags(0x1);
    /// Per-member cap (`RLIMIT_AS` on each member)
    pub const PROCESS_MEMORY: LimitFlags = LimitFlags(0x2);
    /// Working-set bounds (`memory.low` / `memory.high`)
    pub const WORKING_SET: LimitFlags = LimitFlags(0x4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: LimitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LimitFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LimitFlags {
    type Output = LimitFlags;

    fn bitor(self, rhs: LimitFlags) -> LimitFlags {
        LimitFlags(self.0 | rhs.0)
    }
}

/// Extended limit information for a resource group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceGroupLimits {
    /// Cap on the sum of all members, in bytes
    pub aggregate_memory_limit: Option<u64>,
    /// Cap on each member, in bytes
    pub per_process_memory_limit: Option<u64>,
    /// Protected working set, in bytes
    pub minimum_working_set: Option<u64>,
    /// Working set above which members are throttled, in bytes
    pub maximum_working_set: Option<u64>,
    pub flags: LimitFlags,
}

impl ResourceGroupLimits {
    /// Limits for a group holding `members` processes capped at `per_process` bytes each.
    ///
    /// The aggregate saturates instead of overflowing.
    pub fn for_members(per_process: u64, members: usize) -> Self {
        Self {
            aggregate_memory_limit: Some(aggregate_for(per_process, members)),
            per_process_memory_limit: Some(per_process),
            minimum_working_set: None,
            maximum_working_set: None,
            flags: LimitFlags::JOB_MEMORY | LimitFlags::PROCESS_MEMORY,
        }
    }

    /// Add working-set bounds.
    pub fn with_working_set(mut self, minimum: u64, maximum: u64) -> Result<Self> {
        validate_working_set(minimum, maximum)?;
        self.minimum_working_set = Some(minimum);
        self.maximum_working_set = Some(maximum);
        self.flags.insert(LimitFlags::WORKING_SET);
        Ok(self)
    }

    /// Same policy re-derived for a different member count
    pub fn rescaled(&self, members: usize) -> Self {
        let mut limits = *self;
        if let Some(per_process) = self.per_process_memory_limit {
            limits.aggregate_memory_limit = Some(aggregate_for(per_process, members));
            limits.flags.insert(LimitFlags::JOB_MEMORY);
        }
        limits
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_process_memory_limit == Some(0) {
            return Err(GroupError::InvalidConfig(
                "Per-process memory limit must be greater than 0".to_string(),
            ));
        }
        if let (Some(aggregate), Some(per_process)) =
            (self.aggregate_memory_limit, self.per_process_memory_limit)
            && aggregate < per_process
        {
            return Err(GroupError::InvalidConfig(format!(
                "Aggregate limit {} is below the per-process limit {}",
                aggregate, per_process
            )));
        }
        match (self.minimum_working_set, self.maximum_working_set) {
            (Some(min), Some(max)) => validate_working_set(min, max),
            (None, None) => Ok(()),
            _ => Err(GroupError::InvalidConfig(
                "Both working-set bounds are required".to_string(),
            )),
        }
    }
}

/// `per_process × members`, saturating at `u64::MAX`
pub fn aggregate_for(per_process: u64, members: usize) -> u64 {
    per_process.saturating_mul(members as u64)
}

fn validate_working_set(minimum: u64, maximum: u64) -> Result<()> {
    if minimum < MIN_WORKING_SET {
        return Err(GroupError::InvalidConfig(format!(
            "Minimum working set must be at least {} bytes",
            MIN_WORKING_SET
        )));
    }
    if minimum > maximum {
        return Err(GroupError::InvalidConfig(format!(
            "Minimum working set {} exceeds maximum {}",
            minimum, maximum
        )));
    }
    Ok(())
}
