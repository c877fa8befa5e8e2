//! Limiter configuration: a value built by chaining pure `with_*` steps.
//!
//! Nothing here touches the OS. Backend-specific translation (CFS quota/period
//! for cgroups, CPU rate for job objects) is derived from the final value, and
//! validation is deferred to the moment a group is created.
use crate::types::{LimitError, Result};
use serde::{Deserialize, Serialize};

/// Default CFS period in microseconds (100ms)
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Upper bound of a job object CPU rate (100% of all cores, in 1/100 %)
pub const MAX_CPU_RATE: u32 = 10_000;

/// CPU and memory ceilings for a resource group
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU limit as a percentage of one core (50 = half a core, 200 = two cores)
    pub cpu_percent: Option<u32>,
    /// CFS period override in microseconds
    pub cpu_period_us: Option<u64>,
    /// Memory ceiling in bytes
    pub memory_bytes: Option<u64>,
}

impl ResourceLimits {
    /// True when no limit has been configured
    pub fn is_empty(&self) -> bool {
        self.cpu_percent.is_none() && self.memory_bytes.is_none()
    }

    /// CFS period used for this configuration
    pub fn cpu_period(&self) -> u64 {
        self.cpu_period_us.unwrap_or(DEFAULT_CPU_PERIOD_US)
    }

    /// CFS `(quota, period)` pair in microseconds, if a CPU limit is set
    pub fn cfs_quota(&self) -> Option<(u64, u64)> {
        let percent = self.cpu_percent?;
        let period = self.cpu_period();
        Some((period * u64::from(percent) / 100, period))
    }

    /// Job object CPU rate (hundredths of a percent of all cores) for `cores` logical CPUs
    pub fn cpu_rate(&self, cores: u32) -> Option<u32> {
        let percent = self.cpu_percent?;
        Some(percent.saturating_mul(100) / cores.max(1))
    }

    /// Check the invariants every backend relies on
    pub fn validate(&self) -> Result<()> {
        if self.cpu_percent == Some(0) {
            return Err(LimitError::Config(
                "CPU limit must be greater than 0 percent".to_string(),
            ));
        }
        if self.cpu_period_us == Some(0) {
            return Err(LimitError::Config(
                "CPU period must be greater than 0 microseconds".to_string(),
            ));
        }
        if self.memory_bytes == Some(0) {
            return Err(LimitError::Config(
                "Memory limit must be greater than 0 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Name and limits of a resource group that has not been created yet
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Group name; a random UUID v4 is used when absent
    pub name: Option<String>,
    /// Limits applied when the group is created
    #[serde(flatten)]
    pub limits: ResourceLimits,
}

impl LimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the generated group name
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Limit CPU to `percent` of a single core
    pub fn with_cpu_limit(self, percent: u32) -> Self {
        Self {
            limits: ResourceLimits {
                cpu_percent: Some(percent),
                ..self.limits
            },
            ..self
        }
    }

    /// Override the CFS period (Linux only; ignored by job objects)
    pub fn with_cpu_period(self, period_us: u64) -> Self {
        Self {
            limits: ResourceLimits {
                cpu_period_us: Some(period_us),
                ..self.limits
            },
            ..self
        }
    }

    /// Limit memory for the whole group to `bytes`
    pub fn with_memory_limit(self, bytes: u64) -> Self {
        Self {
            limits: ResourceLimits {
                memory_bytes: Some(bytes),
                ..self.limits
            },
            ..self
        }
    }

    /// Resolve the group name and validate everything, ready for a backend
    pub fn resolve(&self) -> Result<(String, ResourceLimits)> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => random_name(),
        };
        validate_name(&name)?;
        self.limits.validate()?;
        Ok((name, self.limits.clone()))
    }
}

/// Random group name (UUID v4)
pub fn random_name() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Group names address a single flat level of the OS namespace
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(LimitError::Config(format!(
            "Invalid resource group name '{}'",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(LimitError::Config(format!(
            "Resource group name '{}' must not contain path separators",
            name
        )));
    }
    Ok(())
}
