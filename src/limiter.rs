//! The limiter capability consumed by [`LimitedCommand`] and the resource
//! group abstraction implemented once per platform.
use crate::command::LimitedCommand;
use crate::limits::{LimiterConfig, ResourceLimits};
use crate::types::Result;
use std::ffi::OsStr;
use std::process::Command;

/// Something that can place a running process under resource limits
pub trait Limiter {
    /// Apply limits to the running process `pid`
    fn limit(&self, pid: u32) -> Result<()>;

    /// Build a command for `program` that is limited by `self` once started
    fn command<S: AsRef<OsStr>>(&self, program: S) -> LimitedCommand<'_>
    where
        Self: Sized,
    {
        LimitedCommand::new(Command::new(program), self)
    }

    /// Wrap an unstarted command so that it is limited by `self` once started
    fn wrap(&self, command: Command) -> LimitedCommand<'_>
    where
        Self: Sized,
    {
        LimitedCommand::new(command, self)
    }
}

/// An OS-native resource-control object (cgroup, job object)
///
/// The caller owns the group and must [`close`](ResourceGroup::close) it.
/// Closing does not touch processes that were already attached.
pub trait ResourceGroup: Limiter {
    fn name(&self) -> &str;

    /// Limits applied at creation; empty for groups that were opened by name
    fn limits(&self) -> &ResourceLimits;

    /// Release the native object
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

impl<L: Limiter + ?Sized> Limiter for &L {
    fn limit(&self, pid: u32) -> Result<()> {
        (**self).limit(pid)
    }
}

/// Limiter that accepts every process without restricting it
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl Limiter for Unlimited {
    fn limit(&self, pid: u32) -> Result<()> {
        log::debug!("Not limiting process {}", pid);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub type NativeGroup = crate::cgroup::Cgroup;

#[cfg(windows)]
pub type NativeGroup = crate::job_object::JobObject;

/// Create the platform's native resource group from `config`
#[cfg(any(target_os = "linux", windows))]
pub fn create(config: &LimiterConfig) -> Result<NativeGroup> {
    NativeGroup::create(config)
}

/// Open an existing native resource group by name, without applying limits
#[cfg(any(target_os = "linux", windows))]
pub fn open(name: &str) -> Result<NativeGroup> {
    NativeGroup::open(name)
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn create(_config: &LimiterConfig) -> Result<Unlimited> {
    Err(crate::types::LimitError::Config(
        "Resource groups are only supported on Linux and Windows".to_string(),
    ))
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn open(_name: &str) -> Result<Unlimited> {
    Err(crate::types::LimitError::Config(
        "Resource groups are only supported on Linux and Windows".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_accepts_any_pid() {
        assert!(Unlimited.limit(1).is_ok());
        assert!(Unlimited.limit(u32::MAX).is_ok());
    }

    #[test]
    fn test_limiter_reference_forwards() {
        let limiter = Unlimited;
        let by_ref: &dyn Limiter = &limiter;
        assert!((&by_ref).limit(7).is_ok());
    }
}
