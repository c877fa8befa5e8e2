//! limitbox: run a process under CPU and memory ceilings
//!
//! Limits are enforced by the host's native resource-control facility:
//! control groups on Linux, job objects on Windows. A [`LimiterConfig`] is
//! built with chained `with_*` steps and turned into a [`NativeGroup`]; the
//! group then limits any [`LimitedCommand`] started through it.
//!
//! ```no_run
//! use limitbox::{Limiter, LimiterConfig, ResourceGroup, MEGABYTE};
//!
//! # fn main() -> limitbox::Result<()> {
//! let group = limitbox::create(
//!     &LimiterConfig::new()
//!         .with_cpu_limit(50)
//!         .with_memory_limit(512 * MEGABYTE),
//! )?;
//! let output = group.command("echo").arg("hello").output()?;
//! assert_eq!(output, b"hello\n");
//! group.close()?;
//! # Ok(())
//! # }
//! ```

#[cfg(target_os = "linux")]
pub mod cgroup;
pub mod cli;
pub mod command;
pub mod io_handler;
#[cfg(windows)]
pub mod job_object;
pub mod limiter;
pub mod limits;
pub mod types;

pub use command::{CommandState, LimitedCommand};
pub use io_handler::CaptureBuffer;
#[cfg(any(target_os = "linux", windows))]
pub use limiter::NativeGroup;
pub use limiter::{create, open, Limiter, ResourceGroup, Unlimited};
pub use limits::{LimiterConfig, ResourceLimits};
pub use types::{LimitError, Result, BYTE, GIGABYTE, KILOBYTE, MEGABYTE};
