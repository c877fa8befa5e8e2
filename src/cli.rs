//! Command-line front end: translate flags into a [`LimiterConfig`], run the
//! target command inside a resource group and mirror its exit code.
use crate::command::LimitedCommand;
use crate::limiter::Limiter;
#[cfg(any(target_os = "linux", windows))]
use crate::limiter::ResourceGroup;
use crate::limits::LimiterConfig;
use crate::types::{GIGABYTE, KILOBYTE, MEGABYTE};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[cfg(target_os = "linux")]
const GROUP_KIND: &str = "cgroup";
#[cfg(windows)]
const GROUP_KIND: &str = "job object";
#[cfg(not(any(target_os = "linux", windows)))]
const GROUP_KIND: &str = "resource group";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Name of the resource group. A random name is generated if not specified
    #[arg(long)]
    pub name: Option<String>,

    /// Maximum CPU percentage based on a single core (100 = 1 core, 0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub cpu: u32,

    /// Maximum memory usage in bytes, or with a K/M/G suffix (e.g. 512M, 1G)
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// JSON file with "name", "cpu_percent", "cpu_period_us" and "memory_bytes"; flags take precedence
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Use an existing resource group instead of creating one; it is kept on exit
    #[arg(long, requires = "name")]
    pub existing: bool,

    /// Mount point of the cgroup filesystem (Linux only)
    #[arg(long, default_value = "/sys/fs/cgroup")]
    pub cgroup_root: PathBuf,

    /// Program to run followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Parse sizes such as `2G`, `512M`, `64K` or `4096` (bytes). Suffixes are powers of 1024.
pub fn parse_memory(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, factor) = if let Some(stripped) = upper.strip_suffix('G') {
        (stripped, GIGABYTE)
    } else if let Some(stripped) = upper.strip_suffix('M') {
        (stripped, MEGABYTE)
    } else if let Some(stripped) = upper.strip_suffix('K') {
        (stripped, KILOBYTE)
    } else {
        (upper.as_str(), 1)
    };

    let number: u64 = digits
        .parse()
        .map_err(|e| format!("invalid memory value '{}': {}", value, e))?;
    number
        .checked_mul(factor)
        .ok_or_else(|| format!("invalid memory value '{}': too large", value))
}

impl Cli {
    /// Merge the optional config file with the command-line flags
    pub fn limiter_config(&self) -> anyhow::Result<LimiterConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str::<LimiterConfig>(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => LimiterConfig::new(),
        };

        if let Some(name) = &self.name {
            config = config.with_name(name.clone());
        }
        if self.cpu > 0 {
            config = config.with_cpu_limit(self.cpu);
        }
        if let Some(memory) = self.memory.filter(|&bytes| bytes > 0) {
            config = config.with_memory_limit(memory);
        }
        Ok(config)
    }
}

/// Parse the process arguments and run; returns the exit code to use
pub fn run() -> anyhow::Result<i32> {
    run_with(Cli::parse())
}

#[cfg(any(target_os = "linux", windows))]
pub fn run_with(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.limiter_config()?;

    let group = if cli.existing {
        let name = config.name.as_deref().unwrap_or_default();
        open_group(&cli, name).with_context(|| format!("failed to open {} {}", GROUP_KIND, name))?
    } else {
        create_group(&cli, &config).with_context(|| format!("failed to create {}", GROUP_KIND))?
    };
    log::info!("Using {} '{}'", GROUP_KIND, group.name());

    let result = run_limited(&group, &cli.command);

    if !cli.existing {
        let name = group.name().to_string();
        if let Err(e) = group.close() {
            log::warn!("Failed to remove {} '{}': {}", GROUP_KIND, name, e);
        }
    }
    result
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn run_with(cli: Cli) -> anyhow::Result<i32> {
    cli.limiter_config()?;
    anyhow::bail!("{}s are not supported on this platform", GROUP_KIND)
}

#[cfg(target_os = "linux")]
fn create_group(cli: &Cli, config: &LimiterConfig) -> crate::Result<crate::NativeGroup> {
    crate::cgroup::Cgroup::create_in(&cli.cgroup_root, config)
}

#[cfg(target_os = "linux")]
fn open_group(cli: &Cli, name: &str) -> crate::Result<crate::NativeGroup> {
    crate::cgroup::Cgroup::open_in(&cli.cgroup_root, name)
}

#[cfg(windows)]
fn create_group(_cli: &Cli, config: &LimiterConfig) -> crate::Result<crate::NativeGroup> {
    crate::job_object::JobObject::create(config)
}

#[cfg(windows)]
fn open_group(_cli: &Cli, name: &str) -> crate::Result<crate::NativeGroup> {
    crate::job_object::JobObject::open(name)
}

/// Run `command` with inherited stdio under `limiter`, forwarding termination signals
pub fn run_limited(limiter: &dyn Limiter, command: &[String]) -> anyhow::Result<i32> {
    let (program, args) = command.split_first().context("no command given")?;

    let mut cmd = LimitedCommand::new(Command::new(program), limiter);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    signals::install().context("failed to install signal handlers")?;
    cmd.start()
        .with_context(|| format!("failed to run {}", program))?;
    if let Some(pid) = cmd.id() {
        signals::forward_to(pid);
    }

    let status = cmd.wait();
    signals::forward_to(0);
    let status = status.with_context(|| format!("failed to wait for {}", program))?;

    log::debug!("{} exited with {}", program, status);
    Ok(status.code().unwrap_or(1))
}

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Pid that termination signals are relayed to; 0 when no child is running
    static CHILD_PID: AtomicI32 = AtomicI32::new(0);

    const FORWARDED: [Signal; 4] = [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ];

    extern "C" fn relay(signal: libc::c_int) {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, signal);
            }
        }
    }

    pub fn install() -> nix::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(relay),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in FORWARDED {
            unsafe {
                sigaction(signal, &action)?;
            }
        }
        Ok(())
    }

    pub fn forward_to(pid: u32) {
        CHILD_PID.store(pid as i32, Ordering::SeqCst);
    }
}

// Console control events already reach every process attached to the console
#[cfg(not(unix))]
mod signals {
    pub fn install() -> std::io::Result<()> {
        Ok(())
    }

    pub fn forward_to(_pid: u32) {}
}
