//! Windows job-object backend.
#![allow(unsafe_code)]

use crate::limiter::{Limiter, ResourceGroup};
use crate::limits::{validate_name, LimiterConfig, ResourceLimits, MAX_CPU_RATE};
use crate::types::{LimitError, Result};
use std::ffi::OsStr;
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, IntoRawHandle, OwnedHandle, RawHandle};
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectCpuRateControlInformation,
    JobObjectExtendedLimitInformation, OpenJobObjectW, SetInformationJobObject,
    JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_ALL_ACCESS, JOB_OBJECT_CPU_RATE_CONTROL_ENABLE,
    JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP, JOB_OBJECT_LIMIT_JOB_MEMORY,
};
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

/// A named job object with CPU and memory limits applied
#[derive(Debug)]
pub struct JobObject {
    name: String,
    limits: ResourceLimits,
    handle: OwnedHandle,
}

impl JobObject {
    /// Create a job object and apply every configured limit
    ///
    /// The handle is closed again if any limit cannot be applied.
    pub fn create(config: &LimiterConfig) -> Result<Self> {
        let (name, limits) = config.resolve()?;
        let wide = to_wide(&name);

        let raw = unsafe { CreateJobObjectW(ptr::null(), wide.as_ptr()) };
        if raw.is_null() {
            return Err(LimitError::Create {
                name,
                source: io::Error::last_os_error(),
            });
        }
        // From here on dropping `handle` closes the job
        let handle = unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) };
        log::debug!("Created job object '{}'", name);

        let job = Self {
            name,
            limits,
            handle,
        };
        if let Err(source) = job.apply_limits() {
            return Err(LimitError::Create {
                name: job.name.clone(),
                source,
            });
        }

        log::info!("Created job object '{}' with limits {:?}", job.name, job.limits);
        Ok(job)
    }

    /// Open an existing job object by name. Limits are left untouched.
    pub fn open(name: &str) -> Result<Self> {
        validate_name(name)?;
        let wide = to_wide(name);

        let raw = unsafe { OpenJobObjectW(JOB_OBJECT_ALL_ACCESS, 0, wide.as_ptr()) };
        if raw.is_null() {
            return Err(LimitError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        log::debug!("Opened job object '{}'", name);
        Ok(Self {
            name: name.to_string(),
            limits: ResourceLimits::default(),
            handle: unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) },
        })
    }

    fn raw(&self) -> HANDLE {
        use std::os::windows::io::AsRawHandle;
        self.handle.as_raw_handle() as HANDLE
    }

    fn apply_limits(&self) -> io::Result<()> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        if let Some(rate) = self.limits.cpu_rate(cores) {
            let rate = rate.clamp(1, MAX_CPU_RATE);
            let mut info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION = unsafe { mem::zeroed() };
            info.ControlFlags =
                JOB_OBJECT_CPU_RATE_CONTROL_ENABLE | JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP;
            info.Anonymous.CpuRate = rate;
            self.set_information(
                JobObjectCpuRateControlInformation,
                &info as *const _ as *const _,
                mem::size_of::<JOBOBJECT_CPU_RATE_CONTROL_INFORMATION>(),
            )
            .map_err(|e| io::Error::new(e.kind(), format!("failed to set CPU rate: {}", e)))?;
            log::debug!("Set CPU rate {} on {} cores", rate, cores);
        }

        if let Some(bytes) = self.limits.memory_bytes {
            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_JOB_MEMORY;
            info.JobMemoryLimit = usize::try_from(bytes).unwrap_or(usize::MAX);
            self.set_information(
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const _,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>(),
            )
            .map_err(|e| {
                io::Error::new(e.kind(), format!("failed to set memory limit: {}", e))
            })?;
            log::debug!("Set job memory limit {}", bytes);
        }

        Ok(())
    }

    fn set_information(
        &self,
        class: i32,
        info: *const core::ffi::c_void,
        len: usize,
    ) -> io::Result<()> {
        let ok = unsafe { SetInformationJobObject(self.raw(), class, info, len as u32) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Limiter for JobObject {
    fn limit(&self, pid: u32) -> Result<()> {
        let attach_error = |source: io::Error| LimitError::Attach {
            name: self.name.clone(),
            pid,
            source,
        };

        if pid == 0 {
            return Err(attach_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "must provide a valid pid",
            )));
        }

        let raw = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid) };
        if raw.is_null() {
            return Err(attach_error(io::Error::last_os_error()));
        }
        let process = unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) };

        use std::os::windows::io::AsRawHandle;
        let ok = unsafe { AssignProcessToJobObject(self.raw(), process.as_raw_handle() as HANDLE) };
        if ok == 0 {
            return Err(attach_error(io::Error::last_os_error()));
        }

        log::debug!("Assigned process {} to job object '{}'", pid, self.name);
        Ok(())
    }
}

impl ResourceGroup for JobObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Close our handle. The job itself lives on while attached processes run.
    fn close(self) -> Result<()> {
        let raw = self.handle.into_raw_handle() as HANDLE;
        if unsafe { CloseHandle(raw) } == 0 {
            return Err(LimitError::Close {
                name: self.name,
                source: io::Error::last_os_error(),
            });
        }
        log::info!("Closed job object '{}'", self.name);
        Ok(())
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(iter::once(0)).collect()
}
