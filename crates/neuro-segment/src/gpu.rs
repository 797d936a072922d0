//! Best-effort compute resource discovery.

use std::process::Stdio;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }

    pub fn is_gpu(self) -> bool {
        self == Device::Cuda
    }
}

/// `nvidia-smi` exits 0 within five seconds. Any failure means CPU.
pub async fn detect_gpu() -> Device {
    let probe = tokio::process::Command::new("nvidia-smi")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(status)) if status.success() => {
            tracing::info!("NVIDIA GPU detected, using CUDA");
            Device::Cuda
        }
        Ok(Ok(status)) => {
            tracing::info!(code = ?status.code(), "nvidia-smi failed, using CPU");
            Device::Cpu
        }
        Ok(Err(e)) => {
            tracing::info!(error = %e, "nvidia-smi not available, using CPU");
            Device::Cpu
        }
        Err(_) => {
            tracing::warn!("nvidia-smi timed out, using CPU");
            Device::Cpu
        }
    }
}

/// One thread on GPU; on CPU leave two cores free, never fewer than one thread.
pub fn thread_count(device: Device, cpus: usize) -> usize {
    match device {
        Device::Cuda => 1,
        Device::Cpu => cpus.saturating_sub(2).max(1),
    }
}

pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_heuristic() {
        assert_eq!(thread_count(Device::Cpu, 8), 6);
        assert_eq!(thread_count(Device::Cpu, 2), 1);
        assert_eq!(thread_count(Device::Cpu, 1), 1);
        assert_eq!(thread_count(Device::Cuda, 64), 1);
    }
}
