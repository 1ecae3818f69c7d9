//! 워커 성능 샘플러.
//!
//! sysinfo로 자기 프로세스의 CPU/메모리를 읽어 PerfTick 이벤트 재료를
//! 만든다. 샘플 간격은 오케스트레이터가 관리한다.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// 프로세스 자원 샘플러
pub struct PerfSampler {
    sys: System,
    pid: Pid,
}

impl PerfSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// (cpu %, 메모리 bytes) 샘플
    pub fn sample(&mut self) -> (f32, u64) {
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        match self.sys.process(self.pid) {
            Some(p) => (p.cpu_usage(), p.memory()),
            None => (0.0, 0),
        }
    }
}

impl Default for PerfSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_own_process() {
        let mut sampler = PerfSampler::new();
        let (_cpu, mem) = sampler.sample();
        // 자기 프로세스 메모리는 0일 수 없다
        assert!(mem > 0);
    }
}
