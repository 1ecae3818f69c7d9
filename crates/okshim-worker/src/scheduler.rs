//! 적응 스캔 스케줄러.
//!
//! 전경 프로세스와 명중/미스 이력에서 다음 스캔 지연을 결정한다.
//!
//! - 명중 직후에는 hit_cooldown_ms 동안 냉각;
//! - 전경이 화이트리스트 밖이면 idle_scan_interval_ms;
//! - 그 외에는 active_scan_interval_ms에서 miss_count 지수 백오프
//!   (밑 2, miss_backoff_ms_max 상한).
//!
//! 창 기반 캡처는 event 모드(화이트리스트 구동), 모니터 캡처는
//! polling 모드(화이트리스트 무시, 항상 활성)로 동작한다.

use std::time::Instant;

use okshim_core::config::{AppConfig, CaptureBackend};
use tracing::trace;

/// 스캔 모드 — 캡처 백엔드에서 파생된다
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// 화이트리스트 전경일 때만 적극 스캔
    Event,
    /// 화이트리스트 무시, 항상 적극 스캔 (모니터 캡처)
    Polling,
}

/// 스케줄러 파라미터 (AppConfig에서 매핑)
#[derive(Debug, Clone)]
pub struct SchedulerParams {
    pub scan_mode: ScanMode,
    pub active_scan_interval_ms: u64,
    pub idle_scan_interval_ms: u64,
    pub miss_backoff_ms_max: u64,
    pub hit_cooldown_ms: u64,
    pub process_whitelist: Vec<String>,
}

impl SchedulerParams {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            scan_mode: match cfg.capture_backend {
                CaptureBackend::Window => ScanMode::Event,
                CaptureBackend::Monitor => ScanMode::Polling,
            },
            active_scan_interval_ms: cfg.active_scan_interval_ms,
            idle_scan_interval_ms: cfg.idle_scan_interval_ms,
            miss_backoff_ms_max: cfg.miss_backoff_ms_max,
            hit_cooldown_ms: cfg.hit_cooldown_ms,
            process_whitelist: cfg.process_whitelist.clone(),
        }
    }
}

/// 적응 스캔 스케줄러. 스캐너 스레드 단독 사용 (락 없음).
#[derive(Debug)]
pub struct AdaptiveScheduler {
    params: SchedulerParams,
    /// 적극 스캔 상태 (전경 화이트리스트 여부)
    active: bool,
    /// 연속 미스 수
    miss_count: u32,
    last_hit: Option<Instant>,
    last_foreground: String,
}

impl AdaptiveScheduler {
    pub fn new(params: SchedulerParams) -> Self {
        let active = params.scan_mode == ScanMode::Polling;
        Self {
            params,
            active,
            miss_count: 0,
            last_hit: None,
            last_foreground: String::new(),
        }
    }

    /// 명중: 백오프 리셋 + 냉각 시작
    pub fn on_hit(&mut self) {
        self.on_hit_at(Instant::now());
    }

    pub fn on_hit_at(&mut self, now: Instant) {
        self.miss_count = 0;
        self.last_hit = Some(now);
    }

    /// 미스: 백오프 누적. 냉각 구간의 미스는 백오프를 키우지 않는다.
    pub fn on_miss(&mut self) {
        self.on_miss_at(Instant::now());
    }

    pub fn on_miss_at(&mut self, now: Instant) {
        if !self.in_hit_cooldown(now) {
            self.miss_count = self.miss_count.saturating_add(1);
        }
    }

    /// 적격 매칭(클릭 전 스트릭 누적 포함) 시 백오프만 리셋.
    /// 냉각은 클릭이 실제로 나간 on_hit에서 시작된다.
    pub fn reset_backoff(&mut self) {
        self.miss_count = 0;
    }

    /// 전경 프로세스 변화: 화이트리스트 판정 갱신 + 백오프 최소로 리셋
    pub fn on_foreground_change(&mut self, process_name: Option<&str>) {
        let name = process_name.unwrap_or("").trim().to_string();
        if name == self.last_foreground {
            return;
        }
        self.last_foreground = name.clone();
        self.miss_count = 0;
        self.active = match self.params.scan_mode {
            ScanMode::Polling => true,
            ScanMode::Event => {
                let lower = name.to_ascii_lowercase();
                !lower.is_empty()
                    && self
                        .params
                        .process_whitelist
                        .iter()
                        .any(|p| p.to_ascii_lowercase() == lower)
            }
        };
        trace!(foreground = %self.last_foreground, active = self.active, "전경 변화");
    }

    /// 다음 스캔 지연 (밀리초)
    pub fn next_delay_ms(&self) -> u64 {
        self.next_delay_ms_at(Instant::now())
    }

    pub fn next_delay_ms_at(&self, now: Instant) -> u64 {
        // 냉각 중이면 남은 냉각 시간
        if let Some(remaining) = self.hit_cooldown_remaining_ms(now) {
            return remaining.max(1);
        }
        // 비활성: 느린 주기
        if !self.active {
            return self.params.idle_scan_interval_ms;
        }
        // 활성: 지수 백오프 (시프트 폭 제한으로 오버플로 방지)
        let base = self.params.active_scan_interval_ms.max(1);
        let delay = base.saturating_mul(1u64 << self.miss_count.min(16));
        delay.clamp(base, self.params.miss_backoff_ms_max.max(base))
    }

    fn in_hit_cooldown(&self, now: Instant) -> bool {
        self.hit_cooldown_remaining_ms(now).is_some()
    }

    fn hit_cooldown_remaining_ms(&self, now: Instant) -> Option<u64> {
        let hit = self.last_hit?;
        let elapsed = now.duration_since(hit).as_millis() as u64;
        if elapsed < self.params.hit_cooldown_ms {
            Some(self.params.hit_cooldown_ms - elapsed)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(mode: ScanMode) -> SchedulerParams {
        SchedulerParams {
            scan_mode: mode,
            active_scan_interval_ms: 120,
            idle_scan_interval_ms: 2_000,
            miss_backoff_ms_max: 5_000,
            hit_cooldown_ms: 4_000,
            process_whitelist: vec!["Code.exe".into(), "Windsurf.exe".into()],
        }
    }

    #[test]
    fn idle_when_foreground_not_whitelisted() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Event));
        s.on_foreground_change(Some("chrome.exe"));
        assert_eq!(s.next_delay_ms(), 2_000);
        // 화이트리스트 전환 직후엔 최소 주기
        s.on_foreground_change(Some("Code.exe"));
        assert_eq!(s.next_delay_ms(), 120);
    }

    #[test]
    fn whitelist_match_is_case_insensitive() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Event));
        s.on_foreground_change(Some("code.exe"));
        assert_eq!(s.next_delay_ms(), 120);
    }

    #[test]
    fn miss_backoff_doubles_and_clamps() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Event));
        s.on_foreground_change(Some("Code.exe"));
        let expected = [120u64, 240, 480, 960, 1_920, 3_840, 5_000, 5_000];
        for want in expected {
            assert_eq!(s.next_delay_ms(), want);
            s.on_miss();
        }
    }

    #[test]
    fn hit_resets_backoff_and_enters_cooldown() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Event));
        s.on_foreground_change(Some("Code.exe"));
        for _ in 0..5 {
            s.on_miss();
        }
        let t0 = Instant::now();
        s.on_hit_at(t0);
        // 냉각 잔여 시간 반환
        let d = s.next_delay_ms_at(t0 + Duration::from_millis(1_000));
        assert!(d > 2_900 && d <= 3_000, "delay={d}");
        // 냉각 종료 후 최소 주기부터 다시
        assert_eq!(s.next_delay_ms_at(t0 + Duration::from_millis(4_100)), 120);
    }

    #[test]
    fn miss_during_cooldown_does_not_grow_backoff() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Event));
        s.on_foreground_change(Some("Code.exe"));
        let t0 = Instant::now();
        s.on_hit_at(t0);
        s.on_miss_at(t0 + Duration::from_millis(100));
        s.on_miss_at(t0 + Duration::from_millis(200));
        assert_eq!(s.next_delay_ms_at(t0 + Duration::from_millis(4_100)), 120);
    }

    #[test]
    fn polling_mode_ignores_whitelist() {
        let mut s = AdaptiveScheduler::new(params(ScanMode::Polling));
        s.on_foreground_change(Some("explorer.exe"));
        assert_eq!(s.next_delay_ms(), 120);
    }

    #[test]
    fn delay_stays_within_contract_bounds() {
        let p = params(ScanMode::Event);
        let upper = p
            .idle_scan_interval_ms
            .max(p.miss_backoff_ms_max)
            .max(p.hit_cooldown_ms);
        let mut s = AdaptiveScheduler::new(p.clone());
        for step in 0..100u32 {
            match step % 7 {
                0 => s.on_foreground_change(Some("Code.exe")),
                1 => s.on_foreground_change(Some("other.exe")),
                2 => s.on_hit(),
                _ => s.on_miss(),
            }
            let d = s.next_delay_ms();
            assert!(d >= 1 && d <= upper, "step={step} delay={d}");
            if s.active && !s.in_hit_cooldown(Instant::now()) {
                assert!(d >= p.active_scan_interval_ms);
            }
        }
    }
}
