//! 공유 프레임 캐시.
//!
//! 단일 생산자(캡처 콜백 스레드) — 다중 소비자(스캐너, 프리뷰) 구조의
//! 최신 프레임 슬롯. 발행은 짧은 임계 구역 안의 포인터 교체이고, 프레임
//! 바이트는 발행 후 불변이므로 소비자는 락 밖에서 읽는다.
//!
//! 소비자는 불투명 문자열 태그로 식별한다. 태그 네임스페이스:
//! `scanner`, `preview:<hwnd>`, `test:<id>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use okshim_core::models::frame::Frame;
use tracing::{debug, trace, warn};

/// 소비자별 접근 기록
#[derive(Debug)]
struct ConsumerEntry {
    first_access: Instant,
    last_access: Instant,
    hit_count: u64,
    /// 마지막 acquire에서 건네준 프레임. release 시까지 참조를 유지한다.
    held: Option<Arc<Frame>>,
}

/// 캐시 통계 (누적)
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub publishes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Arc<Frame>>,
    consumers: HashMap<String, ConsumerEntry>,
    stats: CacheStats,
}

/// 공유 프레임 캐시.
///
/// 교체는 소비자 관점에서 원자적이다: 핸들을 쥔 소비자는 release 전까지
/// 이전 프레임을 계속 본다. 이전 저장소는 마지막 참조가 떨어질 때 해제된다.
#[derive(Debug)]
pub struct SharedFrameCache {
    slot: Mutex<Slot>,
    /// 잊힌 소비자 기록의 수명 한도
    session_timeout: Duration,
}

impl SharedFrameCache {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            session_timeout,
        }
    }

    /// 기본 수명(5분)으로 생성
    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_secs(300))
    }

    /// 새 프레임 발행 — 슬롯을 원자적으로 교체한다.
    ///
    /// 유일한 호출자는 캡처 측(콜백 스레드 또는 테스트 소스)이다.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        let mut slot = self.slot.lock().expect("캐시 락 오염");
        slot.current = Some(frame);
        slot.stats.publishes += 1;
        trace!(publishes = slot.stats.publishes, "프레임 발행");
    }

    /// 현재 프레임 엿보기 — 소비자 기록 없이 참조만 복제
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.slot.lock().expect("캐시 락 오염").current.clone()
    }

    /// 소비자 태그로 현재 프레임 획득.
    ///
    /// 재획득은 기존 기록의 타임스탬프만 갱신한다 (태그당 기록 1개).
    pub fn acquire(&self, consumer_id: &str) -> Option<Arc<Frame>> {
        let now = Instant::now();
        let mut slot = self.slot.lock().expect("캐시 락 오염");
        let frame = match slot.current.clone() {
            Some(f) => f,
            None => {
                slot.stats.misses += 1;
                return None;
            }
        };
        slot.stats.hits += 1;
        let entry = slot
            .consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerEntry {
                first_access: now,
                last_access: now,
                hit_count: 0,
                held: None,
            });
        entry.last_access = now;
        entry.hit_count += 1;
        entry.held = Some(frame.clone());
        Some(frame)
    }

    /// 소비자의 참조 해제. 같은 태그로 두 번 호출해도 두 번째는 no-op.
    pub fn release(&self, consumer_id: &str) {
        let mut slot = self.slot.lock().expect("캐시 락 오염");
        if let Some(entry) = slot.consumers.get_mut(consumer_id) {
            entry.held = None;
        }
    }

    /// release를 잊은 소비자 기록 청소. 주기 스위퍼가 호출한다.
    pub fn sweep(&self) {
        let timeout = self.session_timeout;
        let mut slot = self.slot.lock().expect("캐시 락 오염");
        let before = slot.consumers.len();
        slot.consumers
            .retain(|id, entry| {
                let stale = entry.last_access.elapsed() > timeout;
                if stale {
                    warn!(consumer = %id, "방치된 소비자 기록 제거");
                }
                !stale
            });
        let removed = before - slot.consumers.len();
        if removed > 0 {
            debug!(removed, "캐시 스위프 완료");
        }
    }

    /// 참조자가 없고 지정 시간보다 오래된 슬롯 비우기
    pub fn evict_stale(&self, max_age: Duration) {
        let mut slot = self.slot.lock().expect("캐시 락 오염");
        let no_holders = slot.consumers.values().all(|c| c.held.is_none());
        let expired = slot
            .current
            .as_ref()
            .is_some_and(|c| no_holders && c.timestamp.elapsed() > max_age);
        if expired {
            slot.current = None;
            debug!("오래된 프레임 슬롯 비움");
        }
    }

    /// 현재 프레임을 참조 중인 소비자 수
    pub fn holder_count(&self) -> usize {
        self.slot
            .lock()
            .expect("캐시 락 오염")
            .consumers
            .values()
            .filter(|c| c.held.is_some())
            .count()
    }

    /// 등록된 소비자 기록 수 (release 후에도 sweep 전까지 유지)
    pub fn consumer_count(&self) -> usize {
        self.slot.lock().expect("캐시 락 오염").consumers.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.slot.lock().expect("캐시 락 오염").stats
    }
}

/// 백그라운드 스위퍼 루프. 종료 신호까지 주기적으로 sweep을 수행한다.
pub async fn run_sweeper(
    cache: Arc<SharedFrameCache>,
    period: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                cache.sweep();
            }
            _ = shutdown_rx.changed() => {
                debug!("캐시 스위퍼 종료");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okshim_core::models::frame::PixelFormat;

    fn frame_filled(value: u8) -> Frame {
        Frame::tight(4, 4, PixelFormat::Bgra8, vec![value; 4 * 4 * 4]).unwrap()
    }

    #[test]
    fn acquire_returns_latest_published() {
        let cache = SharedFrameCache::with_default_timeout();
        assert!(cache.acquire("scanner").is_none());

        cache.publish(frame_filled(1));
        let f = cache.acquire("scanner").unwrap();
        assert_eq!(f.row(0)[0], 1);
    }

    #[test]
    fn held_reference_survives_replacement() {
        let cache = SharedFrameCache::with_default_timeout();
        cache.publish(frame_filled(1));
        let old = cache.acquire("scanner").unwrap();

        cache.publish(frame_filled(2));
        // 기존 핸들은 교체 후에도 이전 프레임을 본다
        assert_eq!(old.row(0)[0], 1);
        // 새로 획득하면 최신 프레임
        assert_eq!(cache.acquire("preview:42").unwrap().row(0)[0], 2);
    }

    #[test]
    fn storage_freed_after_release_and_supersede() {
        let cache = SharedFrameCache::with_default_timeout();
        cache.publish(frame_filled(1));
        let old = cache.acquire("scanner").unwrap();
        let weak = Arc::downgrade(&old);

        cache.publish(frame_filled(2));
        drop(old);
        // 캐시가 아직 held로 참조 유지 중
        assert!(weak.upgrade().is_some());

        cache.release("scanner");
        // 교체됨 + 참조 0 → 저장소 해제
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn double_release_is_noop() {
        let cache = SharedFrameCache::with_default_timeout();
        cache.publish(frame_filled(7));
        cache.acquire("test:a");
        cache.release("test:a");
        cache.release("test:a");
        assert_eq!(cache.holder_count(), 0);
        assert_eq!(cache.consumer_count(), 1);
    }

    #[test]
    fn reacquire_keeps_single_record_per_tag() {
        let cache = SharedFrameCache::with_default_timeout();
        cache.publish(frame_filled(3));
        cache.acquire("scanner");
        cache.acquire("scanner");
        cache.acquire("scanner");
        assert_eq!(cache.consumer_count(), 1);
        assert_eq!(cache.stats().hits, 3);
    }

    #[test]
    fn sweep_unregisters_forgotten_consumers() {
        let cache = SharedFrameCache::new(Duration::from_millis(0));
        cache.publish(frame_filled(5));
        cache.acquire("preview:99");
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.consumer_count(), 0);
    }

    #[test]
    fn evict_stale_respects_holders() {
        let cache = SharedFrameCache::with_default_timeout();
        cache.publish(frame_filled(5));
        let _held = cache.acquire("scanner").unwrap();

        // 참조자가 있으면 나이와 무관하게 유지
        cache.evict_stale(Duration::from_millis(0));
        assert!(cache.peek().is_some());

        cache.release("scanner");
        std::thread::sleep(Duration::from_millis(2));
        cache.evict_stale(Duration::from_millis(1));
        assert!(cache.peek().is_none());
    }

    #[test]
    fn concurrent_acquire_release() {
        let cache = Arc::new(SharedFrameCache::with_default_timeout());
        cache.publish(frame_filled(9));

        let mut handles = Vec::new();
        for i in 0..8 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || {
                let tag = format!("test:{i}");
                for _ in 0..100 {
                    if let Some(f) = c.acquire(&tag) {
                        assert_eq!(f.row(0)[0], 9);
                    }
                    c.release(&tag);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.holder_count(), 0);
    }
}
