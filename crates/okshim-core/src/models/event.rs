//! 워커 → 셸 상태 이벤트 모델.
//!
//! 종별마다 깊이 1의 최신 우선 슬롯으로 전달된다 (okshim-worker의 status 채널).
//! 프로세스 경계에서는 JSON Lines로 직렬화된다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::matching::{ClickInfo, MatchResult};
use super::scanner::ScannerState;

/// 상태 이벤트. 종별(kind)당 최신 1건만 유효하다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    /// 스캐너 상태 전이
    StatusChanged {
        state: ScannerState,
        /// 사람이 읽을 보조 설명 (비어 있을 수 있음)
        detail: String,
        timestamp: DateTime<Utc>,
    },
    /// 임계값을 넘은 매칭 (클릭 여부와 무관)
    Match { result: MatchResult },
    /// 클릭 디스패치 완료
    Click { info: ClickInfo },
    /// 복구 가능 에러 발생
    Error {
        /// `CoreError::kind()` 문자열
        error_kind: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    /// 주기 성능 지표
    PerfTick {
        /// 캡처 실측 fps
        fps: f32,
        /// 워커 프로세스 CPU 사용률 (%)
        cpu: f32,
        /// 워커 프로세스 메모리 (bytes)
        mem_bytes: u64,
        /// 프레임 캐시 적중 횟수 (누적)
        cache_hits: u64,
        /// 프레임 캐시 발행 횟수 (누적)
        cache_publishes: u64,
        timestamp: DateTime<Utc>,
    },
}

/// 이벤트 종별 — 최신 우선 채널의 슬롯 키
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Match,
    Click,
    Error,
    Perf,
}

impl StatusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StatusEvent::StatusChanged { .. } => EventKind::Status,
            StatusEvent::Match { .. } => EventKind::Match,
            StatusEvent::Click { .. } => EventKind::Click,
            StatusEvent::Error { .. } => EventKind::Error,
            StatusEvent::PerfTick { .. } => EventKind::Perf,
        }
    }

    /// 상태 전이 이벤트 생성 헬퍼
    pub fn status(state: ScannerState, detail: impl Into<String>) -> Self {
        StatusEvent::StatusChanged {
            state,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    /// 에러 이벤트 생성 헬퍼
    pub fn error(err: &crate::error::CoreError) -> Self {
        StatusEvent::Error {
            error_kind: err.kind().to_string(),
            detail: err.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_roundtrip() {
        let ev = StatusEvent::status(ScannerState::Scanning, "tick");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"status_changed\""));
        let back: StatusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::Status);
    }

    #[test]
    fn error_event_carries_taxonomy_kind() {
        let err = crate::error::CoreError::WindowGone;
        let ev = StatusEvent::error(&err);
        match ev {
            StatusEvent::Error { error_kind, .. } => assert_eq!(error_kind, "WindowGone"),
            _ => panic!("Error 이벤트여야 함"),
        }
    }
}
