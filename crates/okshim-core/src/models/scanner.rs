//! 스캐너 상태 모델.

use serde::{Deserialize, Serialize};

/// 스캐너 상태 기계.
///
/// 종료 상태는 없다. Faulted는 백오프 후 Arming으로 자동 복귀한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// 정지
    Idle,
    /// 캡처 세션 준비 중
    Arming,
    /// 틱 루프 실행 중
    Scanning,
    /// 명중 후 쿨다운
    Cooldown,
    /// 사용자 일시정지
    Paused,
    /// 캡처/디스패치 장애 — 백오프 대기
    Faulted,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScannerState::Idle => "Idle",
            ScannerState::Arming => "Arming",
            ScannerState::Scanning => "Scanning",
            ScannerState::Cooldown => "Cooldown",
            ScannerState::Paused => "Paused",
            ScannerState::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}

/// 워커 제어 명령 (셸 → 워커, stdin 파이프)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// 스캔 시작
    Start,
    /// 스캔 정지 (Idle로)
    Stop,
    /// 일시정지
    Pause,
    /// 재개
    Resume,
    /// 설정 파일 다시 읽기
    Reload,
    /// 워커 프로세스 종료
    Exit,
}
