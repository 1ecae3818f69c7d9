//! 캡처 대상 모델.

use serde::{Deserialize, Serialize};

/// 최상위 창 핸들 (HWND). 비 Windows 테스트에서는 임의 식별자.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub isize);

impl WindowHandle {
    pub fn raw(self) -> isize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// 창 해석 기준. 해석 우선순위는 Handle → Title → Process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowTarget {
    /// 명시적 핸들 (살아있는 최상위 창인지 검증됨)
    Handle(WindowHandle),
    /// 제목 패턴 (부분 일치 또는 완전 일치)
    Title {
        pattern: String,
        /// true면 부분 문자열 일치, false면 완전 일치
        partial: bool,
    },
    /// 소유 프로세스 이미지 이름 또는 전체 경로
    Process(String),
}

/// 캡처 소스 종별
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// 특정 창
    Window(WindowHandle),
    /// 모니터 (1-기반 인덱스)
    Monitor(u32),
}

/// 캡처 세션 옵션
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// 커서 오버레이 포함 여부
    pub include_cursor: bool,
    /// 캡처 테두리 장식 여부
    pub border_required: bool,
    /// 도착 프레임 처리 상한 (초과분은 최신 우선 폐기)
    pub fps_max: u32,
    /// 프레임 신선도 한도 (밀리초)
    pub timeout_ms: u64,
    /// 최소화 창의 비활성 복원 시도 여부 (세션당 1회)
    pub restore_minimized_noactivate: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_cursor: false,
            border_required: false,
            fps_max: 30,
            timeout_ms: 5000,
            restore_minimized_noactivate: true,
        }
    }
}
