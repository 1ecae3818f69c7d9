//! 창 탐색 포트.
//!
//! 구현: `okshim-capture::locator` (Win32 EnumWindows 기반).
//! 탐색기는 절대 창을 활성화하거나 올리지 않는다.

use crate::error::CoreError;
use crate::models::geometry::Rect;
use crate::models::target::{WindowHandle, WindowTarget};

/// 창 탐색기.
///
/// `resolve`는 틱당 최대 하나의 핸들을 돌려준다. 복수 후보가 있으면
/// 가장 위(z-순서)의 보이는 비최소화 창을 택한다.
pub trait WindowLocator: Send + Sync {
    /// 대상 기준을 살아있는 최상위 창 핸들로 해석.
    ///
    /// 에러: 후보 없음 → `TargetNotFound`, 보유 핸들 무효 → `TargetStale`.
    /// 둘 다 복구 가능 (다음 틱 재시도).
    fn resolve(&self, target: &WindowTarget) -> Result<WindowHandle, CoreError>;

    /// 클라이언트 영역 (물리 픽셀, 화면 좌표)
    fn client_rect(&self, handle: WindowHandle) -> Result<Rect, CoreError>;

    /// 핸들이 여전히 살아있는 창인지
    fn is_alive(&self, handle: WindowHandle) -> bool;

    /// 창이 최소화 상태인지
    fn is_minimized(&self, handle: WindowHandle) -> bool;

    /// 현재 전경 창의 소유 프로세스 이미지 이름
    fn foreground_process(&self) -> Option<String>;

    /// 핸들 소유 프로세스 이미지 이름
    fn process_name(&self, handle: WindowHandle) -> Option<String>;
}
