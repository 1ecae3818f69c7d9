//! 클릭 드라이버 포트.
//!
//! 구현: `okshim-worker::clicker`
//! (메시지 방식 PostMessage 드라이버, 입력 합성 enigo 드라이버, NoOp).

use crate::error::CoreError;
use crate::models::geometry::Point;
use crate::models::target::WindowHandle;

/// 클릭 드라이버 — 좌표 변환/쿨다운이 끝난 뒤의 최종 전송 계층.
///
/// `screen_point`는 물리 화면 좌표, `client_point`는 대상 창 클라이언트
/// 좌표. 메시지 방식은 client_point를, 입력 합성 방식은 screen_point를
/// 사용한다. 드라이버는 자체 재시도를 하지 않는다 (백오프는 오케스트레이터 담당).
pub trait ClickDriver: Send + Sync {
    /// 좌클릭 down→up 시퀀스 전송
    fn click(
        &mut self,
        handle: WindowHandle,
        screen_point: Point,
        client_point: Point,
    ) -> Result<(), CoreError>;

    /// 드라이버 이름 (로그/이벤트용)
    fn name(&self) -> &'static str;
}
