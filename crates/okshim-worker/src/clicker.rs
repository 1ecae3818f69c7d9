//! 클릭 디스패처.
//!
//! 좌표 변환 → 경계 검증 → 쿨다운 → 드라이버 전송 순서로 진행한다.
//! 시스템 커서는 움직이지 않고 포커스도 바꾸지 않는다 (메시지 방식 기준).
//!
//! 드라이버는 자체 재시도를 하지 않는다. 복구는 오케스트레이터의 몫이다.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use okshim_core::error::CoreError;
use okshim_core::models::geometry::Point;
use okshim_core::models::matching::{ClickInfo, TemplateId};
use okshim_core::models::target::WindowHandle;
use okshim_core::ports::clicker::ClickDriver;
use okshim_core::ports::locator::WindowLocator;
use tracing::{debug, info, warn};

/// 디스패치 결과
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// 클릭 전송 완료
    Clicked(ClickInfo),
    /// 쿨다운 중 — 조용히 거부 (에러 아님)
    Cooling,
}

/// 클릭 디스패처
pub struct ClickDispatcher {
    driver: Box<dyn ClickDriver>,
    cooldown: Duration,
    verify_bounds: bool,
    /// 핸들별 마지막 성공 디스패치 시각
    last_dispatch: HashMap<isize, Instant>,
}

impl ClickDispatcher {
    pub fn new(driver: Box<dyn ClickDriver>, cooldown: Duration, verify_bounds: bool) -> Self {
        Self {
            driver,
            cooldown,
            verify_bounds,
            last_dispatch: HashMap::new(),
        }
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// 매칭 지점에 좌클릭 전송.
    ///
    /// `frame_point`는 대상 창 클라이언트 좌표계의 매칭 중심
    /// (캡처 프레임 좌표와 동일 공간). 절차:
    /// 1. 물리 클라이언트 영역 조회
    /// 2. screen = client_origin + frame_point + click_offset
    /// 3. (옵션) screen이 클라이언트 영역 안인지 검증 — 창이 움직였을 수 있다
    /// 4. 핸들별 쿨다운 검사
    /// 5. 드라이버로 down→up 전송
    pub fn dispatch(
        &mut self,
        locator: &dyn WindowLocator,
        handle: WindowHandle,
        template_id: &TemplateId,
        frame_point: Point,
        click_offset: [i32; 2],
    ) -> Result<DispatchOutcome, CoreError> {
        let client_rect = locator.client_rect(handle)?;
        let screen = client_rect
            .top_left()
            .offset(frame_point.x, frame_point.y)
            .offset(click_offset[0], click_offset[1]);

        if self.verify_bounds && !client_rect.contains(screen) {
            warn!(
                ?screen,
                ?client_rect,
                "클릭 지점이 클라이언트 영역 밖 — 창 이동 의심"
            );
            return Err(CoreError::OutOfBounds {
                x: screen.x,
                y: screen.y,
            });
        }

        if let Some(last) = self.last_dispatch.get(&handle.raw()) {
            if last.elapsed() < self.cooldown {
                debug!(hwnd = handle.raw(), "쿨다운 중 — 클릭 억제");
                return Ok(DispatchOutcome::Cooling);
            }
        }

        let client_point = Point::new(screen.x - client_rect.x, screen.y - client_rect.y);
        self.driver.click(handle, screen, client_point)?;
        self.last_dispatch.insert(handle.raw(), Instant::now());

        info!(
            hwnd = handle.raw(),
            x = screen.x,
            y = screen.y,
            driver = self.driver.name(),
            "클릭 전송 완료"
        );
        Ok(DispatchOutcome::Clicked(ClickInfo {
            template_id: template_id.clone(),
            screen_point: screen,
            hwnd: handle.raw(),
            timestamp: Utc::now(),
        }))
    }
}

// ============================================================
// NoOpClickDriver — 테스트/디버깅용
// ============================================================

/// No-Op 클릭 드라이버 — 로깅만 하고 전송하지 않음
pub struct NoOpClickDriver;

impl ClickDriver for NoOpClickDriver {
    fn click(
        &mut self,
        handle: WindowHandle,
        screen_point: Point,
        client_point: Point,
    ) -> Result<(), CoreError> {
        debug!(
            hwnd = handle.raw(),
            ?screen_point,
            ?client_point,
            "[NoOp] 좌클릭"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// ============================================================
// MessageClickDriver — 비활성 윈도우 메시지 클릭
// ============================================================

/// PostMessage 기반 비활성 클릭 드라이버.
///
/// 클릭 지점 아래의 가장 깊은 자식 창을 찾아 그 창의 클라이언트 좌표로
/// WM_LBUTTONDOWN/WM_LBUTTONUP을 게시한다. 게시 전에 타임아웃 있는
/// WM_NULL 프로브로 행 걸린 창을 걸러낸다.
#[cfg(windows)]
pub struct MessageClickDriver {
    /// 행 프로브 타임아웃 (밀리초)
    probe_timeout_ms: u32,
}

#[cfg(windows)]
impl MessageClickDriver {
    pub fn new() -> Self {
        Self {
            probe_timeout_ms: 500,
        }
    }

    /// 화면 좌표 아래의 가장 깊은 보이는 자식 창과 그 클라이언트 좌표
    fn deepest_child_at(
        top: WindowHandle,
        screen: Point,
    ) -> (isize, Point) {
        use windows_sys::Win32::Foundation::POINT;
        use windows_sys::Win32::UI::WindowsAndMessaging::{
            ChildWindowFromPointEx, ScreenToClient, CWP_SKIPDISABLED, CWP_SKIPINVISIBLE,
            CWP_SKIPTRANSPARENT,
        };

        let mut hwnd = top.raw();
        loop {
            let mut pt = POINT {
                x: screen.x,
                y: screen.y,
            };
            unsafe {
                if ScreenToClient(hwnd as _, &mut pt) == 0 {
                    break;
                }
                let child = ChildWindowFromPointEx(
                    hwnd as _,
                    pt,
                    CWP_SKIPINVISIBLE | CWP_SKIPDISABLED | CWP_SKIPTRANSPARENT,
                );
                if child.is_null() || child as isize == hwnd {
                    break;
                }
                hwnd = child as isize;
            }
        }

        let mut pt = POINT {
            x: screen.x,
            y: screen.y,
        };
        unsafe {
            ScreenToClient(hwnd as _, &mut pt);
        }
        (hwnd, Point::new(pt.x, pt.y))
    }
}

#[cfg(windows)]
impl Default for MessageClickDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl ClickDriver for MessageClickDriver {
    fn click(
        &mut self,
        handle: WindowHandle,
        screen_point: Point,
        _client_point: Point,
    ) -> Result<(), CoreError> {
        use windows_sys::Win32::UI::WindowsAndMessaging::{
            IsWindow, PostMessageW, SendMessageTimeoutW, SMTO_ABORTIFHUNG, WM_LBUTTONDOWN,
            WM_LBUTTONUP, WM_NULL,
        };

        // 마우스 메시지의 wParam 키 상태 플래그
        const MK_LBUTTON: usize = 0x0001;

        if unsafe { IsWindow(handle.raw() as _) } == 0 {
            return Err(CoreError::WindowGone);
        }

        // 클릭 지점의 가장 깊은 자식 창으로 전송 (최상위 창은 자식에게
        // 마우스 메시지를 전달하지 않는 경우가 많다)
        let (target, client) = Self::deepest_child_at(handle, screen_point);

        // 행 프로브: 응답 없는 창에 게시해도 클릭은 일어나지 않는다
        let mut result: usize = 0;
        let ok = unsafe {
            SendMessageTimeoutW(
                target as _,
                WM_NULL,
                0,
                0,
                SMTO_ABORTIFHUNG,
                self.probe_timeout_ms,
                &mut result,
            )
        };
        if ok == 0 {
            return Err(CoreError::PostFailed(format!(
                "창 응답 없음 ({}ms 타임아웃)",
                self.probe_timeout_ms
            )));
        }

        let lparam = ((client.y as isize & 0xFFFF) << 16) | (client.x as isize & 0xFFFF);
        unsafe {
            if PostMessageW(target as _, WM_LBUTTONDOWN, MK_LBUTTON, lparam) == 0 {
                return Err(CoreError::PostFailed("WM_LBUTTONDOWN 게시 실패".to_string()));
            }
            if PostMessageW(target as _, WM_LBUTTONUP, 0, lparam) == 0 {
                return Err(CoreError::PostFailed("WM_LBUTTONUP 게시 실패".to_string()));
            }
        }
        debug!(
            top = handle.raw(),
            target,
            x = client.x,
            y = client.y,
            "비활성 클릭 메시지 게시"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "message"
    }
}

// ============================================================
// EnigoClickDriver — 실제 입력 합성 (click_method = "simulate")
// ============================================================

/// enigo 기반 입력 합성 드라이버. 커서가 실제로 이동한다.
#[cfg(feature = "enigo")]
pub struct EnigoClickDriver {
    enigo: enigo::Enigo,
}

#[cfg(feature = "enigo")]
impl EnigoClickDriver {
    pub fn new() -> Result<Self, CoreError> {
        let enigo = enigo::Enigo::new(&enigo::Settings::default())
            .map_err(|e| CoreError::Internal(format!("입력 드라이버 초기화 실패: {e}")))?;
        Ok(Self { enigo })
    }
}

#[cfg(feature = "enigo")]
impl ClickDriver for EnigoClickDriver {
    fn click(
        &mut self,
        _handle: WindowHandle,
        screen_point: Point,
        _client_point: Point,
    ) -> Result<(), CoreError> {
        use enigo::Mouse;
        self.enigo
            .move_mouse(screen_point.x, screen_point.y, enigo::Coordinate::Abs)
            .map_err(|e| CoreError::PostFailed(format!("마우스 이동 실패: {e}")))?;
        self.enigo
            .button(enigo::Button::Left, enigo::Direction::Click)
            .map_err(|e| CoreError::PostFailed(format!("마우스 클릭 실패: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulate"
    }
}

// ============================================================
// 드라이버 팩토리
// ============================================================

/// 설정된 클릭 방식에 맞는 드라이버 생성.
///
/// 사용할 수 없는 방식은 경고 후 사용 가능한 쪽으로 폴백한다.
pub fn create_click_driver(method: okshim_core::config::ClickMethod) -> Box<dyn ClickDriver> {
    use okshim_core::config::ClickMethod;

    match method {
        ClickMethod::Simulate => {
            #[cfg(feature = "enigo")]
            {
                match EnigoClickDriver::new() {
                    Ok(driver) => {
                        info!("입력 합성 클릭 드라이버 (enigo) 초기화 완료");
                        return Box::new(driver);
                    }
                    Err(e) => warn!("enigo 초기화 실패, 메시지 방식 폴백: {e}"),
                }
            }
            #[cfg(not(feature = "enigo"))]
            warn!("simulate 방식은 enigo feature 필요 — 메시지 방식 폴백");
            message_or_noop()
        }
        ClickMethod::Message => message_or_noop(),
    }
}

fn message_or_noop() -> Box<dyn ClickDriver> {
    #[cfg(windows)]
    {
        Box::new(MessageClickDriver::new())
    }
    #[cfg(not(windows))]
    {
        Box::new(NoOpClickDriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okshim_core::models::geometry::Rect;
    use okshim_core::models::target::WindowTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// 고정 클라이언트 영역을 돌려주는 탐색기
    struct FixedLocator {
        rect: Rect,
    }

    impl WindowLocator for FixedLocator {
        fn resolve(&self, _t: &WindowTarget) -> Result<WindowHandle, CoreError> {
            Ok(WindowHandle(1))
        }
        fn client_rect(&self, _h: WindowHandle) -> Result<Rect, CoreError> {
            Ok(self.rect)
        }
        fn is_alive(&self, _h: WindowHandle) -> bool {
            true
        }
        fn is_minimized(&self, _h: WindowHandle) -> bool {
            false
        }
        fn foreground_process(&self) -> Option<String> {
            None
        }
        fn process_name(&self, _h: WindowHandle) -> Option<String> {
            None
        }
    }

    /// 전송 횟수와 마지막 좌표를 기록하는 드라이버
    struct RecordingDriver {
        count: Arc<AtomicUsize>,
        last: Arc<std::sync::Mutex<Option<(Point, Point)>>>,
    }

    impl ClickDriver for RecordingDriver {
        fn click(
            &mut self,
            _handle: WindowHandle,
            screen: Point,
            client: Point,
        ) -> Result<(), CoreError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((screen, client));
            Ok(())
        }
        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn recording_dispatcher(
        cooldown: Duration,
        verify: bool,
    ) -> (
        ClickDispatcher,
        Arc<AtomicUsize>,
        Arc<std::sync::Mutex<Option<(Point, Point)>>>,
    ) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(std::sync::Mutex::new(None));
        let dispatcher = ClickDispatcher::new(
            Box::new(RecordingDriver {
                count: count.clone(),
                last: last.clone(),
            }),
            cooldown,
            verify,
        );
        (dispatcher, count, last)
    }

    #[test]
    fn multi_monitor_negative_origin_coordinates() {
        // 가상 원점 (-1920, 0)의 모니터 2 위 창: 클라이언트 좌상단 (-1820, 120)
        let locator = FixedLocator {
            rect: Rect::new(-1820, 120, 800, 600),
        };
        let (mut d, count, last) = recording_dispatcher(Duration::ZERO, true);
        let outcome = d
            .dispatch(
                &locator,
                WindowHandle(7),
                &TemplateId("t".into()),
                Point::new(100, 100),
                [0, 0],
            )
            .unwrap();

        match outcome {
            DispatchOutcome::Clicked(info) => {
                assert_eq!(info.screen_point, Point::new(-1720, 220));
            }
            DispatchOutcome::Cooling => panic!("쿨다운이 아니어야 함"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (screen, client) = last.lock().unwrap().unwrap();
        assert_eq!(screen, Point::new(-1720, 220));
        assert_eq!(client, Point::new(100, 100));
    }

    #[test]
    fn out_of_bounds_is_rejected_before_send() {
        let locator = FixedLocator {
            rect: Rect::new(0, 0, 200, 100),
        };
        let (mut d, count, _) = recording_dispatcher(Duration::ZERO, true);
        let err = d
            .dispatch(
                &locator,
                WindowHandle(7),
                &TemplateId("t".into()),
                Point::new(500, 50),
                [0, 0],
            )
            .unwrap_err();
        assert_eq!(err.kind(), "OutOfBounds");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn verification_can_be_disabled() {
        let locator = FixedLocator {
            rect: Rect::new(0, 0, 200, 100),
        };
        let (mut d, count, _) = recording_dispatcher(Duration::ZERO, false);
        d.dispatch(
            &locator,
            WindowHandle(7),
            &TemplateId("t".into()),
            Point::new(500, 50),
            [0, 0],
        )
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cooldown_suppresses_second_click_per_handle() {
        let locator = FixedLocator {
            rect: Rect::new(0, 0, 800, 600),
        };
        let (mut d, count, _) = recording_dispatcher(Duration::from_secs(5), true);
        let tid = TemplateId("t".into());

        let first = d
            .dispatch(&locator, WindowHandle(7), &tid, Point::new(10, 10), [0, 0])
            .unwrap();
        assert!(matches!(first, DispatchOutcome::Clicked(_)));

        let second = d
            .dispatch(&locator, WindowHandle(7), &tid, Point::new(10, 10), [0, 0])
            .unwrap();
        assert!(matches!(second, DispatchOutcome::Cooling));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 다른 핸들은 독립 쿨다운
        let other = d
            .dispatch(&locator, WindowHandle(8), &tid, Point::new(10, 10), [0, 0])
            .unwrap();
        assert!(matches!(other, DispatchOutcome::Clicked(_)));
    }

    #[test]
    fn click_offset_shifts_target() {
        let locator = FixedLocator {
            rect: Rect::new(100, 200, 800, 600),
        };
        let (mut d, _, last) = recording_dispatcher(Duration::ZERO, true);
        d.dispatch(
            &locator,
            WindowHandle(7),
            &TemplateId("t".into()),
            Point::new(50, 60),
            [5, -10],
        )
        .unwrap();
        let (screen, _) = last.lock().unwrap().unwrap();
        assert_eq!(screen, Point::new(155, 250));
    }
}
