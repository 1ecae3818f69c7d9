//! 모니터 & DPI 레지스트리.
//!
//! 프로세스 시작 시 Per-Monitor V2 DPI 인식을 설정하고, 디스플레이
//! 구성을 스냅샷으로 보관한다. 재열거는 디스플레이 변경 이벤트에서
//! 트리거되며, 기존 스냅샷을 쥔 독자는 다음 틱 경계까지 유효한
//! 변환을 계속 사용한다 (copy-on-reconfigure).

use std::sync::{Arc, RwLock};

use okshim_core::error::CoreError;
use okshim_core::models::geometry::{Monitor, Point};
use okshim_core::ports::monitors::MonitorEnumerator;
use tracing::{debug, info};

/// 모니터 레지스트리
pub struct MonitorRegistry {
    snapshot: RwLock<Arc<Vec<Monitor>>>,
    enumerator: Box<dyn MonitorEnumerator>,
}

impl MonitorRegistry {
    /// 열거자를 주입받아 초기 스냅샷을 구성
    pub fn new(enumerator: Box<dyn MonitorEnumerator>) -> Result<Self, CoreError> {
        let monitors = enumerator.enumerate()?;
        info!(count = monitors.len(), "모니터 레지스트리 초기화");
        Ok(Self {
            snapshot: RwLock::new(Arc::new(monitors)),
            enumerator,
        })
    }

    /// 디스플레이 변경 시 재열거. 기존 스냅샷 Arc는 건드리지 않는다.
    pub fn refresh(&self) -> Result<(), CoreError> {
        let monitors = self.enumerator.enumerate()?;
        debug!(count = monitors.len(), "모니터 재열거");
        *self.snapshot.write().expect("레지스트리 락 오염") = Arc::new(monitors);
        Ok(())
    }

    /// 현재 스냅샷 참조
    pub fn snapshot(&self) -> Arc<Vec<Monitor>> {
        self.snapshot.read().expect("레지스트리 락 오염").clone()
    }

    /// 전체 모니터 목록 (복사본)
    pub fn list_monitors(&self) -> Vec<Monitor> {
        self.snapshot().as_ref().clone()
    }

    /// 물리 좌표가 속한 모니터
    pub fn monitor_for_point(&self, p: Point) -> Option<Monitor> {
        self.snapshot().iter().find(|m| m.bounds.contains(p)).copied()
    }

    /// 1-기반 인덱스로 조회
    pub fn by_index(&self, index: u32) -> Option<Monitor> {
        self.snapshot().iter().find(|m| m.index == index).copied()
    }

    /// 주 모니터
    pub fn primary(&self) -> Option<Monitor> {
        self.snapshot().iter().find(|m| m.is_primary).copied()
    }

    /// 창이 걸친 모니터 (Windows 전용 — MonitorFromWindow)
    #[cfg(windows)]
    pub fn monitor_for_window(
        &self,
        handle: okshim_core::models::target::WindowHandle,
    ) -> Option<Monitor> {
        use windows_sys::Win32::Graphics::Gdi::{MonitorFromWindow, MONITOR_DEFAULTTONEAREST};
        let hmon = unsafe { MonitorFromWindow(handle.raw() as _, MONITOR_DEFAULTTONEAREST) };
        self.snapshot()
            .iter()
            .find(|m| m.handle == hmon as isize)
            .copied()
    }
}

/// 프로세스를 Per-Monitor V2 DPI 인식으로 설정.
///
/// 창 생성/좌표 API 호출 전, 프로세스당 한 번 호출해야 한다.
#[cfg(windows)]
pub fn init_dpi_awareness() {
    use windows_sys::Win32::UI::HiDpi::{
        SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
    };
    let ok = unsafe { SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) };
    if ok == 0 {
        // 이미 설정돼 있거나 매니페스트가 선점한 경우 — 치명적이지 않음
        debug!("Per-Monitor V2 DPI 설정 생략 (이미 설정됨)");
    } else {
        info!("Per-Monitor V2 DPI 인식 설정 완료");
    }
}

#[cfg(not(windows))]
pub fn init_dpi_awareness() {}

// ============================================================
// Windows 열거자
// ============================================================

/// EnumDisplayMonitors 기반 열거자
#[cfg(windows)]
pub struct WinMonitorEnumerator;

#[cfg(windows)]
impl MonitorEnumerator for WinMonitorEnumerator {
    fn enumerate(&self) -> Result<Vec<Monitor>, CoreError> {
        use okshim_core::models::geometry::Rect;
        use windows_sys::Win32::Foundation::{LPARAM, RECT};
        use windows_sys::Win32::Graphics::Gdi::{
            EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO,
            MONITORINFOF_PRIMARY,
        };
        use windows_sys::Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI};

        unsafe extern "system" fn collect(
            hmon: HMONITOR,
            _hdc: HDC,
            _rect: *mut RECT,
            lparam: LPARAM,
        ) -> i32 {
            let out = unsafe { &mut *(lparam as *mut Vec<HMONITOR>) };
            out.push(hmon);
            1
        }

        let mut handles: Vec<windows_sys::Win32::Graphics::Gdi::HMONITOR> = Vec::new();
        let ok = unsafe {
            EnumDisplayMonitors(
                std::ptr::null_mut(),
                std::ptr::null(),
                Some(collect),
                &mut handles as *mut _ as LPARAM,
            )
        };
        if ok == 0 || handles.is_empty() {
            return Err(CoreError::Internal("모니터 열거 실패".to_string()));
        }

        let mut monitors = Vec::with_capacity(handles.len());
        for (i, hmon) in handles.into_iter().enumerate() {
            let mut info: MONITORINFO = unsafe { std::mem::zeroed() };
            info.cbSize = std::mem::size_of::<MONITORINFO>() as u32;
            if unsafe { GetMonitorInfoW(hmon, &mut info) } == 0 {
                continue;
            }
            let r = info.rcMonitor;

            // Per-Monitor V2에서 모니터별 유효 DPI
            let mut dpi_x = 96u32;
            let mut dpi_y = 96u32;
            let hr = unsafe { GetDpiForMonitor(hmon, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) };
            let scale = if hr == 0 { dpi_x as f64 / 96.0 } else { 1.0 };

            monitors.push(Monitor {
                index: (i + 1) as u32,
                handle: hmon as isize,
                bounds: Rect::new(
                    r.left,
                    r.top,
                    (r.right - r.left) as u32,
                    (r.bottom - r.top) as u32,
                ),
                scale_factor: scale,
                is_primary: info.dwFlags & MONITORINFOF_PRIMARY != 0,
            });
        }
        Ok(monitors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okshim_core::models::geometry::Rect;

    struct FixedEnumerator(Vec<Monitor>);

    impl MonitorEnumerator for FixedEnumerator {
        fn enumerate(&self) -> Result<Vec<Monitor>, CoreError> {
            Ok(self.0.clone())
        }
    }

    fn dual_setup() -> MonitorRegistry {
        MonitorRegistry::new(Box::new(FixedEnumerator(vec![
            Monitor {
                index: 1,
                handle: 100,
                bounds: Rect::new(0, 0, 2560, 1440),
                scale_factor: 1.0,
                is_primary: true,
            },
            Monitor {
                index: 2,
                handle: 200,
                bounds: Rect::new(-1920, 0, 1920, 1080),
                scale_factor: 1.5,
                is_primary: false,
            },
        ])))
        .unwrap()
    }

    #[test]
    fn point_lookup_across_virtual_screen() {
        let reg = dual_setup();
        assert_eq!(reg.monitor_for_point(Point::new(100, 100)).unwrap().index, 1);
        // 음수 가상 스크린 좌표 → 왼쪽 보조 모니터
        assert_eq!(
            reg.monitor_for_point(Point::new(-1820, 120)).unwrap().index,
            2
        );
        assert!(reg.monitor_for_point(Point::new(-5000, 0)).is_none());
    }

    #[test]
    fn snapshot_survives_refresh() {
        let reg = dual_setup();
        let snap = reg.snapshot();
        reg.refresh().unwrap();
        // 기존 스냅샷은 재열거 후에도 유효
        assert_eq!(snap.len(), 2);
        assert_eq!(reg.snapshot().len(), 2);
    }

    #[test]
    fn index_and_primary_lookup() {
        let reg = dual_setup();
        assert_eq!(reg.by_index(2).unwrap().handle, 200);
        assert!(reg.by_index(3).is_none());
        assert!(reg.primary().unwrap().is_primary);
    }
}
