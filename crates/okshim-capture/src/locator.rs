//! Windows 창 탐색기.
//!
//! Win32 `EnumWindows` + `GetWindowTextW` + `QueryFullProcessImageNameW` 기반.
//! 창을 활성화하거나 z-순서를 바꾸는 API는 일절 호출하지 않는다.

#![cfg(windows)]

use okshim_core::error::CoreError;
use okshim_core::models::geometry::Rect;
use okshim_core::models::target::{WindowHandle, WindowTarget};
use okshim_core::ports::locator::WindowLocator;
use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{CloseHandle, HWND, LPARAM, POINT, RECT};
use windows_sys::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    ClientToScreen, EnumWindows, GetClientRect, GetForegroundWindow, GetWindowTextLengthW,
    GetWindowTextW, GetWindowThreadProcessId, IsIconic, IsWindow, IsWindowVisible,
};

/// Win32 창 탐색기
pub struct Win32Locator;

/// EnumWindows 수집 상태 (z-순서 위→아래로 호출됨)
struct EnumState<'a> {
    predicate: &'a dyn Fn(HWND) -> bool,
    /// 첫 번째 보이는 비최소화 일치
    best: Option<HWND>,
    /// 비최소화가 없을 때의 첫 번째 보이는 일치
    fallback: Option<HWND>,
}

unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> i32 {
    let state = unsafe { &mut *(lparam as *mut EnumState) };
    if unsafe { IsWindowVisible(hwnd) } == 0 {
        return 1;
    }
    if !(state.predicate)(hwnd) {
        return 1;
    }
    if unsafe { IsIconic(hwnd) } == 0 {
        state.best = Some(hwnd);
        0 // 최상위 비최소화 일치 — 열거 중단
    } else {
        if state.fallback.is_none() {
            state.fallback = Some(hwnd);
        }
        1
    }
}

/// 보이는 최상위 창 중 조건을 만족하는 가장 위의 창을 찾는다
fn find_top_level(predicate: impl Fn(HWND) -> bool) -> Option<HWND> {
    let mut state = EnumState {
        predicate: &predicate,
        best: None,
        fallback: None,
    };
    unsafe {
        EnumWindows(Some(enum_proc), &mut state as *mut _ as LPARAM);
    }
    state.best.or(state.fallback)
}

/// 창 제목 읽기
fn window_title(hwnd: HWND) -> String {
    unsafe {
        let len = GetWindowTextLengthW(hwnd);
        if len <= 0 {
            return String::new();
        }
        let mut buf = vec![0u16; len as usize + 1];
        let copied = GetWindowTextW(hwnd, buf.as_mut_ptr(), buf.len() as i32);
        String::from_utf16_lossy(&buf[..copied.max(0) as usize])
    }
}

/// PID → 프로세스 이미지 전체 경로
fn process_image_path(pid: u32) -> Option<String> {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return None;
        }
        let mut buf = vec![0u16; 1024];
        let mut size = buf.len() as u32;
        let ok = QueryFullProcessImageNameW(handle, 0, buf.as_mut_ptr(), &mut size);
        CloseHandle(handle);
        if ok == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..size as usize]))
    }
}

/// 창 소유 프로세스의 이미지 경로
fn window_process_path(hwnd: HWND) -> Option<String> {
    let mut pid: u32 = 0;
    unsafe {
        GetWindowThreadProcessId(hwnd, &mut pid);
    }
    if pid == 0 {
        return None;
    }
    process_image_path(pid)
}

/// 경로의 기저 이름 (파일명)
fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

impl WindowLocator for Win32Locator {
    fn resolve(&self, target: &WindowTarget) -> Result<WindowHandle, CoreError> {
        match target {
            WindowTarget::Handle(handle) => {
                if unsafe { IsWindow(handle.raw() as HWND) } != 0 {
                    Ok(*handle)
                } else {
                    Err(CoreError::TargetStale)
                }
            }
            WindowTarget::Title { pattern, partial } => {
                let pattern = pattern.clone();
                let partial = *partial;
                let found = find_top_level(move |hwnd| {
                    let title = window_title(hwnd);
                    if partial {
                        title.contains(&pattern)
                    } else {
                        title == pattern
                    }
                });
                found
                    .map(|h| {
                        trace!(hwnd = h as isize, "제목 기반 창 해석 성공");
                        WindowHandle(h as isize)
                    })
                    .ok_or_else(|| {
                        CoreError::TargetNotFound(format!("제목 일치 창 없음: {target:?}"))
                    })
            }
            WindowTarget::Process(name) => {
                let wanted = name.to_ascii_lowercase();
                let found = find_top_level(move |hwnd| {
                    window_process_path(hwnd)
                        .map(|path| {
                            let path_l = path.to_ascii_lowercase();
                            path_l == wanted || basename(&path_l) == wanted
                        })
                        .unwrap_or(false)
                });
                found
                    .map(|h| {
                        debug!(hwnd = h as isize, process = %name, "프로세스 기반 창 해석 성공");
                        WindowHandle(h as isize)
                    })
                    .ok_or_else(|| CoreError::TargetNotFound(format!("프로세스 창 없음: {name}")))
            }
        }
    }

    fn client_rect(&self, handle: WindowHandle) -> Result<Rect, CoreError> {
        let hwnd = handle.raw() as HWND;
        if unsafe { IsWindow(hwnd) } == 0 {
            return Err(CoreError::WindowGone);
        }
        unsafe {
            let mut rect: RECT = std::mem::zeroed();
            if GetClientRect(hwnd, &mut rect) == 0 {
                return Err(CoreError::WindowGone);
            }
            // 클라이언트 원점을 물리 화면 좌표로
            let mut origin = POINT { x: 0, y: 0 };
            if ClientToScreen(hwnd, &mut origin) == 0 {
                return Err(CoreError::WindowGone);
            }
            Ok(Rect::new(
                origin.x,
                origin.y,
                (rect.right - rect.left).max(0) as u32,
                (rect.bottom - rect.top).max(0) as u32,
            ))
        }
    }

    fn is_alive(&self, handle: WindowHandle) -> bool {
        unsafe { IsWindow(handle.raw() as HWND) != 0 }
    }

    fn is_minimized(&self, handle: WindowHandle) -> bool {
        unsafe { IsIconic(handle.raw() as HWND) != 0 }
    }

    fn foreground_process(&self) -> Option<String> {
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd.is_null() {
            return None;
        }
        window_process_path(hwnd).map(|p| basename(&p).to_string())
    }

    fn process_name(&self, handle: WindowHandle) -> Option<String> {
        window_process_path(handle.raw() as HWND).map(|p| basename(&p).to_string())
    }
}
