//! Windows Graphics Capture 백엔드.
//!
//! 창/모니터 소스의 캡처 아이템을 열고, free-threaded 프레임 풀의
//! 도착 콜백에서 BGRA 리드백 후 공유 캐시에 발행한다.
//!
//! 규칙:
//! - content_size로 클리핑해 미정의 영역을 발행하지 않는다.
//! - content_size가 새 값으로 2프레임 안정되면 풀을 재구축한다.
//! - bitblt/PrintWindow 폴백은 금지. 시작 실패는 즉시 에러다.
//! - 최소화 창은 세션당 1회 비활성 복원만 시도한다.

#![cfg(windows)]

mod d3d11;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use okshim_core::error::CoreError;
use okshim_core::models::frame::{Frame, PixelFormat};
use okshim_core::models::target::{CaptureOptions, CaptureSource, WindowHandle};
use okshim_core::ports::capture::{CaptureStats, FrameSource};
use tracing::{debug, error, info, warn};
use windows::core::Interface;
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{
    Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
};
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows_sys::Win32::UI::WindowsAndMessaging::{IsIconic, ShowWindow, SW_SHOWNOACTIVATE};

use crate::cache::SharedFrameCache;
use crate::pacing::{ContentSizeTracker, FpsGate};
use crate::registry::WinMonitorEnumerator;
use okshim_core::ports::monitors::MonitorEnumerator;

/// 프레임 풀 버퍼 개수 — 대기 서피스는 항상 1개 이하 (최신 우선)
const POOL_BUFFERS: i32 = 2;

/// 콜백과 본체가 공유하는 세션 상태
struct SessionShared {
    closed: AtomicBool,
    frame_count: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

/// 콜백 스레드 전용 가변 상태
struct CallbackState {
    gate: FpsGate,
    tracker: ContentSizeTracker,
}

/// 활성 캡처 세션 리소스
struct ActiveSession {
    session: GraphicsCaptureSession,
    frame_pool: Direct3D11CaptureFramePool,
    item: GraphicsCaptureItem,
    frame_token: i64,
    closed_token: i64,
    target_hwnd: Option<WindowHandle>,
    /// 비활성 복원을 이미 시도했는지 (세션당 1회)
    restore_attempted: bool,
}

/// Windows Graphics Capture 프레임 소스
pub struct WgcFrameSource {
    cache: Arc<SharedFrameCache>,
    shared: Arc<SessionShared>,
    active: Option<ActiveSession>,
    opts: CaptureOptions,
}

impl WgcFrameSource {
    pub fn new(cache: Arc<SharedFrameCache>) -> Self {
        Self {
            cache,
            shared: Arc::new(SessionShared {
                closed: AtomicBool::new(false),
                frame_count: AtomicU64::new(0),
                started_at: Mutex::new(None),
            }),
            active: None,
            opts: CaptureOptions::default(),
        }
    }

    /// 소스 종별에 맞는 캡처 아이템 생성
    fn create_item(source: CaptureSource) -> Result<GraphicsCaptureItem, CoreError> {
        let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
            .map_err(|e| CoreError::CaptureUnsupported(format!("캡처 interop 미지원: {e}")))?;
        match source {
            CaptureSource::Window(handle) => unsafe {
                interop
                    .CreateForWindow(windows::Win32::Foundation::HWND(handle.raw() as _))
                    .map_err(|e| CoreError::CaptureClosed(format!("창 캡처 아이템 생성 실패: {e}")))
            },
            CaptureSource::Monitor(index) => {
                let monitor = WinMonitorEnumerator
                    .enumerate()?
                    .into_iter()
                    .find(|m| m.index == index)
                    .ok_or_else(|| {
                        CoreError::CaptureUnavailable(format!("모니터 인덱스 {index} 없음"))
                    })?;
                unsafe {
                    interop
                        .CreateForMonitor(windows::Win32::Graphics::Gdi::HMONITOR(
                            monitor.handle as _,
                        ))
                        .map_err(|e| {
                            CoreError::CaptureUnavailable(format!("모니터 캡처 아이템 생성 실패: {e}"))
                        })
                }
            }
        }
    }

    /// 최소화 창의 비활성 복원 (세션당 1회)
    async fn restore_minimized_once(&mut self, handle: WindowHandle) {
        if unsafe { IsIconic(handle.raw() as _) } == 0 {
            return;
        }
        info!(hwnd = handle.raw(), "최소화 창 비활성 복원 시도");
        unsafe {
            ShowWindow(handle.raw() as _, SW_SHOWNOACTIVATE);
        }
        // DWM 컴포지터의 가시성 갱신 대기
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[async_trait]
impl FrameSource for WgcFrameSource {
    async fn start(
        &mut self,
        source: CaptureSource,
        opts: CaptureOptions,
    ) -> Result<(), CoreError> {
        self.stop().await;
        self.opts = opts;
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.frame_count.store(0, Ordering::SeqCst);

        if !GraphicsCaptureSession::IsSupported()
            .map_err(|e| CoreError::CaptureUnsupported(format!("지원 여부 조회 실패: {e}")))?
        {
            return Err(CoreError::CaptureUnsupported(
                "이 OS는 그래픽 캡처를 지원하지 않음 (Windows 10 1903+)".to_string(),
            ));
        }

        let target_hwnd = match source {
            CaptureSource::Window(h) => Some(h),
            CaptureSource::Monitor(_) => None,
        };
        let mut restore_attempted = false;
        if let Some(h) = target_hwnd {
            if opts.restore_minimized_noactivate {
                self.restore_minimized_once(h).await;
                restore_attempted = true;
            }
        }

        let item = Self::create_item(source)?;
        let size = item
            .Size()
            .map_err(|e| CoreError::CaptureUnavailable(format!("아이템 크기 조회 실패: {e}")))?;

        let d3d = d3d11::create_device()?;
        let frame_pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            &d3d.winrt_device,
            DirectXPixelFormat::B8G8R8A8UIntNormalized,
            POOL_BUFFERS,
            size,
        )
        .map_err(|e| CoreError::CaptureUnavailable(format!("프레임 풀 생성 실패: {e}")))?;

        // ── 프레임 도착 콜백 (WGC 런타임 스레드) ──
        let cache = self.cache.clone();
        let shared = self.shared.clone();
        let cb_state = Mutex::new(CallbackState {
            gate: FpsGate::new(opts.fps_max),
            tracker: ContentSizeTracker::new((size.Width.max(0) as u32, size.Height.max(0) as u32)),
        });
        let winrt_device = d3d.winrt_device.clone();
        let device = d3d.device.clone();
        let context = d3d.context.clone();

        let frame_token = frame_pool
            .FrameArrived(&TypedEventHandler::<
                Direct3D11CaptureFramePool,
                windows::core::IInspectable,
            >::new(move |pool, _| {
                let Some(pool) = pool.as_ref() else {
                    return Ok(());
                };
                // 대기 서피스를 모두 비워 최신 프레임만 남긴다
                let mut latest = None;
                while let Ok(f) = pool.TryGetNextFrame() {
                    latest = Some(f);
                }
                let Some(capture_frame) = latest else {
                    return Ok(());
                };

                let mut st = cb_state.lock().expect("콜백 상태 락 오염");
                if !st.gate.admit(Instant::now()) {
                    return Ok(());
                }

                let content = capture_frame.ContentSize()?;
                let content = (content.Width.max(0) as u32, content.Height.max(0) as u32);
                let pool_size = st.tracker.pool_size();
                let clip_w = content.0.min(pool_size.0);
                let clip_h = content.1.min(pool_size.1);

                let surface = capture_frame.Surface()?;
                match d3d11::texture_from_surface(&surface)
                    .and_then(|tex| d3d11::readback_bgra(&device, &context, &tex, clip_w, clip_h))
                    .and_then(|data| Frame::tight(clip_w, clip_h, PixelFormat::Bgra8, data))
                {
                    Ok(mut frame) => {
                        frame.content_size = content;
                        cache.publish(frame);
                        shared.frame_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("프레임 리드백 실패: {e}");
                        return Ok(());
                    }
                }

                // 발행 후 재구축 — 독자는 재구축 전/후 프레임만 본다
                if let Some((w, h)) = st.tracker.observe(content) {
                    info!(w, h, "content_size 안정화, 프레임 풀 재구축");
                    if let Err(e) = pool.Recreate(
                        &winrt_device,
                        DirectXPixelFormat::B8G8R8A8UIntNormalized,
                        POOL_BUFFERS,
                        SizeInt32 {
                            Width: w as i32,
                            Height: h as i32,
                        },
                    ) {
                        error!("프레임 풀 재구축 실패: {e}");
                    }
                }
                Ok(())
            }))
            .map_err(|e| CoreError::CaptureUnavailable(format!("콜백 등록 실패: {e}")))?;

        // ── 아이템 소실 콜백 (대상 창 파괴) ──
        let shared_closed = self.shared.clone();
        let closed_token = item
            .Closed(&TypedEventHandler::<
                GraphicsCaptureItem,
                windows::core::IInspectable,
            >::new(move |_, _| {
                shared_closed.closed.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .map_err(|e| CoreError::CaptureUnavailable(format!("소실 콜백 등록 실패: {e}")))?;

        let session = frame_pool
            .CreateCaptureSession(&item)
            .map_err(|e| CoreError::CaptureUnavailable(format!("캡처 세션 생성 실패: {e}")))?;
        if let Err(e) = session.SetIsCursorCaptureEnabled(opts.include_cursor) {
            debug!("커서 캡처 설정 실패 (무시): {e}");
        }
        if let Err(e) = session.SetIsBorderRequired(opts.border_required) {
            // 1903에서는 미지원 — 장식이 남을 뿐 캡처는 정상
            debug!("테두리 설정 실패 (무시): {e}");
        }
        session
            .StartCapture()
            .map_err(|e| CoreError::CaptureUnavailable(format!("캡처 시작 실패: {e}")))?;

        *self.shared.started_at.lock().expect("통계 락 오염") = Some(Instant::now());
        self.active = Some(ActiveSession {
            session,
            frame_pool,
            item,
            frame_token,
            closed_token,
            target_hwnd,
            restore_attempted,
        });
        info!(
            ?source,
            fps_max = opts.fps_max,
            cursor = opts.include_cursor,
            "그래픽 캡처 세션 시작"
        );
        Ok(())
    }

    fn latest_frame(&self) -> Result<Option<Arc<Frame>>, CoreError> {
        let active = match self.active {
            Some(ref a) => a,
            None => return Ok(None),
        };
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(CoreError::CaptureClosed("캡처 아이템 소실".to_string()));
        }
        // 복원 시도 후에도 최소화 상태면 프레임이 갱신되지 않는다 — 검은
        // 프레임 대신 Unavailable로 보고한다
        if let Some(h) = active.target_hwnd {
            if active.restore_attempted && unsafe { IsIconic(h.raw() as _) } != 0 {
                return Err(CoreError::CaptureUnavailable(
                    "대상 창이 최소화 상태".to_string(),
                ));
            }
        }
        match self.cache.peek() {
            Some(frame) if !frame.is_stale(self.opts.timeout_ms) => Ok(Some(frame)),
            _ => Ok(None),
        }
    }

    async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.frame_pool.RemoveFrameArrived(active.frame_token);
            let _ = active.item.RemoveClosed(active.closed_token);
            if let Err(e) = active.session.Close() {
                debug!("세션 종료 실패 (무시): {e}");
            }
            if let Err(e) = active.frame_pool.Close() {
                debug!("프레임 풀 종료 실패 (무시): {e}");
            }
            let stats = self.stats();
            info!(
                frames = stats.frame_count,
                fps = stats.actual_fps,
                "그래픽 캡처 세션 정지"
            );
        }
    }

    fn stats(&self) -> CaptureStats {
        let frame_count = self.shared.frame_count.load(Ordering::Relaxed);
        let elapsed = self
            .shared
            .started_at
            .lock()
            .expect("통계 락 오염")
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        CaptureStats {
            frame_count,
            elapsed_secs: elapsed,
            actual_fps: if elapsed > 0.0 {
                (frame_count as f64 / elapsed) as f32
            } else {
                0.0
            },
        }
    }
}

impl Drop for WgcFrameSource {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.frame_pool.RemoveFrameArrived(active.frame_token);
            let _ = active.item.RemoveClosed(active.closed_token);
            let _ = active.session.Close();
            let _ = active.frame_pool.Close();
        }
    }
}
