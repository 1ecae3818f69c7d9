//! 프레임 소스 포트.
//!
//! 구현: `okshim-capture` crate (Windows Graphics Capture).
//! 테스트 구현: `okshim-worker/tests`의 스크립트 소스.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CoreError;
use crate::models::frame::Frame;
use crate::models::target::{CaptureOptions, CaptureSource};

/// 캡처 세션 성능 통계
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    /// 발행된 총 프레임 수
    pub frame_count: u64,
    /// 세션 경과 시간 (초)
    pub elapsed_secs: f64,
    /// 실측 fps
    pub actual_fps: f32,
}

/// 프레임 소스 — 캡처 세션의 수명과 최신 프레임 접근을 담당.
///
/// 계약:
/// - `start`는 세션을 열고 첫 프레임 도착을 기다리지 않는다.
/// - `latest_frame`은 논블로킹. 신선한 프레임이 없으면 `Ok(None)`,
///   소스가 일시적으로 캡처 불가(최소화 등)이면 `Err(CaptureUnavailable)`,
///   대상 소멸이면 `Err(CaptureClosed)`.
/// - `stop`은 멱등.
/// - 그래픽 캡처 이외의 경로(bitblt, PrintWindow)로 폴백하지 않는다.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// 캡처 세션 시작
    async fn start(
        &mut self,
        source: CaptureSource,
        opts: CaptureOptions,
    ) -> Result<(), CoreError>;

    /// 최신 발행 프레임 (논블로킹, 최신 우선)
    fn latest_frame(&self) -> Result<Option<Arc<Frame>>, CoreError>;

    /// 세션 정지 (멱등)
    async fn stop(&mut self);

    /// 성능 통계
    fn stats(&self) -> CaptureStats;
}
