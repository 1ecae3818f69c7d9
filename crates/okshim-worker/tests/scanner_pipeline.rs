//! 스캐너 파이프라인 통합 테스트.
//!
//! 캡처/탐색/클릭을 페이크 포트로 대체하고 오케스트레이터 상태 기계를
//! 실제로 돌린다: 스트릭 게이트, 쿨다운, Unavailable 처리, 정체 승격.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use okshim_capture::cache::SharedFrameCache;
use okshim_capture::registry::MonitorRegistry;
use okshim_core::config::AppConfig;
use okshim_core::error::CoreError;
use okshim_core::models::event::EventKind;
use okshim_core::models::frame::{Frame, PixelFormat};
use okshim_core::models::geometry::{Monitor, Point, Rect};
use okshim_core::models::scanner::{ScannerState, WorkerCommand};
use okshim_core::models::target::{CaptureOptions, CaptureSource, WindowHandle, WindowTarget};
use okshim_core::ports::capture::{CaptureStats, FrameSource};
use okshim_core::ports::clicker::ClickDriver;
use okshim_core::ports::locator::WindowLocator;
use okshim_core::ports::monitors::MonitorEnumerator;
use okshim_vision::bank::TemplateBank;
use okshim_worker::clicker::ClickDispatcher;
use okshim_worker::scanner::ScannerOrchestrator;
use okshim_worker::status::{self, StatusReceiver};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

// ============================================================
// 합성 프레임/템플릿
// ============================================================

/// 결정적 BGRA 패턴 (x, y에 의존하는 비평탄 텍스처)
fn pattern_bgra(w: u32, h: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((w * h * 4) as usize);
    for y in 0..h {
        for x in 0..w {
            data.push(((x * 7 + y * 3) % 251) as u8);
            data.push(((x * 13 + y * 17) % 241) as u8);
            data.push(((x * 5 + y * 29) % 239) as u8);
            data.push(255);
        }
    }
    data
}

/// 패턴 프레임 생성
fn pattern_frame(w: u32, h: u32) -> Frame {
    Frame::tight(w, h, PixelFormat::Bgra8, pattern_bgra(w, h)).unwrap()
}

/// 패턴의 부분 영역을 템플릿 PNG로 저장 (프레임과 동일 픽셀)
fn save_template(dir: &TempDir, frame_w: u32, x: u32, y: u32, w: u32, h: u32) -> String {
    let frame = pattern_bgra(frame_w, y + h);
    let mut img = image::RgbImage::new(w, h);
    for ty in 0..h {
        for tx in 0..w {
            let i = (((y + ty) * frame_w + x + tx) * 4) as usize;
            // BGRA → RGB
            img.put_pixel(tx, ty, image::Rgb([frame[i + 2], frame[i + 1], frame[i]]));
        }
    }
    let path = dir.path().join("template.png");
    img.save(&path).unwrap();
    path.display().to_string()
}

// ============================================================
// 페이크 포트
// ============================================================

/// 틱마다 대본을 실행하는 프레임 소스
enum Step {
    /// 프레임 발행 후 Ok(Some)
    Publish(Frame),
    /// 신선한 프레임 없음
    Stale,
    /// 일시 캡처 불가
    Unavailable,
}

struct ScriptedSource {
    cache: Arc<SharedFrameCache>,
    script: Mutex<Vec<Step>>,
    /// 대본 소진 후의 기본 동작
    repeat_last_publish: bool,
    last: Mutex<Option<Frame>>,
}

impl ScriptedSource {
    fn new(cache: Arc<SharedFrameCache>, script: Vec<Step>, repeat: bool) -> Self {
        Self {
            cache,
            script: Mutex::new(script),
            repeat_last_publish: repeat,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn start(&mut self, _s: CaptureSource, _o: CaptureOptions) -> Result<(), CoreError> {
        Ok(())
    }

    fn latest_frame(&self) -> Result<Option<Arc<Frame>>, CoreError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        match step {
            Some(Step::Publish(frame)) => {
                *self.last.lock().unwrap() = Some(frame.clone());
                self.cache.publish(frame);
                Ok(self.cache.peek())
            }
            Some(Step::Stale) => Ok(None),
            Some(Step::Unavailable) => {
                Err(CoreError::CaptureUnavailable("대상 창이 최소화 상태".into()))
            }
            None => {
                if self.repeat_last_publish {
                    if let Some(frame) = self.last.lock().unwrap().clone() {
                        self.cache.publish(frame);
                    }
                    Ok(self.cache.peek())
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn stop(&mut self) {}

    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

/// 고정 창 페이크 탐색기
struct FakeLocator {
    rect: Rect,
    foreground: String,
}

impl WindowLocator for FakeLocator {
    fn resolve(&self, _t: &WindowTarget) -> Result<WindowHandle, CoreError> {
        Ok(WindowHandle(42))
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
        Some(self.foreground.clone())
    }
    fn process_name(&self, _h: WindowHandle) -> Option<String> {
        Some(self.foreground.clone())
    }
}

/// 클릭 횟수/좌표 기록 드라이버
struct CountingDriver {
    count: Arc<AtomicUsize>,
    points: Arc<Mutex<Vec<Point>>>,
}

impl ClickDriver for CountingDriver {
    fn click(
        &mut self,
        _h: WindowHandle,
        screen: Point,
        _client: Point,
    ) -> Result<(), CoreError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.points.lock().unwrap().push(screen);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "counting"
    }
}

struct NoMonitors;

impl MonitorEnumerator for NoMonitors {
    fn enumerate(&self) -> Result<Vec<Monitor>, CoreError> {
        Ok(Vec::new())
    }
}

// ============================================================
// 조립 헬퍼
// ============================================================

struct Rig {
    clicks: Arc<AtomicUsize>,
    receiver: StatusReceiver,
    shutdown_tx: watch::Sender<bool>,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// 빠른 틱 주기의 테스트 설정
fn test_config(template: String) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.template_paths = vec![template];
    cfg.target_window_title = "Test IDE".into();
    cfg.threshold = 0.9;
    cfg.active_scan_interval_ms = 25;
    cfg.idle_scan_interval_ms = 50;
    cfg.miss_backoff_ms_max = 100;
    cfg.hit_cooldown_ms = 150;
    cfg.capture_timeout_ms = 5_000;
    cfg
}

fn launch(cfg: AppConfig, cache: Arc<SharedFrameCache>, source: Box<dyn FrameSource>) -> Rig {
    let clicks = Arc::new(AtomicUsize::new(0));
    let points = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = ClickDispatcher::new(
        Box::new(CountingDriver {
            count: clicks.clone(),
            points,
        }),
        cfg.click_cooldown(),
        cfg.verify_window_before_click,
    );
    let mut bank = TemplateBank::new(cfg.effective_scales());
    let failures = bank.load_all(&cfg.templates());
    assert!(failures.is_empty(), "템플릿 로드 실패: {failures:?}");

    let locator = Arc::new(FakeLocator {
        rect: Rect::new(0, 0, 640, 480),
        foreground: "Code.exe".into(),
    });
    let registry = Arc::new(MonitorRegistry::new(Box::new(NoMonitors)).unwrap());
    let (channel, receiver) = status::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel(8);

    let orchestrator = ScannerOrchestrator::new(
        cfg, locator, source, cache, registry, bank, dispatcher, channel, None,
    );
    let task = tokio::spawn(orchestrator.run(shutdown_rx, cmd_rx, true));

    Rig {
        clicks,
        receiver,
        shutdown_tx,
        cmd_tx,
        task,
    }
}

/// 특정 상태가 관찰될 때까지 폴링
async fn wait_for_state(rig: &Rig, want: ScannerState, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if let Some(okshim_core::models::event::StatusEvent::StatusChanged { state, .. }) =
            rig.receiver.latest(EventKind::Status)
        {
            if state == want {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn teardown(rig: Rig) {
    let _ = rig.cmd_tx.send(WorkerCommand::Exit).await;
    let _ = rig.shutdown_tx.send(true);
    let _ = rig.task.await;
}

// ============================================================
// 시나리오
// ============================================================

/// 행복 경로: min_detections=2, 매칭 프레임 연속 공급 →
/// 두 번째 프레임 후 정확히 한 번 클릭, 이후 click 쿨다운으로 억제.
#[tokio::test]
async fn happy_path_clicks_once_after_streak() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 30, 24, 16);

    let mut cfg = test_config(template);
    cfg.min_detections = 2;
    cfg.cooldown_s = 5.0;

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    // 매칭 프레임 무한 공급 (대본 소진 후 마지막 프레임 반복)
    let source = Box::new(ScriptedSource::new(
        cache.clone(),
        vec![Step::Publish(pattern_frame(160, 120))],
        true,
    ));

    let rig = launch(cfg, cache, source);

    assert!(wait_for_state(&rig, ScannerState::Cooldown, 2_000).await);
    // 냉각 종료 후에도 추가 스트릭이 쌓이지만 클릭 쿨다운(5s)이 막는다
    assert!(wait_for_state(&rig, ScannerState::Scanning, 2_000).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(rig.clicks.load(Ordering::SeqCst), 1);
    teardown(rig).await;
}

/// min_detections=1이면 첫 적격 프레임에서 즉시 클릭
#[tokio::test]
async fn single_detection_clicks_immediately() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 30, 24, 16);

    let mut cfg = test_config(template);
    cfg.min_detections = 1;

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let source = Box::new(ScriptedSource::new(
        cache.clone(),
        vec![Step::Publish(pattern_frame(160, 120))],
        true,
    ));

    let rig = launch(cfg, cache, source);
    assert!(wait_for_state(&rig, ScannerState::Cooldown, 2_000).await);
    assert_eq!(rig.clicks.load(Ordering::SeqCst), 1);
    teardown(rig).await;
}

/// 미스 프레임이 끼면 스트릭이 리셋되어 클릭까지 더 오래 걸린다
#[tokio::test]
async fn miss_resets_streak() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 30, 24, 16);

    let mut cfg = test_config(template);
    cfg.min_detections = 3;

    // 비매칭 프레임: 전혀 다른 평탄 패턴
    let blank = Frame::tight(160, 120, PixelFormat::Bgra8, vec![200u8; 160 * 120 * 4]).unwrap();

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let source = Box::new(ScriptedSource::new(
        cache.clone(),
        vec![
            Step::Publish(pattern_frame(160, 120)), // streak 1
            Step::Publish(pattern_frame(160, 120)), // streak 2
            Step::Publish(blank),                   // 리셋
            Step::Publish(pattern_frame(160, 120)), // streak 1
        ],
        false,
    ));

    let rig = launch(cfg, cache, source);
    tokio::time::sleep(Duration::from_millis(800)).await;
    // 3연속이 한 번도 없었으므로 클릭 없음
    assert_eq!(rig.clicks.load(Ordering::SeqCst), 0);
    teardown(rig).await;
}

/// 최소화 대상: Unavailable 프레임 → 매칭/클릭 없음, 에러 이벤트 표면화
#[tokio::test]
async fn unavailable_frames_skip_match_and_surface_status() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 30, 24, 16);
    let cfg = test_config(template);

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let source = Box::new(ScriptedSource::new(
        cache.clone(),
        vec![Step::Unavailable, Step::Unavailable, Step::Unavailable],
        false,
    ));

    let rig = launch(cfg, cache, source);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(rig.clicks.load(Ordering::SeqCst), 0);
    match rig.receiver.latest(EventKind::Error) {
        Some(okshim_core::models::event::StatusEvent::Error { error_kind, .. }) => {
            assert_eq!(error_kind, "CaptureUnavailable");
        }
        other => panic!("CaptureUnavailable 이벤트 기대, 실제: {other:?}"),
    }
    teardown(rig).await;
}

/// 신선한 프레임 없음(stale)은 미스일 뿐 즉시 에러가 아니고,
/// 반복되면 Faulted로 승격된다
#[tokio::test]
async fn persistent_stale_promotes_to_faulted() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 24, 30, 16);
    let cfg = test_config(template);

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let source = Box::new(ScriptedSource::new(cache.clone(), vec![], false)); // 항상 Stale

    let rig = launch(cfg, cache, source);
    assert!(wait_for_state(&rig, ScannerState::Faulted, 3_000).await);
    assert_eq!(rig.clicks.load(Ordering::SeqCst), 0);
    teardown(rig).await;
}

/// 정지 명령은 어떤 상태에서든 Idle로 보낸다
#[tokio::test]
async fn stop_command_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let template = save_template(&dir, 160, 40, 30, 24, 16);
    let cfg = test_config(template);

    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let source = Box::new(ScriptedSource::new(
        cache.clone(),
        vec![Step::Publish(pattern_frame(160, 120))],
        true,
    ));

    let rig = launch(cfg, cache, source);
    assert!(wait_for_state(&rig, ScannerState::Scanning, 2_000).await);
    rig.cmd_tx.send(WorkerCommand::Stop).await.unwrap();
    assert!(wait_for_state(&rig, ScannerState::Idle, 2_000).await);
    teardown(rig).await;
}
