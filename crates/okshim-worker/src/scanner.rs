//! 스캐너 오케스트레이터.
//!
//! 캡처(C3) → 캐시(C4) → 매칭(C6) → 클릭(C8)을 묶는 상태 기계.
//!
//! ```text
//! Idle ─start→ Arming ─source-ready→ Scanning
//! Scanning ─miss→ Scanning (스케줄러 재조정)
//! Scanning ─hit (streak≥min)→ Cooldown ─timer→ Scanning
//! Scanning ─capture-error→ Faulted ─backoff→ Arming
//! any ─stop→ Idle,  any ─pause→ Paused ─resume→ Scanning
//! ```
//!
//! 백오프는 여기 한 곳에만 있다. 캡처/클릭 계층은 장애를 보고만 하고
//! 스스로 재시도하지 않는다. 복구 가능한 장애는 StatusChanged 이벤트
//! 외부로 전파되지 않는다.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use okshim_capture::cache::SharedFrameCache;
use okshim_capture::registry::MonitorRegistry;
use okshim_core::config::{AppConfig, CaptureBackend};
use okshim_core::config_manager::ConfigManager;
use okshim_core::error::CoreError;
use okshim_core::models::event::StatusEvent;
use okshim_core::models::frame::Frame;
use okshim_core::models::geometry::Point;
use okshim_core::models::matching::{MatchResult, TemplateId};
use okshim_core::models::scanner::{ScannerState, WorkerCommand};
use okshim_core::models::target::{CaptureSource, WindowHandle, WindowTarget};
use okshim_core::ports::capture::FrameSource;
use okshim_core::ports::locator::WindowLocator;
use okshim_vision::bank::TemplateBank;
use okshim_vision::matcher::{find_first_match, MatchParams};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::clicker::{ClickDispatcher, DispatchOutcome};
use crate::perf::PerfSampler;
use crate::scheduler::{AdaptiveScheduler, SchedulerParams};
use crate::status::StatusChannel;

/// 캐시 소비자 태그
const SCANNER_TAG: &str = "scanner";

/// 연속 stale 틱이 이 수를 넘으면 장애로 승격
const STALE_STRIKES_LIMIT: u32 = 5;

/// PerfTick 발행 주기
const PERF_INTERVAL: Duration = Duration::from_secs(5);

/// 장애 집계 윈도우와 한도 (윈도우 내 한도 초과 → sticky)
const FAULT_WINDOW: Duration = Duration::from_secs(60);
const FAULT_BUDGET: usize = 5;

/// 슬립 중 깨어나는 사유
enum Wake {
    Timer,
    Command(WorkerCommand),
    Shutdown,
}

/// 백오프 단일 권위 — 1→2→4→8s (상한 8s), 60초에 5회 이상이면 sticky
struct FaultTracker {
    backoff: Duration,
    recent: VecDeque<Instant>,
    sticky: bool,
}

impl FaultTracker {
    fn new() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            recent: VecDeque::new(),
            sticky: false,
        }
    }

    /// 장애 기록. 반환값은 이번에 대기할 백오프.
    fn record(&mut self) -> Duration {
        let now = Instant::now();
        self.recent.push_back(now);
        while let Some(&front) = self.recent.front() {
            if now.duration_since(front) > FAULT_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= FAULT_BUDGET {
            self.sticky = true;
        }
        let current = self.backoff;
        self.backoff = (self.backoff * 2).min(Duration::from_secs(8));
        current
    }

    /// 정상 복구 시 백오프 리셋
    fn reset(&mut self) {
        self.backoff = Duration::from_secs(1);
    }

    /// 사용자 조작으로 sticky 해제
    fn clear(&mut self) {
        self.recent.clear();
        self.sticky = false;
        self.reset();
    }
}

/// 스캐너 오케스트레이터
pub struct ScannerOrchestrator {
    cfg: AppConfig,
    locator: Arc<dyn WindowLocator>,
    source: Box<dyn FrameSource>,
    cache: Arc<SharedFrameCache>,
    registry: Arc<MonitorRegistry>,
    bank: TemplateBank,
    dispatcher: ClickDispatcher,
    channel: StatusChannel,
    config_manager: Option<ConfigManager>,

    scheduler: AdaptiveScheduler,
    state: ScannerState,
    /// 해석된 대상 창 (모니터 모드에서는 클릭 대상으로만 사용)
    target: Option<WindowHandle>,
    target_spec: Option<WindowTarget>,
    /// 캡처 프레임 (0,0)의 물리 화면 좌표 (창 모드에서는 클라이언트 원점과 동일)
    frame_origin: Point,
    /// 템플릿별 연속 명중 수
    streaks: HashMap<TemplateId, u32>,
    faults: FaultTracker,
    stale_strikes: u32,
    perf: PerfSampler,
    last_perf: Instant,
}

impl ScannerOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        locator: Arc<dyn WindowLocator>,
        source: Box<dyn FrameSource>,
        cache: Arc<SharedFrameCache>,
        registry: Arc<MonitorRegistry>,
        bank: TemplateBank,
        dispatcher: ClickDispatcher,
        channel: StatusChannel,
        config_manager: Option<ConfigManager>,
    ) -> Self {
        let scheduler = AdaptiveScheduler::new(SchedulerParams::from_config(&cfg));
        let target_spec = cfg.window_target();
        Self {
            cfg,
            locator,
            source,
            cache,
            registry,
            bank,
            dispatcher,
            channel,
            config_manager,
            scheduler,
            state: ScannerState::Idle,
            target: None,
            target_spec,
            frame_origin: Point::new(0, 0),
            streaks: HashMap::new(),
            faults: FaultTracker::new(),
            stale_strikes: 0,
            perf: PerfSampler::new(),
            last_perf: Instant::now(),
        }
    }

    /// 메인 루프. 종료 신호 또는 Exit 명령까지 실행된다.
    pub async fn run(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut cmd_rx: mpsc::Receiver<WorkerCommand>,
        auto_start: bool,
    ) {
        info!("스캐너 오케스트레이터 시작");
        self.set_state(ScannerState::Idle, "대기");
        if auto_start {
            self.begin_arming();
        }

        loop {
            match self.state {
                ScannerState::Idle | ScannerState::Paused => {
                    // 명령 대기 (타이머 없음)
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { break };
                            if self.handle_command(cmd).await { break; }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                ScannerState::Arming => {
                    match self.arm().await {
                        Ok(()) => {
                            self.faults.reset();
                            self.stale_strikes = 0;
                            self.set_state(ScannerState::Scanning, "캡처 준비 완료");
                        }
                        Err(e) if !e.is_recoverable() => {
                            error!("치명적 캡처 오류: {e}");
                            self.channel.emit(StatusEvent::error(&e));
                            self.faults.sticky = true;
                            self.set_state(ScannerState::Faulted, "사용자 조치 필요");
                        }
                        Err(e @ (CoreError::TargetNotFound(_) | CoreError::TargetStale)) => {
                            // 다음 틱 재시도 — 장애로 집계하지 않는다
                            debug!("대상 미해석: {e}");
                            self.channel.emit(StatusEvent::error(&e));
                            // 기준 스캔 주기로 재시도
                            let delay = Duration::from_millis(self.cfg.interval_ms.max(1));
                            match sleep_or_command(delay, &mut cmd_rx, &mut shutdown_rx).await {
                                Wake::Timer => {}
                                Wake::Command(cmd) => {
                                    if self.handle_command(cmd).await { break; }
                                }
                                Wake::Shutdown => break,
                            }
                        }
                        Err(e) => {
                            warn!("캡처 준비 실패: {e}");
                            self.channel.emit(StatusEvent::error(&e));
                            let backoff = self.faults.record();
                            self.set_state(ScannerState::Faulted, "백오프 대기");
                            if !self.faults.sticky {
                                match sleep_or_command(backoff, &mut cmd_rx, &mut shutdown_rx).await
                                {
                                    Wake::Timer => self.begin_arming(),
                                    Wake::Command(cmd) => {
                                        if self.handle_command(cmd).await { break; }
                                    }
                                    Wake::Shutdown => break,
                                }
                            }
                        }
                    }
                }
                ScannerState::Faulted => {
                    if self.faults.sticky {
                        // 사용자 조치까지 대기
                        tokio::select! {
                            cmd = cmd_rx.recv() => {
                                let Some(cmd) = cmd else { break };
                                if self.handle_command(cmd).await { break; }
                            }
                            _ = shutdown_rx.changed() => break,
                        }
                    } else {
                        self.begin_arming();
                    }
                }
                ScannerState::Scanning => {
                    let delay = Duration::from_millis(self.scheduler.next_delay_ms());
                    match sleep_or_command(delay, &mut cmd_rx, &mut shutdown_rx).await {
                        Wake::Timer => self.tick().await,
                        Wake::Command(cmd) => {
                            if self.handle_command(cmd).await { break; }
                        }
                        Wake::Shutdown => break,
                    }
                }
                ScannerState::Cooldown => {
                    let delay = Duration::from_millis(self.cfg.hit_cooldown_ms);
                    match sleep_or_command(delay, &mut cmd_rx, &mut shutdown_rx).await {
                        Wake::Timer => self.set_state(ScannerState::Scanning, "냉각 종료"),
                        Wake::Command(cmd) => {
                            if self.handle_command(cmd).await { break; }
                        }
                        Wake::Shutdown => break,
                    }
                }
            }
        }

        self.source.stop().await;
        self.set_state(ScannerState::Idle, "종료");
        info!("스캐너 오케스트레이터 종료");
    }

    /// 명령 처리. Exit이면 true.
    async fn handle_command(&mut self, cmd: WorkerCommand) -> bool {
        debug!(?cmd, state = %self.state, "워커 명령");
        match cmd {
            WorkerCommand::Start => {
                self.faults.clear();
                self.begin_arming();
            }
            WorkerCommand::Stop => {
                self.source.stop().await;
                self.faults.clear();
                self.streaks.clear();
                self.set_state(ScannerState::Idle, "정지");
            }
            WorkerCommand::Pause => {
                if matches!(
                    self.state,
                    ScannerState::Scanning | ScannerState::Cooldown | ScannerState::Arming
                ) {
                    self.set_state(ScannerState::Paused, "일시정지");
                }
            }
            WorkerCommand::Resume => {
                if self.state == ScannerState::Paused {
                    self.begin_arming();
                }
            }
            WorkerCommand::Reload => {
                if let Err(e) = self.reload_config().await {
                    warn!("설정 리로드 실패: {e}");
                    self.channel.emit(StatusEvent::error(&e));
                }
            }
            WorkerCommand::Exit => return true,
        }
        false
    }

    fn begin_arming(&mut self) {
        self.set_state(ScannerState::Arming, "캡처 준비");
    }

    /// 설정 파일을 다시 읽고 구성 요소를 재구축
    async fn reload_config(&mut self) -> Result<(), CoreError> {
        let Some(ref manager) = self.config_manager else {
            return Err(CoreError::Config("설정 관리자 없음".to_string()));
        };
        manager.reload()?;
        let cfg = manager.get();
        cfg.validate()?;

        let mut bank = TemplateBank::new(cfg.effective_scales());
        for (path, e) in bank.load_all(&cfg.templates()) {
            self.channel.emit(StatusEvent::error(&e));
            warn!(path = %path, "템플릿 제외");
        }
        if bank.is_empty() {
            return Err(CoreError::Config("유효한 템플릿이 없음".to_string()));
        }

        self.scheduler = AdaptiveScheduler::new(SchedulerParams::from_config(&cfg));
        self.dispatcher.set_cooldown(cfg.click_cooldown());
        self.target_spec = cfg.window_target();
        self.bank = bank;
        self.cfg = cfg;
        self.streaks.clear();
        info!("설정 리로드 적용 완료 — 재준비");
        self.source.stop().await;
        self.begin_arming();
        Ok(())
    }

    /// 캡처 세션 준비 (대상 해석 + 소스 시작)
    async fn arm(&mut self) -> Result<(), CoreError> {
        match self.cfg.capture_backend {
            CaptureBackend::Window => {
                let spec = self
                    .target_spec
                    .clone()
                    .ok_or_else(|| CoreError::Config("캡처 대상이 지정되지 않음".to_string()))?;
                let handle = self.locator.resolve(&spec)?;
                self.target = Some(handle);
                // 창 캡처 프레임은 클라이언트 좌표계
                self.frame_origin = Point::new(0, 0);
                self.source
                    .start(CaptureSource::Window(handle), self.cfg.capture_options())
                    .await?;
            }
            CaptureBackend::Monitor => {
                let monitor = self.registry.by_index(self.cfg.monitor_index).ok_or_else(|| {
                    CoreError::CaptureUnavailable(format!(
                        "모니터 인덱스 {} 없음",
                        self.cfg.monitor_index
                    ))
                })?;
                self.frame_origin = monitor.bounds.top_left();
                // 모니터 모드에서도 클릭 대상 창은 설정 기준으로 해석
                self.target = match self.target_spec {
                    Some(ref spec) => self.locator.resolve(spec).ok(),
                    None => None,
                };
                self.source
                    .start(
                        CaptureSource::Monitor(self.cfg.monitor_index),
                        self.cfg.capture_options(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Scanning 상태의 한 틱
    async fn tick(&mut self) {
        // 전경 상태 갱신
        self.scheduler
            .on_foreground_change(self.locator.foreground_process().as_deref());

        // 대상 핸들 갱신 (죽었거나 주기 갱신 설정 시)
        if self.refresh_target().await {
            return; // 상태 전이 발생
        }

        // 소스 상태 점검
        match self.source.latest_frame() {
            Ok(Some(_)) => {
                self.stale_strikes = 0;
            }
            Ok(None) => {
                // 신선한 프레임 없음 — 미스. 반복되면 장애로 승격.
                self.stale_strikes += 1;
                self.scheduler.on_miss();
                self.streaks.clear();
                if self.stale_strikes >= STALE_STRIKES_LIMIT {
                    let e = CoreError::FrameStale {
                        timeout_ms: self.cfg.capture_timeout_ms,
                    };
                    warn!("프레임 정체 반복 — 장애 처리: {e}");
                    self.channel.emit(StatusEvent::error(&e));
                    self.enter_fault().await;
                }
                self.emit_perf_if_due();
                return;
            }
            Err(e @ CoreError::CaptureUnavailable(_)) => {
                // 최소화 등 일시 불가 — 매칭 생략, 다음 틱 재시도
                self.channel.emit(StatusEvent::error(&e));
                self.scheduler.on_miss();
                self.streaks.clear();
                self.emit_perf_if_due();
                return;
            }
            Err(e @ CoreError::CaptureClosed(_)) => {
                warn!("캡처 세션 소실: {e}");
                self.channel.emit(StatusEvent::error(&e));
                self.enter_fault().await;
                return;
            }
            Err(e) => {
                self.channel.emit(StatusEvent::error(&e));
                self.scheduler.on_miss();
                self.emit_perf_if_due();
                return;
            }
        }

        // 캐시에서 스캐너 태그로 획득
        let Some(frame) = self.cache.acquire(SCANNER_TAG) else {
            self.scheduler.on_miss();
            self.emit_perf_if_due();
            return;
        };
        if frame.is_stale(self.cfg.capture_timeout_ms) {
            self.cache.release(SCANNER_TAG);
            self.scheduler.on_miss();
            self.streaks.clear();
            self.emit_perf_if_due();
            return;
        }

        let params = MatchParams {
            threshold: self.cfg.threshold,
            grayscale: self.cfg.grayscale,
            roi: self.cfg.roi,
        };
        let matched = find_first_match(&frame, &self.bank, &params);

        match matched {
            Some(result) => {
                self.channel.emit(StatusEvent::Match {
                    result: result.clone(),
                });
                // 이번 틱에 나오지 않은 템플릿의 스트릭은 리셋
                let id = result.template_id.clone();
                self.streaks.retain(|k, _| *k == id);
                let streak = self.streaks.entry(id).or_insert(0);
                *streak += 1;
                let streak = *streak;
                debug!(template = %result.template_id, score = result.score, streak, "적격 매칭");
                self.scheduler.reset_backoff();

                if streak >= self.cfg.min_detections {
                    self.try_click(&frame, &result).await;
                }
            }
            None => {
                self.scheduler.on_miss();
                self.streaks.clear();
            }
        }

        self.cache.release(SCANNER_TAG);
        self.emit_perf_if_due();
    }

    /// 핸들 유효성 검증/주기 갱신. 상태 전이가 일어났으면 true.
    async fn refresh_target(&mut self) -> bool {
        if self.cfg.capture_backend != CaptureBackend::Window {
            return false;
        }
        let Some(current) = self.target else {
            return false;
        };

        let dead = !self.locator.is_alive(current);
        if !dead && !self.cfg.auto_update_hwnd_by_process {
            return false;
        }

        let Some(spec) = self.target_spec.clone() else {
            return false;
        };
        // 명시적 핸들이 죽은 경우는 재해석 불가 — 세션 소실로 처리
        match self.locator.resolve(&spec) {
            Ok(handle) if handle != current => {
                info!(old = current.raw(), new = handle.raw(), "대상 핸들 변경 — 세션 재구성");
                self.target = Some(handle);
                self.source.stop().await;
                self.begin_arming();
                true
            }
            Ok(_) => false,
            Err(e) => {
                if dead {
                    let e = CoreError::CaptureClosed("대상 창 소멸".to_string());
                    self.channel.emit(StatusEvent::error(&e));
                    self.enter_fault().await;
                    true
                } else {
                    debug!("대상 재해석 실패 (기존 핸들 유지): {e}");
                    false
                }
            }
        }
    }

    /// 클릭 시도 — 성공 시 Cooldown 진입
    async fn try_click(&mut self, frame: &Frame, result: &MatchResult) {
        let Some(handle) = self.target else {
            let e = CoreError::TargetNotFound("클릭 대상 창 없음".to_string());
            warn!("{e}");
            self.channel.emit(StatusEvent::error(&e));
            return;
        };

        // 프레임 좌표 → 클라이언트 좌표
        let frame_point = if self.cfg.capture_backend == CaptureBackend::Window {
            result.center
        } else {
            // 모니터 프레임: 가상 스크린 좌표 경유
            let client = match self.locator.client_rect(handle) {
                Ok(r) => r,
                Err(e) => {
                    self.channel.emit(StatusEvent::error(&e));
                    return;
                }
            };
            Point::new(
                self.frame_origin.x + result.center.x - client.x,
                self.frame_origin.y + result.center.y - client.y,
            )
        };

        match self.dispatcher.dispatch(
            self.locator.as_ref(),
            handle,
            &result.template_id,
            frame_point,
            self.cfg.click_offset,
        ) {
            Ok(DispatchOutcome::Clicked(info)) => {
                self.save_debug_image(frame, result);
                self.channel.emit(StatusEvent::Click { info });
                self.scheduler.on_hit();
                self.streaks.clear();
                self.set_state(ScannerState::Cooldown, "클릭 후 냉각");
            }
            Ok(DispatchOutcome::Cooling) => {
                debug!("디스패처 쿨다운 — 클릭 억제");
            }
            Err(e) => {
                // 복구 가능: 기록하고 미스로 계속
                warn!("클릭 실패: {e}");
                self.channel.emit(StatusEvent::error(&e));
                self.scheduler.on_miss();
            }
        }
    }

    /// 장애 상태 진입 (백오프는 Arming 재진입에서 소비)
    async fn enter_fault(&mut self) {
        self.source.stop().await;
        self.streaks.clear();
        let backoff = self.faults.record();
        if self.faults.sticky {
            error!("장애 한도 초과 — 사용자 조치까지 정지");
            self.set_state(ScannerState::Faulted, "장애 한도 초과");
        } else {
            self.set_state(ScannerState::Faulted, "백오프 후 재시작");
            tokio::time::sleep(backoff).await;
            self.begin_arming();
        }
    }

    fn set_state(&mut self, new: ScannerState, detail: &str) {
        if self.state != new {
            info!(from = %self.state, to = %new, detail, "상태 전이");
            self.state = new;
            self.channel.emit(StatusEvent::status(new, detail));
        }
    }

    fn emit_perf_if_due(&mut self) {
        if self.last_perf.elapsed() < PERF_INTERVAL {
            return;
        }
        self.last_perf = Instant::now();
        let (cpu, mem) = self.perf.sample();
        let capture = self.source.stats();
        let cache = self.cache.stats();
        self.channel.emit(StatusEvent::PerfTick {
            fps: capture.actual_fps,
            cpu,
            mem_bytes: mem,
            cache_hits: cache.hits,
            cache_publishes: cache.publishes,
            timestamp: chrono::Utc::now(),
        });
    }

    /// 명중 프레임을 디버그 디렉토리에 PNG로 저장
    fn save_debug_image(&self, frame: &Frame, result: &MatchResult) {
        let Some(ref dir) = self.cfg.debug_image_dir else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("디버그 디렉토리 생성 실패: {e}");
            return;
        }
        // BGR → RGB 채널 교환 후 저장
        let bgr = frame.to_tight_bgr();
        let mut rgb = Vec::with_capacity(bgr.len());
        for px in bgr.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        let Some(img) = image::RgbImage::from_raw(frame.width, frame.height, rgb) else {
            return;
        };
        let name = format!(
            "hit_{}_{}.png",
            result.timestamp.format("%Y%m%d_%H%M%S%.3f"),
            result.template_id
        );
        let path = dir.join(name);
        if let Err(e) = img.save(&path) {
            warn!("디버그 이미지 저장 실패: {e}");
        } else {
            debug!(path = %path.display(), "디버그 이미지 저장");
        }
    }
}

/// 취소 가능한 슬립 — 타이머, 명령, 종료 신호 중 먼저 오는 것
async fn sleep_or_command(
    delay: Duration,
    cmd_rx: &mut mpsc::Receiver<WorkerCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Wake {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Wake::Timer,
        cmd = cmd_rx.recv() => match cmd {
            Some(cmd) => Wake::Command(cmd),
            None => Wake::Shutdown,
        },
        _ = shutdown_rx.changed() => Wake::Shutdown,
    }
}
