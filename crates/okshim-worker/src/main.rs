//! OKSHIM 스캐너 워커 바이너리.
//!
//! 셸(okshim)이 이 프로세스를 띄우고, stdin으로 명령을 보내고
//! stdout에서 상태 이벤트(JSON Lines)를 읽는다. 단독 실행도 가능하다.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use okshim_capture::cache::SharedFrameCache;
use okshim_capture::registry::{init_dpi_awareness, MonitorRegistry};
use okshim_core::config_manager::ConfigManager;
use okshim_core::models::scanner::WorkerCommand;
use okshim_core::ports::locator::WindowLocator;
use okshim_vision::bank::TemplateBank;
use okshim_worker::clicker::{create_click_driver, ClickDispatcher};
use okshim_worker::scanner::ScannerOrchestrator;
use okshim_worker::status;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// OKSHIM 스캐너 워커
#[derive(Parser, Debug)]
#[command(name = "okshim-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 설정 파일 경로 (기본: 플랫폼 설정 디렉토리의 config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// 시작 즉시 스캔하지 않고 Start 명령을 기다린다
    #[arg(long)]
    no_auto_start: bool,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

/// tracing 초기화 — stderr + (설정 시) ISO-8601 타임스탬프 로그 파일
fn init_tracing(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "okshim_worker={log_level},okshim_core={log_level},okshim_capture={log_level},okshim_vision={log_level}"
        ))
    });

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("로그 파일 열기 실패: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

// ============================================================
// 플랫폼 어댑터 선택
// ============================================================

#[cfg(windows)]
fn make_locator() -> Arc<dyn WindowLocator> {
    Arc::new(okshim_capture::locator::Win32Locator)
}

#[cfg(windows)]
fn make_source(
    cache: Arc<SharedFrameCache>,
) -> Box<dyn okshim_core::ports::capture::FrameSource> {
    Box::new(okshim_capture::wgc::WgcFrameSource::new(cache))
}

#[cfg(windows)]
fn make_registry() -> Result<MonitorRegistry> {
    Ok(MonitorRegistry::new(Box::new(
        okshim_capture::registry::WinMonitorEnumerator,
    ))?)
}

// 비 Windows 개발 빌드: 캡처 미지원을 그대로 보고하는 어댑터
#[cfg(not(windows))]
mod unsupported {
    use super::*;
    use async_trait::async_trait;
    use okshim_core::error::CoreError;
    use okshim_core::models::frame::Frame;
    use okshim_core::models::geometry::{Monitor, Rect};
    use okshim_core::models::target::{CaptureOptions, CaptureSource, WindowHandle, WindowTarget};
    use okshim_core::ports::capture::{CaptureStats, FrameSource};
    use okshim_core::ports::monitors::MonitorEnumerator;

    pub struct NullLocator;

    impl WindowLocator for NullLocator {
        fn resolve(&self, _t: &WindowTarget) -> Result<WindowHandle, CoreError> {
            Err(CoreError::TargetNotFound("이 플랫폼에는 창 탐색이 없음".into()))
        }
        fn client_rect(&self, _h: WindowHandle) -> Result<Rect, CoreError> {
            Err(CoreError::WindowGone)
        }
        fn is_alive(&self, _h: WindowHandle) -> bool {
            false
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

    pub struct NullSource;

    #[async_trait]
    impl FrameSource for NullSource {
        async fn start(
            &mut self,
            _source: CaptureSource,
            _opts: CaptureOptions,
        ) -> Result<(), CoreError> {
            Err(CoreError::CaptureUnsupported(
                "그래픽 캡처는 Windows 전용".to_string(),
            ))
        }
        fn latest_frame(&self) -> Result<Option<std::sync::Arc<Frame>>, CoreError> {
            Ok(None)
        }
        async fn stop(&mut self) {}
        fn stats(&self) -> CaptureStats {
            CaptureStats::default()
        }
    }

    pub struct NullEnumerator;

    impl MonitorEnumerator for NullEnumerator {
        fn enumerate(&self) -> Result<Vec<Monitor>, CoreError> {
            Ok(Vec::new())
        }
    }
}

#[cfg(not(windows))]
fn make_locator() -> Arc<dyn WindowLocator> {
    Arc::new(unsupported::NullLocator)
}

#[cfg(not(windows))]
fn make_source(
    _cache: Arc<SharedFrameCache>,
) -> Box<dyn okshim_core::ports::capture::FrameSource> {
    Box::new(unsupported::NullSource)
}

#[cfg(not(windows))]
fn make_registry() -> Result<MonitorRegistry> {
    Ok(MonitorRegistry::new(Box::new(unsupported::NullEnumerator))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 설정 로드 (없으면 기본 생성)
    let manager = match args.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .map_err(|e| anyhow!("설정 로드 실패: {e}"))?;
    let cfg = manager.get();

    init_tracing(&args.log_level, cfg.log_file.as_ref())?;
    cfg.validate().map_err(|e| anyhow!("설정 검증 실패: {e}"))?;
    info!(config = %manager.config_path().display(), "OKSHIM 워커 시작");

    // 프로세스 DPI 인식은 좌표 API 사용 전에 설정
    init_dpi_awareness();

    // ── 구성 요소 조립 ──
    let cache = Arc::new(SharedFrameCache::with_default_timeout());
    let registry = Arc::new(make_registry()?);
    let locator = make_locator();
    let source = make_source(cache.clone());

    let mut bank = TemplateBank::new(cfg.effective_scales());
    for (path, e) in bank.load_all(&cfg.templates()) {
        warn!(path = %path, "템플릿 제외: {e}");
    }
    if bank.is_empty() {
        return Err(anyhow!("유효한 템플릿이 없음 — 스캔 불가"));
    }

    let dispatcher = ClickDispatcher::new(
        create_click_driver(cfg.click_method),
        cfg.click_cooldown(),
        cfg.verify_window_before_click,
    );

    let (channel, mut receiver) = status::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(16);

    // ── 캐시 스위퍼 ──
    let sweeper = tokio::spawn(okshim_capture::cache::run_sweeper(
        cache.clone(),
        std::time::Duration::from_secs(30),
        shutdown_rx.clone(),
    ));

    // ── 상태 이벤트 → stdout (JSON Lines) ──
    let mut event_shutdown = shutdown_rx.clone();
    let event_pump = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut stdout = tokio::io::stdout();
        loop {
            tokio::select! {
                ev = receiver.changed() => {
                    let Some(ev) = ev else { break };
                    match serde_json::to_string(&ev) {
                        Ok(mut line) => {
                            line.push('\n');
                            if stdout.write_all(line.as_bytes()).await.is_err() {
                                break; // 셸 파이프 소실
                            }
                            let _ = stdout.flush().await;
                        }
                        Err(e) => error!("이벤트 직렬화 실패: {e}"),
                    }
                }
                _ = event_shutdown.changed() => break,
            }
        }
    });

    // ── stdin 명령 (JSON Lines) ──
    let stdin_cmd_tx = cmd_tx.clone();
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerCommand>(line) {
                Ok(cmd) => {
                    if stdin_cmd_tx.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(line, "알 수 없는 명령 무시: {e}"),
            }
        }
        // stdin EOF — 셸이 떠났으면 종료
        let _ = stdin_cmd_tx.blocking_send(WorkerCommand::Exit);
    });

    // ── Ctrl+C → 종료 신호 ──
    let signal_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("종료 신호 수신");
            let _ = signal_shutdown_tx.send(true);
        }
    });

    // ── 오케스트레이터 실행 (현재 태스크에서) ──
    let orchestrator = ScannerOrchestrator::new(
        cfg,
        locator,
        source,
        cache,
        registry,
        bank,
        dispatcher,
        channel,
        Some(manager),
    );
    orchestrator.run(shutdown_rx, cmd_rx, !args.no_auto_start).await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, event_pump);
    info!("OKSHIM 워커 종료");
    Ok(())
}
