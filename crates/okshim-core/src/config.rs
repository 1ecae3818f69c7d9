//! 애플리케이션 설정 구조체.
//!
//! 단일 JSON 문서(평면 키)로 저장된다. 알 수 없는 키는 무시되고,
//! 없는 키는 기본값을 취한다. 레거시 `capture_backend` 값
//! (`screen`/`auto` → `monitor`, `wgc` → `window`)은 로드 시 정규화된다.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;
use crate::models::target::{CaptureOptions, CaptureSource, WindowHandle, WindowTarget};

/// 캡처 소스 종별
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// 창 캡처
    Window,
    /// 모니터 캡처
    Monitor,
}

impl<'de> Deserialize<'de> for CaptureBackend {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.to_ascii_lowercase().as_str() {
            // 레거시 값 정규화
            "window" | "wgc" => Ok(CaptureBackend::Window),
            "monitor" | "screen" | "auto" => Ok(CaptureBackend::Monitor),
            other => Err(serde::de::Error::custom(format!(
                "알 수 없는 capture_backend: {other}"
            ))),
        }
    }
}

/// 클릭 디스패치 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMethod {
    /// 비활성 윈도우 메시지 (PostMessage) — 포커스/커서 불변
    Message,
    /// 실제 입력 합성 (enigo) — 커서가 이동함
    Simulate,
}

/// 관심 영역. w 또는 h가 0이면 전체 프레임을 의미한다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    #[serde(default)]
    pub w: u32,
    #[serde(default)]
    pub h: u32,
}

impl Roi {
    /// 전체 프레임 의미 여부
    pub fn is_full(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// 프레임 크기에 맞게 클리핑. 교집합이 비면 None.
    pub fn clip_to(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        if self.is_full() {
            return Some((0, 0, frame_w, frame_h));
        }
        if self.x >= frame_w || self.y >= frame_h {
            return None;
        }
        let w = self.w.min(frame_w - self.x);
        let h = self.h.min(frame_h - self.y);
        if w == 0 || h == 0 {
            None
        } else {
            Some((self.x, self.y, w, h))
        }
    }
}

/// 최상위 애플리케이션 설정 (평면 JSON 문서)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 단일 템플릿 (레거시; template_paths가 있으면 무시)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    /// 템플릿 목록 (설정 순서대로 평가)
    #[serde(default)]
    pub template_paths: Vec<String>,

    /// 캡처 소스 종별
    #[serde(default = "default_capture_backend")]
    pub capture_backend: CaptureBackend,
    /// 명시적 창 핸들 (0이면 미지정)
    #[serde(default)]
    pub target_hwnd: isize,
    /// 제목 기반 해석 패턴 (빈 문자열이면 미지정)
    #[serde(default)]
    pub target_window_title: String,
    /// 제목 부분 일치 여부 (false면 완전 일치)
    #[serde(default = "default_true")]
    pub window_title_partial_match: bool,
    /// 프로세스 기반 해석 (이미지 이름 또는 전체 경로)
    #[serde(default)]
    pub target_process: String,
    /// 모니터 소스 인덱스 (1-기반)
    #[serde(default = "default_monitor_index")]
    pub monitor_index: u32,

    /// 관심 영역
    #[serde(default)]
    pub roi: Roi,

    /// 기준 스캔 주기 (밀리초)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// 화이트리스트 활성 시 최소 스캔 주기
    #[serde(default = "default_active_scan_interval_ms")]
    pub active_scan_interval_ms: u64,
    /// 비 화이트리스트 시 스캔 주기
    #[serde(default = "default_idle_scan_interval_ms")]
    pub idle_scan_interval_ms: u64,
    /// 지수 백오프 상한 (밀리초)
    #[serde(default = "default_miss_backoff_ms_max")]
    pub miss_backoff_ms_max: u64,
    /// 명중 후 일시 정지 (밀리초)
    #[serde(default = "default_hit_cooldown_ms")]
    pub hit_cooldown_ms: u64,

    /// 매칭 수용 임계값
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// 그레이스케일 매칭 여부
    #[serde(default = "default_true")]
    pub grayscale: bool,
    /// 스케일 피라미드 사용 여부
    #[serde(default)]
    pub multi_scale: bool,
    /// 스케일 목록
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,
    /// 클릭까지 필요한 연속 명중 수
    #[serde(default = "default_min_detections")]
    pub min_detections: u32,

    /// 매칭 중심으로부터의 클릭 오프셋 [dx, dy]
    #[serde(default)]
    pub click_offset: [i32; 2],
    /// 동일 핸들 클릭 쿨다운 (초)
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: f64,
    /// 클릭 방식
    #[serde(default = "default_click_method")]
    pub click_method: ClickMethod,
    /// 디스패치 직전 클라이언트 영역 검증 여부
    #[serde(default = "default_true")]
    pub verify_window_before_click: bool,

    /// 캡처 처리 fps 상한
    #[serde(default = "default_fps_max")]
    pub fps_max: u32,
    /// 프레임 신선도 한도 (밀리초)
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// 커서 오버레이 캡처 여부
    #[serde(default)]
    pub include_cursor: bool,
    /// 캡처 테두리 장식 여부
    #[serde(default)]
    pub border_required: bool,
    /// 최소화 창 비활성 복원 시도 여부
    #[serde(default = "default_true")]
    pub restore_minimized_noactivate: bool,

    /// 스케줄러 활성 분류용 프로세스 화이트리스트
    #[serde(default = "default_process_whitelist")]
    pub process_whitelist: Vec<String>,
    /// 프로세스 기준 핸들 주기 갱신 여부
    #[serde(default)]
    pub auto_update_hwnd_by_process: bool,

    /// 로그 파일 경로 (없으면 stderr만)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// 명중 프레임 디버그 이미지 저장 디렉토리
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_image_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        // serde 기본값 경로와 동일한 결과를 내도록 빈 문서에서 역직렬화
        serde_json::from_str("{}").expect("빈 설정 역직렬화는 항상 성공")
    }
}

impl AppConfig {
    /// 설정 유효성 검증. 실패는 치명적(스캐너 기동 거부)이다.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(CoreError::Config(format!(
                "threshold는 (0, 1] 범위여야 함: {}",
                self.threshold
            )));
        }
        if self.fps_max == 0 {
            return Err(CoreError::Config("fps_max는 1 이상이어야 함".into()));
        }
        if self.min_detections == 0 {
            return Err(CoreError::Config("min_detections는 1 이상이어야 함".into()));
        }
        if self.cooldown_s < 0.0 || !self.cooldown_s.is_finite() {
            return Err(CoreError::Config(format!(
                "cooldown_s가 유효하지 않음: {}",
                self.cooldown_s
            )));
        }
        if self.monitor_index == 0 {
            return Err(CoreError::Config("monitor_index는 1-기반".into()));
        }
        if self.active_scan_interval_ms == 0 || self.idle_scan_interval_ms == 0 {
            return Err(CoreError::Config("스캔 주기는 0일 수 없음".into()));
        }
        for s in &self.scales {
            if !(*s > 0.0 && s.is_finite()) {
                return Err(CoreError::Config(format!("잘못된 스케일 값: {s}")));
            }
        }
        if self.templates().is_empty() {
            return Err(CoreError::Config("템플릿이 하나도 지정되지 않음".into()));
        }
        Ok(())
    }

    /// 유효 템플릿 경로 목록 — 목록이 비어 있으면 레거시 단일 키 사용
    pub fn templates(&self) -> Vec<String> {
        if !self.template_paths.is_empty() {
            self.template_paths.clone()
        } else {
            self.template_path.clone().into_iter().collect()
        }
    }

    /// 유효 스케일 목록 — multi_scale이 꺼져 있거나 목록이 비면 단일 1.0
    pub fn effective_scales(&self) -> Vec<f32> {
        if !self.multi_scale || self.scales.is_empty() {
            vec![1.0]
        } else {
            self.scales.clone()
        }
    }

    /// 창 해석 기준 도출 (우선순위: 핸들 → 제목 → 프로세스)
    pub fn window_target(&self) -> Option<WindowTarget> {
        if self.target_hwnd != 0 {
            Some(WindowTarget::Handle(WindowHandle(self.target_hwnd)))
        } else if !self.target_window_title.is_empty() {
            Some(WindowTarget::Title {
                pattern: self.target_window_title.clone(),
                partial: self.window_title_partial_match,
            })
        } else if !self.target_process.is_empty() {
            Some(WindowTarget::Process(self.target_process.clone()))
        } else {
            None
        }
    }

    /// 모니터 모드용 캡처 소스
    pub fn monitor_source(&self) -> CaptureSource {
        CaptureSource::Monitor(self.monitor_index)
    }

    /// 캡처 세션 옵션
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            include_cursor: self.include_cursor,
            border_required: self.border_required,
            fps_max: self.fps_max,
            timeout_ms: self.capture_timeout_ms,
            restore_minimized_noactivate: self.restore_minimized_noactivate,
        }
    }

    /// 클릭 쿨다운을 Duration으로 반환
    pub fn click_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_s)
    }
}

// ============================================================
// 기본값 함수
// ============================================================

fn default_true() -> bool {
    true
}
fn default_capture_backend() -> CaptureBackend {
    CaptureBackend::Window
}
fn default_monitor_index() -> u32 {
    1
}
fn default_interval_ms() -> u64 {
    800
}
fn default_active_scan_interval_ms() -> u64 {
    120
}
fn default_idle_scan_interval_ms() -> u64 {
    2_000
}
fn default_miss_backoff_ms_max() -> u64 {
    5_000
}
fn default_hit_cooldown_ms() -> u64 {
    4_000
}
fn default_threshold() -> f32 {
    0.88
}
fn default_scales() -> Vec<f32> {
    vec![1.0]
}
fn default_min_detections() -> u32 {
    1
}
fn default_cooldown_s() -> f64 {
    5.0
}
fn default_click_method() -> ClickMethod {
    ClickMethod::Message
}
fn default_fps_max() -> u32 {
    30
}
fn default_capture_timeout_ms() -> u64 {
    5_000
}
fn default_process_whitelist() -> Vec<String> {
    vec![
        "Code.exe".to_string(),
        "Windsurf.exe".to_string(),
        "Trae.exe".to_string(),
        "Cursor.exe".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_table() {
        let c = AppConfig::default();
        assert_eq!(c.capture_backend, CaptureBackend::Window);
        assert_eq!(c.interval_ms, 800);
        assert_eq!(c.active_scan_interval_ms, 120);
        assert_eq!(c.idle_scan_interval_ms, 2_000);
        assert_eq!(c.miss_backoff_ms_max, 5_000);
        assert_eq!(c.hit_cooldown_ms, 4_000);
        assert!((c.threshold - 0.88).abs() < 1e-6);
        assert!(c.grayscale);
        assert!(!c.multi_scale);
        assert_eq!(c.scales, vec![1.0]);
        assert_eq!(c.min_detections, 1);
        assert_eq!(c.click_offset, [0, 0]);
        assert_eq!(c.click_method, ClickMethod::Message);
        assert!(c.verify_window_before_click);
        assert_eq!(c.fps_max, 30);
        assert_eq!(c.capture_timeout_ms, 5_000);
        assert!(!c.include_cursor);
        assert!(!c.border_required);
        assert!(c.restore_minimized_noactivate);
        assert!(c.roi.is_full());
        assert!(!c.auto_update_hwnd_by_process);
    }

    #[test]
    fn legacy_backend_values_normalize() {
        for (raw, expected) in [
            ("wgc", CaptureBackend::Window),
            ("screen", CaptureBackend::Monitor),
            ("auto", CaptureBackend::Monitor),
            ("window", CaptureBackend::Window),
            ("monitor", CaptureBackend::Monitor),
        ] {
            let c: AppConfig =
                serde_json::from_str(&format!("{{\"capture_backend\": \"{raw}\"}}")).unwrap();
            assert_eq!(c.capture_backend, expected, "입력 {raw}");
        }
    }

    #[test]
    fn unknown_backend_value_is_rejected() {
        let r: Result<AppConfig, _> =
            serde_json::from_str("{\"capture_backend\": \"printwindow\"}");
        assert!(r.is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let c: AppConfig =
            serde_json::from_str("{\"dirty_region_mode\": \"full\", \"interval_ms\": 500}")
                .unwrap();
        assert_eq!(c.interval_ms, 500);
    }

    #[test]
    fn legacy_single_template_used_when_list_empty() {
        let mut c = AppConfig::default();
        c.template_path = Some("ok.png".into());
        assert_eq!(c.templates(), vec!["ok.png".to_string()]);

        c.template_paths = vec!["a.png".into(), "b.png".into()];
        assert_eq!(c.templates(), vec!["a.png".to_string(), "b.png".to_string()]);
    }

    #[test]
    fn effective_scales_fallback_to_unity() {
        let mut c = AppConfig::default();
        c.multi_scale = false;
        c.scales = vec![0.8, 1.2];
        assert_eq!(c.effective_scales(), vec![1.0]);

        c.multi_scale = true;
        c.scales = vec![];
        assert_eq!(c.effective_scales(), vec![1.0]);

        c.scales = vec![0.8, 1.0, 1.2];
        assert_eq!(c.effective_scales(), vec![0.8, 1.0, 1.2]);
    }

    #[test]
    fn target_resolution_priority() {
        let mut c = AppConfig::default();
        assert!(c.window_target().is_none());

        c.target_process = "Code.exe".into();
        assert!(matches!(c.window_target(), Some(WindowTarget::Process(_))));

        c.target_window_title = "Visual Studio Code".into();
        assert!(matches!(
            c.window_target(),
            Some(WindowTarget::Title { partial: true, .. })
        ));

        c.target_hwnd = 0x1234;
        assert!(matches!(c.window_target(), Some(WindowTarget::Handle(_))));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut c = AppConfig::default();
        c.template_paths = vec!["ok.png".into()];
        assert!(c.validate().is_ok());

        c.threshold = 1.5;
        assert!(c.validate().is_err());
        c.threshold = 0.9;

        c.min_detections = 0;
        assert!(c.validate().is_err());
        c.min_detections = 2;

        c.scales = vec![1.0, -0.5];
        assert!(c.validate().is_err());
        c.scales = vec![1.0];

        c.template_paths.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn roi_clip_behavior() {
        let full = Roi::default();
        assert_eq!(full.clip_to(800, 600), Some((0, 0, 800, 600)));

        let r = Roi {
            x: 700,
            y: 500,
            w: 200,
            h: 200,
        };
        assert_eq!(r.clip_to(800, 600), Some((700, 500, 100, 100)));

        let off = Roi {
            x: 900,
            y: 0,
            w: 10,
            h: 10,
        };
        assert_eq!(off.clip_to(800, 600), None);
    }

    #[test]
    fn config_json_roundtrip_preserves_equality() {
        let mut c = AppConfig::default();
        c.template_paths = vec!["approve.png".into(), "run.png".into()];
        c.threshold = 0.91;
        c.roi = Roi {
            x: 10,
            y: 20,
            w: 300,
            h: 200,
        };
        let json = serde_json::to_string_pretty(&c).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
