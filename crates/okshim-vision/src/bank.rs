//! 템플릿 뱅크.
//!
//! 버튼 템플릿 이미지를 BGR로 디코딩하고 그레이/스케일 피라미드 변형을
//! 미리 계산해 보관한다. 템플릿은 디코딩된 바이트의 콘텐츠 해시로
//! 주소화되며 로드 후 불변이다. 중복 추가는 기존 id를 돌려준다.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::RgbImage;
use okshim_core::error::CoreError;
use okshim_core::models::matching::TemplateId;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::buffer::{gray_from_bgr, PixelBuf};

/// 단일 스케일 변형
#[derive(Debug, Clone)]
pub struct TemplateVariant {
    pub scale: f32,
    pub bgr: PixelBuf,
    pub gray: PixelBuf,
}

/// 로드된 템플릿 (불변)
#[derive(Debug)]
pub struct Template {
    pub id: TemplateId,
    pub source_path: PathBuf,
    /// 원본 크기
    pub width: u32,
    pub height: u32,
    /// 설정 순서의 스케일 변형 (중복 스케일 제거됨)
    pub pyramid: Vec<TemplateVariant>,
}

/// 템플릿 뱅크
pub struct TemplateBank {
    /// 설정 순서 유지 (매칭 평가 순서)
    templates: Vec<Arc<Template>>,
    by_id: HashMap<TemplateId, usize>,
    scales: Vec<f32>,
}

impl TemplateBank {
    /// 스케일 목록으로 빈 뱅크 생성. 빈 목록은 [1.0]으로 취급.
    pub fn new(scales: Vec<f32>) -> Self {
        let scales = if scales.is_empty() { vec![1.0] } else { scales };
        Self {
            templates: Vec::new(),
            by_id: HashMap::new(),
            scales,
        }
    }

    /// 템플릿 로드. 같은 내용을 다시 추가하면 기존 id를 반환한다.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<TemplateId, CoreError> {
        let path = path.as_ref();
        let bad = |reason: String| CoreError::BadTemplate {
            path: path.display().to_string(),
            reason,
        };

        let decoded = image::open(path).map_err(|e| bad(format!("디코딩 실패: {e}")))?;
        let rgb = decoded.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w == 0 || h == 0 {
            return Err(bad("면적이 0인 이미지".to_string()));
        }

        let native_bgr = bgr_bytes(&rgb);

        // 콘텐츠 주소화 — 디코딩된 바이트 + 크기 해시
        let mut hasher = Sha256::new();
        hasher.update(w.to_le_bytes());
        hasher.update(h.to_le_bytes());
        hasher.update(&native_bgr);
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let id = TemplateId(hex[..16].to_string());

        if let Some(&idx) = self.by_id.get(&id) {
            debug!(id = %id, "중복 템플릿 — 기존 id 반환");
            return Ok(self.templates[idx].id.clone());
        }

        // 스케일 피라미드 구성 (중복 스케일은 첫 등장만)
        let mut pyramid = Vec::new();
        let mut seen = Vec::new();
        for &scale in &self.scales {
            if seen.iter().any(|s: &f32| (s - scale).abs() < 1e-6) {
                continue;
            }
            seen.push(scale);
            let sw = ((w as f32 * scale).round() as u32).max(1);
            let sh = ((h as f32 * scale).round() as u32).max(1);
            let scaled = if (scale - 1.0).abs() < 1e-6 {
                rgb.clone()
            } else {
                image::imageops::resize(&rgb, sw, sh, FilterType::Triangle)
            };
            let bgr = bgr_bytes(&scaled);
            let gray = gray_from_bgr(sw, sh, &bgr);
            pyramid.push(TemplateVariant {
                scale,
                bgr: PixelBuf::bgr(sw, sh, bgr),
                gray: PixelBuf::gray(sw, sh, gray),
            });
        }

        let template = Arc::new(Template {
            id: id.clone(),
            source_path: path.to_path_buf(),
            width: w,
            height: h,
            pyramid,
        });
        info!(id = %id, path = %path.display(), w, h, scales = template.pyramid.len(), "템플릿 로드");
        self.by_id.insert(id.clone(), self.templates.len());
        self.templates.push(template);
        Ok(id)
    }

    /// 경로 목록 일괄 로드. 실패 템플릿은 건너뛰고 (경로, 에러)로 수집한다.
    pub fn load_all(&mut self, paths: &[String]) -> Vec<(String, CoreError)> {
        let mut failures = Vec::new();
        for p in paths {
            if let Err(e) = self.load(p) {
                warn!(path = %p, "템플릿 로드 실패, 제외: {e}");
                failures.push((p.clone(), e));
            }
        }
        failures
    }

    /// 모든 템플릿을 원본 경로에서 다시 로드
    pub fn reload_all(&mut self) -> Vec<(String, CoreError)> {
        let paths: Vec<String> = self
            .templates
            .iter()
            .map(|t| t.source_path.display().to_string())
            .collect();
        self.templates.clear();
        self.by_id.clear();
        self.load_all(&paths)
    }

    pub fn get(&self, id: &TemplateId) -> Option<Arc<Template>> {
        self.by_id.get(id).map(|&i| self.templates[i].clone())
    }

    /// 설정 순서 순회
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// RgbImage → BGR 인터리브 바이트
fn bgr_bytes(rgb: &RgbImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgb.as_raw().len());
    for px in rgb.pixels() {
        out.push(px.0[2]);
        out.push(px.0[1]);
        out.push(px.0[0]);
    }
    out
}
