//! 매칭 결과 모델.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geometry::Point;

/// 템플릿 식별자 — 디코딩된 바이트의 콘텐츠 해시 (sha256 앞 16 hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 단일 매칭 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// 매칭된 템플릿
    pub template_id: TemplateId,
    /// 매칭 중심점 (캡처 프레임 좌표)
    pub center: Point,
    /// NCC 점수 [0, 1]
    pub score: f32,
    /// 매칭에 사용된 스케일
    pub scale: f32,
    /// 벽시계 시각 (이벤트 표기용)
    pub timestamp: DateTime<Utc>,
}

/// 클릭 디스패치 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickInfo {
    /// 매칭된 템플릿
    pub template_id: TemplateId,
    /// 최종 클릭 지점 (물리 화면 좌표)
    pub screen_point: Point,
    /// 대상 창 핸들 값
    pub hwnd: isize,
    /// 벽시계 시각
    pub timestamp: DateTime<Utc>,
}
