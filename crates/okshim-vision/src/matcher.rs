//! 정규화 상호상관 매처.
//!
//! 제로 평균 NCC(TM_CCOEFF_NORMED 동치)를 ROI 영역 전수 탐색으로 계산한다.
//!
//! 다중 템플릿: 설정 순서로 평가하고 첫 번째로 임계값을 넘는 템플릿이
//! 승리한다 (틱당 중복 클릭 방지). 다중 스케일: 템플릿 내에서는 모든
//! 스케일 중 최고 점수를 쓴다. 동점은 |1 − scale|이 작은 쪽, 그다음
//! 좌상단 우선.

use chrono::Utc;
use okshim_core::config::Roi;
use okshim_core::models::frame::Frame;
use okshim_core::models::geometry::Point;
use okshim_core::models::matching::MatchResult;
use tracing::trace;

use crate::bank::TemplateBank;
use crate::buffer::PixelBuf;

/// 매칭 파라미터
#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    /// 수용 임계값 [0, 1]
    pub threshold: f32,
    /// 그레이스케일 매칭 여부 (false면 BGR 3채널)
    pub grayscale: bool,
    /// 관심 영역 (w/h 0이면 전체 프레임)
    pub roi: Roi,
}

/// 템플릿 내 스케일 탐색의 중간 결과
#[derive(Debug, Clone, Copy)]
struct ScaleHit {
    score: f32,
    scale: f32,
    /// ROI 좌표계의 좌상단 위치
    x: u32,
    y: u32,
    tpl_w: u32,
    tpl_h: u32,
}

/// 프레임에서 첫 번째 적격 매칭을 찾는다.
///
/// 프레임이 모든 스케일에서 템플릿보다 작으면 매칭 없음으로 처리한다
/// (에러가 아님). 반환 좌표는 ROI 오프셋이 더해진 프레임 좌표계다.
pub fn find_first_match(
    frame: &Frame,
    bank: &TemplateBank,
    params: &MatchParams,
) -> Option<MatchResult> {
    let (rx, ry, rw, rh) = params.roi.clip_to(frame.width, frame.height)?;

    let full = PixelBuf::from_frame(frame, params.grayscale);
    let search = if (rx, ry, rw, rh) == (0, 0, frame.width, frame.height) {
        full
    } else {
        full.crop(rx, ry, rw, rh)
    };

    for template in bank.iter() {
        let mut best: Option<ScaleHit> = None;
        for variant in &template.pyramid {
            let tpl = if params.grayscale {
                &variant.gray
            } else {
                &variant.bgr
            };
            let Some((score, x, y)) = match_single(&search, tpl) else {
                continue; // 이 스케일에선 프레임이 템플릿보다 작음
            };
            let candidate = ScaleHit {
                score,
                scale: variant.scale,
                x,
                y,
                tpl_w: tpl.width,
                tpl_h: tpl.height,
            };
            best = Some(match best {
                None => candidate,
                Some(cur) => pick_better(cur, candidate),
            });
        }

        let Some(hit) = best else { continue };
        trace!(template = %template.id, score = hit.score, scale = hit.scale, "템플릿 평가");
        if hit.score >= params.threshold {
            // 첫 적격 템플릿에서 조기 종료
            return Some(MatchResult {
                template_id: template.id.clone(),
                center: Point::new(
                    rx as i32 + hit.x as i32 + (hit.tpl_w / 2) as i32,
                    ry as i32 + hit.y as i32 + (hit.tpl_h / 2) as i32,
                ),
                score: hit.score,
                scale: hit.scale,
                timestamp: Utc::now(),
            });
        }
    }
    None
}

/// 스케일 간 우열: 점수 → |1 − scale| → 좌상단
fn pick_better(a: ScaleHit, b: ScaleHit) -> ScaleHit {
    if b.score > a.score {
        return b;
    }
    if b.score < a.score {
        return a;
    }
    let da = (1.0 - a.scale).abs();
    let db = (1.0 - b.scale).abs();
    if db < da {
        return b;
    }
    if db > da {
        return a;
    }
    if (b.y, b.x) < (a.y, a.x) {
        b
    } else {
        a
    }
}

/// 단일 템플릿 전수 NCC. 반환: (최고 점수, 좌상단 x, y).
///
/// 행 우선 탐색에서 strict 비교로 최초 최대값을 유지하므로 동점이면
/// 자연히 좌상단 위치가 남는다.
fn match_single(image: &PixelBuf, tpl: &PixelBuf) -> Option<(f32, u32, u32)> {
    debug_assert_eq!(image.channels, tpl.channels);
    if tpl.width > image.width || tpl.height > image.height {
        return None;
    }

    let c = tpl.channels as usize;
    let n = (tpl.width * tpl.height) as usize * c;

    // 템플릿 통계는 위치와 무관 — 한 번만 계산
    let tpl_sum: f64 = tpl.data.iter().map(|&v| v as f64).sum();
    let tpl_mean = tpl_sum / n as f64;
    let mut tpl_zero = Vec::with_capacity(n);
    let mut tpl_norm2 = 0.0f64;
    for &v in &tpl.data {
        let z = v as f64 - tpl_mean;
        tpl_zero.push(z);
        tpl_norm2 += z * z;
    }
    if tpl_norm2 < 1e-12 {
        // 완전히 평탄한 템플릿은 판별력이 없다
        return Some((0.0, 0, 0));
    }

    let img_stride = image.width as usize * c;
    let tpl_row = tpl.width as usize * c;

    let mut best_score = f32::MIN;
    let mut best_x = 0u32;
    let mut best_y = 0u32;

    for y in 0..=(image.height - tpl.height) {
        for x in 0..=(image.width - tpl.width) {
            let mut win_sum = 0.0f64;
            let mut win_sum2 = 0.0f64;
            let mut cross = 0.0f64;
            let mut ti = 0usize;
            for ty in 0..tpl.height as usize {
                let base = (y as usize + ty) * img_stride + x as usize * c;
                for &iv in &image.data[base..base + tpl_row] {
                    let ivf = iv as f64;
                    win_sum += ivf;
                    win_sum2 += ivf * ivf;
                    cross += ivf * tpl_zero[ti];
                    ti += 1;
                }
            }
            // Σ(I−Ī)(T−T̄) = ΣI·T' (T'의 합이 0이므로)
            let win_var = win_sum2 - win_sum * win_sum / n as f64;
            if win_var < 1e-12 {
                continue; // 평탄한 윈도우
            }
            let score = (cross / (win_var * tpl_norm2).sqrt()) as f32;
            if score > best_score {
                best_score = score;
                best_x = x;
                best_y = y;
            }
        }
    }
    Some((best_score.clamp(0.0, 1.0), best_x, best_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 결정적 패턴 버퍼
    fn patterned(w: u32, h: u32) -> PixelBuf {
        let data: Vec<u8> = (0..w * h)
            .map(|i| ((i * 37 + (i / w) * 11) % 256) as u8)
            .collect();
        PixelBuf::gray(w, h, data)
    }

    #[test]
    fn exact_subregion_scores_one() {
        let img = patterned(64, 48);
        let tpl = img.crop(20, 10, 16, 12);
        let (score, x, y) = match_single(&img, &tpl).unwrap();
        assert!(score > 0.999, "score={score}");
        assert_eq!((x, y), (20, 10));
    }

    #[test]
    fn template_larger_than_image_is_none() {
        let img = patterned(8, 8);
        let tpl = patterned(16, 16);
        assert!(match_single(&img, &tpl).is_none());
    }

    #[test]
    fn flat_template_scores_zero() {
        let img = patterned(32, 32);
        let tpl = PixelBuf::gray(8, 8, vec![128; 64]);
        let (score, _, _) = match_single(&img, &tpl).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn color_match_uses_all_channels() {
        // B 채널만 다른 두 영역 — BGR 매칭은 구분해야 한다
        let mut data = vec![0u8; 32 * 8 * 3];
        for x in 0..16usize {
            for y in 0..8usize {
                let i = (y * 32 + x) * 3;
                data[i] = 250; // 왼쪽 절반: 파랑
                data[i + 1] = (x * 8) as u8;
                let j = (y * 32 + x + 16) * 3;
                data[j] = 10; // 오른쪽 절반: 어두운 파랑
                data[j + 1] = (x * 8) as u8;
            }
        }
        let img = PixelBuf::bgr(32, 8, data);
        let tpl = img.crop(16, 0, 8, 8);
        let (score, x, _) = match_single(&img, &tpl).unwrap();
        assert!(score > 0.999);
        assert_eq!(x, 16);
    }

    #[test]
    fn tiebreak_prefers_scale_closest_to_native() {
        let near = ScaleHit {
            score: 0.9,
            scale: 1.1,
            x: 5,
            y: 5,
            tpl_w: 4,
            tpl_h: 4,
        };
        let far = ScaleHit {
            score: 0.9,
            scale: 0.5,
            x: 1,
            y: 1,
            tpl_w: 4,
            tpl_h: 4,
        };
        assert_eq!(pick_better(far, near).scale, 1.1);
        assert_eq!(pick_better(near, far).scale, 1.1);
    }

    #[test]
    fn tiebreak_prefers_top_left_on_equal_scale_distance() {
        let a = ScaleHit {
            score: 0.9,
            scale: 1.0,
            x: 10,
            y: 3,
            tpl_w: 4,
            tpl_h: 4,
        };
        let b = ScaleHit {
            score: 0.9,
            scale: 1.0,
            x: 2,
            y: 3,
            tpl_w: 4,
            tpl_h: 4,
        };
        assert_eq!(pick_better(a, b).x, 2);
    }
}
