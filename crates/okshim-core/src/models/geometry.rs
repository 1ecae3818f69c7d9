//! 좌표/사각형/모니터 기하 모델.
//!
//! 모든 OS 경계 좌표는 물리 픽셀(가상 스크린 원점 기준)이다.
//! 논리 좌표는 모니터별 배율을 적용한 표시용 좌표로만 사용한다.

use serde::{Deserialize, Serialize};

/// 물리 픽셀 좌표 (가상 스크린 기준, 보조 모니터에서 음수 가능)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// 오프셋 적용
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// 물리 픽셀 사각형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// 좌상단 x (물리)
    pub x: i32,
    /// 좌상단 y (물리)
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// 점 포함 여부 (우/하 변은 배타)
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    /// 교차 여부
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// 논리 좌표 (DPI 배율 제거 후)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: f64,
    pub y: f64,
}

/// 디스플레이 모니터.
///
/// `bounds`는 가상 스크린 좌표계의 물리 픽셀 영역이며 모니터 간 겹치지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    /// 1-기반 안정 인덱스 (설정 `monitor_index`와 동일한 공간)
    pub index: u32,
    /// OS 모니터 핸들 (HMONITOR). 비 Windows 테스트에서는 0.
    pub handle: isize,
    /// 물리 픽셀 영역
    pub bounds: Rect,
    /// DPI 배율 (96dpi 기준, 예: 1.0, 1.5, 2.0)
    pub scale_factor: f64,
    /// 주 모니터 여부
    pub is_primary: bool,
}

impl Monitor {
    /// 물리 → 논리 변환. 모니터 원점 기준 상대 좌표에만 배율을 적용한다.
    pub fn to_logical(&self, p: Point) -> LogicalPoint {
        LogicalPoint {
            x: self.bounds.x as f64 + (p.x - self.bounds.x) as f64 / self.scale_factor,
            y: self.bounds.y as f64 + (p.y - self.bounds.y) as f64 / self.scale_factor,
        }
    }

    /// 논리 → 물리 변환 (`to_logical`의 역)
    pub fn to_physical(&self, p: LogicalPoint) -> Point {
        Point {
            x: self.bounds.x + ((p.x - self.bounds.x as f64) * self.scale_factor).round() as i32,
            y: self.bounds.y + ((p.y - self.bounds.y as f64) * self.scale_factor).round() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_contains_is_exclusive_on_far_edges() {
        let r = Rect::new(10, 10, 100, 50);
        assert!(r.contains(Point::new(10, 10)));
        assert!(r.contains(Point::new(109, 59)));
        assert!(!r.contains(Point::new(110, 10)));
        assert!(!r.contains(Point::new(10, 60)));
    }

    #[test]
    fn negative_origin_secondary_monitor_roundtrip() {
        // 주 모니터 왼쪽에 위치한 보조 모니터 (가상 스크린 음수 원점)
        let m = Monitor {
            index: 2,
            handle: 0,
            bounds: Rect::new(-1920, 0, 1920, 1080),
            scale_factor: 1.5,
            is_primary: false,
        };
        let phys = Point::new(-1820, 120);
        let logical = m.to_logical(phys);
        assert!((logical.x - (-1920.0 + 100.0 / 1.5)).abs() < 1e-9);
        let back = m.to_physical(logical);
        assert_eq!(back, phys);
    }

    #[test]
    fn unit_scale_is_identity() {
        let m = Monitor {
            index: 1,
            handle: 0,
            bounds: Rect::new(0, 0, 2560, 1440),
            scale_factor: 1.0,
            is_primary: true,
        };
        let p = Point::new(640, 480);
        let l = m.to_logical(p);
        assert_eq!(m.to_physical(l), p);
        assert_eq!(l.x, 640.0);
    }
}
