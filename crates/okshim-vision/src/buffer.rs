//! 매칭용 픽셀 버퍼.
//!
//! 프레임과 템플릿 양쪽을 같은 표현(인터리브, 패딩 없음)으로 맞춘다.
//! 그레이 변환은 프레임 쪽 변환과 동일한 BT.601 정수 가중치를 쓴다 —
//! 서로 다른 공식이 섞이면 동일 픽셀의 템플릿이 만점이 나오지 않는다.

use okshim_core::models::frame::Frame;

/// 인터리브 픽셀 버퍼 (채널 1=gray 또는 3=BGR)
#[derive(Debug, Clone)]
pub struct PixelBuf {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

impl PixelBuf {
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            channels: 1,
            data,
        }
    }

    pub fn bgr(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            channels: 3,
            data,
        }
    }

    /// 프레임에서 매칭 버퍼 생성 (pitch 패딩은 Frame 변환 루틴이 제거)
    pub fn from_frame(frame: &Frame, grayscale: bool) -> Self {
        if grayscale {
            Self::gray(frame.width, frame.height, frame.to_tight_gray())
        } else {
            Self::bgr(frame.width, frame.height, frame.to_tight_bgr())
        }
    }

    /// 부분 영역 잘라내기. 호출자는 영역이 버퍼 안에 있음을 보장한다.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Self {
        let c = self.channels as usize;
        let src_stride = self.width as usize * c;
        let row_bytes = w as usize * c;
        let mut data = Vec::with_capacity(row_bytes * h as usize);
        for row in y..y + h {
            let start = row as usize * src_stride + x as usize * c;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Self {
            width: w,
            height: h,
            channels: self.channels,
            data,
        }
    }
}

/// BGR 인터리브 버퍼 → 그레이 (BT.601, `Frame::to_tight_gray`와 동일식)
pub fn gray_from_bgr(width: u32, height: u32, bgr: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for px in bgr.chunks_exact(3) {
        let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
        out.push(((r * 299 + g * 587 + b * 114) / 1000) as u8);
    }
    out
}
