//! Direct3D11 디바이스 생성과 GPU→CPU 텍스처 리드백.
//!
//! 리드백은 스테이징 텍스처 복사 후 Map으로 수행하며, 행 복사는
//! 소스 RowPitch에서 유효 폭(`clip_w * 4`)만큼만 읽는다. 전체 stride를
//! 읽으면 리사이즈된 창에서 대각선 왜곡이 생기므로 금지한다.

#![cfg(windows)]

use okshim_core::error::CoreError;
use windows::core::Interface;
use windows::Graphics::DirectX::Direct3D11::{IDirect3DDevice, IDirect3DSurface};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::WinRT::Direct3D11::{
    CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
};

/// D3D11 디바이스 묶음 (Win32 + WinRT 양쪽 핸들)
pub(crate) struct D3dDevice {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub winrt_device: IDirect3DDevice,
}

/// 하드웨어 디바이스 생성, 실패 시 WARP 폴백
pub(crate) fn create_device() -> Result<D3dDevice, CoreError> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;

    let mut result = unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    };
    if result.is_err() {
        tracing::warn!("하드웨어 D3D11 디바이스 생성 실패, WARP 폴백");
        result = unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_WARP,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        };
    }
    result.map_err(|e| CoreError::CaptureUnsupported(format!("D3D11 디바이스 생성 실패: {e}")))?;

    let device = device
        .ok_or_else(|| CoreError::CaptureUnsupported("D3D11 디바이스 없음".to_string()))?;
    let context = context
        .ok_or_else(|| CoreError::CaptureUnsupported("D3D11 컨텍스트 없음".to_string()))?;

    let dxgi: IDXGIDevice = device
        .cast()
        .map_err(|e| CoreError::CaptureUnsupported(format!("DXGI 캐스팅 실패: {e}")))?;
    let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi) }
        .map_err(|e| CoreError::CaptureUnsupported(format!("WinRT 디바이스 생성 실패: {e}")))?;
    let winrt_device: IDirect3DDevice = inspectable
        .cast()
        .map_err(|e| CoreError::CaptureUnsupported(format!("IDirect3DDevice 캐스팅 실패: {e}")))?;

    Ok(D3dDevice {
        device,
        context,
        winrt_device,
    })
}

/// WinRT 서피스에서 D3D11 텍스처 꺼내기
pub(crate) fn texture_from_surface(
    surface: &IDirect3DSurface,
) -> Result<ID3D11Texture2D, CoreError> {
    let access: IDirect3DDxgiInterfaceAccess = surface
        .cast()
        .map_err(|e| CoreError::Internal(format!("서피스 인터페이스 접근 실패: {e}")))?;
    unsafe { access.GetInterface::<ID3D11Texture2D>() }
        .map_err(|e| CoreError::Internal(format!("텍스처 추출 실패: {e}")))
}

/// GPU 텍스처를 tight BGRA 버퍼로 리드백.
///
/// `clip_w`/`clip_h`는 content_size와 풀 크기의 교집합이어야 한다.
/// 반환 버퍼의 pitch는 `clip_w * 4` (패딩 없음).
pub(crate) fn readback_bgra(
    device: &ID3D11Device,
    context: &ID3D11DeviceContext,
    texture: &ID3D11Texture2D,
    clip_w: u32,
    clip_h: u32,
) -> Result<Vec<u8>, CoreError> {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };

    let clip_w = clip_w.min(desc.Width);
    let clip_h = clip_h.min(desc.Height);
    if clip_w == 0 || clip_h == 0 {
        return Err(CoreError::Internal("빈 텍스처 리드백".to_string()));
    }

    let mut staging_desc = desc;
    staging_desc.Usage = D3D11_USAGE_STAGING;
    staging_desc.BindFlags = 0;
    staging_desc.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
    staging_desc.MiscFlags = 0;

    let mut staging: Option<ID3D11Texture2D> = None;
    unsafe { device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
        .map_err(|e| CoreError::Internal(format!("스테이징 텍스처 생성 실패: {e}")))?;
    let staging =
        staging.ok_or_else(|| CoreError::Internal("스테이징 텍스처 없음".to_string()))?;

    unsafe { context.CopyResource(&staging, texture) };

    let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
    unsafe { context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
        .map_err(|e| CoreError::Internal(format!("스테이징 Map 실패: {e}")))?;

    // 행 단위 복사: 소스 pitch(정렬 64/256 가능)에서 유효 바이트만
    let row_bytes = clip_w as usize * 4;
    let src_pitch = mapped.RowPitch as usize;
    let mut out = vec![0u8; row_bytes * clip_h as usize];
    unsafe {
        let base = mapped.pData as *const u8;
        for y in 0..clip_h as usize {
            let src = std::slice::from_raw_parts(base.add(y * src_pitch), row_bytes);
            out[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src);
        }
        context.Unmap(&staging, 0);
    }
    Ok(out)
}
