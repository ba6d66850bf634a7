// 渲染协作方接口

use crate::core::{Frame, PixelFormat, PlayerError, Rational, Result, SubtitleCue};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// 渲染器能力
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayCapabilities {
    pub max_width: u32,
    pub max_height: u32,
    pub formats: Vec<PixelFormat>,
}

impl DisplayCapabilities {
    /// 检查画面尺寸和像素格式是否在渲染器能力范围内
    pub fn check(&self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        if width > self.max_width || height > self.max_height {
            return Err(PlayerError::Render(format!(
                "画面 {}x{} 超出渲染器上限 {}x{}",
                width, height, self.max_width, self.max_height
            )));
        }
        if !self.formats.contains(&format) {
            return Err(PlayerError::Render(format!("渲染器不支持像素格式 {:?}", format)));
        }
        Ok(())
    }
}

impl Default for DisplayCapabilities {
    fn default() -> Self {
        Self {
            max_width: 16384,
            max_height: 16384,
            formats: vec![PixelFormat::RGBA, PixelFormat::RGB, PixelFormat::YUV420P, PixelFormat::NV12],
        }
    }
}

/// 画面在窗口中的显示区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 渲染器：刷新循环在自己的线程里持有它
pub trait Renderer: Send {
    /// 刷新线程启动时查询一次，超出能力的画面不会上传
    fn capabilities(&self) -> DisplayCapabilities;

    /// 第一帧到来时按视频尺寸创建显示表面
    fn create_surface(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()>;

    /// 视频尺寸变化
    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()>;

    /// 当前显示表面大小
    fn surface_size(&self) -> (u32, u32);

    /// 上传新画面（每帧只调用一次）
    fn upload_frame(&mut self, frame: &Frame) -> Result<()>;

    /// 显示最近上传的画面（可叠加字幕），暂停重绘时也会调用
    fn present(&mut self, rect: DisplayRect, subtitle: Option<&SubtitleCue>) -> Result<()>;
}

/// 按采样宽高比计算居中的显示区域（宽高对齐到偶数）
pub fn calculate_display_rect(
    surface_width: u32,
    surface_height: u32,
    picture_width: u32,
    picture_height: u32,
    sample_aspect_ratio: Option<Rational>,
) -> DisplayRect {
    if picture_width == 0 || picture_height == 0 || surface_width == 0 || surface_height == 0 {
        return DisplayRect {
            x: 0,
            y: 0,
            width: surface_width.max(1),
            height: surface_height.max(1),
        };
    }
    let sar = sample_aspect_ratio
        .and_then(|r| r.to_f64())
        .filter(|r| *r > 0.0)
        .unwrap_or(1.0);
    let aspect = sar * picture_width as f64 / picture_height as f64;

    let mut height = surface_height as u64;
    let mut width = ((height as f64 * aspect).round() as u64) & !1;
    if width > surface_width as u64 {
        width = surface_width as u64;
        height = ((width as f64 / aspect).round() as u64) & !1;
    }
    let x = (surface_width as u64 - width) / 2;
    let y = (surface_height as u64).saturating_sub(height) / 2;
    DisplayRect {
        x: x as u32,
        y: y as u32,
        width: width.max(1) as u32,
        height: height.max(1) as u32,
    }
}

/// 渲染记录（供测试和命令行统计）
#[derive(Debug, Default, Clone)]
pub struct RenderLog {
    /// 每次上传的 (pts, serial)
    pub uploads: Vec<(Option<f64>, u64)>,
    pub presents: usize,
    pub surface: Option<(u32, u32)>,
    pub resizes: usize,
    pub last_rect: Option<DisplayRect>,
    pub last_subtitle: Option<String>,
}

/// 不输出任何画面的渲染器，只记录收到的帧
#[derive(Clone)]
pub struct NullRenderer {
    surface_size: (u32, u32),
    capabilities: DisplayCapabilities,
    log: Arc<Mutex<RenderLog>>,
}

impl NullRenderer {
    pub fn new(surface_width: u32, surface_height: u32) -> Self {
        Self {
            surface_size: (surface_width, surface_height),
            capabilities: DisplayCapabilities::default(),
            log: Arc::new(Mutex::new(RenderLog::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: DisplayCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// 共享记录句柄（渲染器移交给刷新线程后仍可查看）
    pub fn log(&self) -> Arc<Mutex<RenderLog>> {
        self.log.clone()
    }
}

impl Default for NullRenderer {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl Renderer for NullRenderer {
    fn capabilities(&self) -> DisplayCapabilities {
        self.capabilities.clone()
    }

    fn create_surface(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        debug!("创建显示表面: {}x{} {:?}", width, height, format);
        self.log.lock().surface = Some((width, height));
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        let mut log = self.log.lock();
        log.surface = Some((width, height));
        log.resizes += 1;
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    fn upload_frame(&mut self, frame: &Frame) -> Result<()> {
        self.log.lock().uploads.push((frame.pts, frame.serial));
        Ok(())
    }

    fn present(&mut self, rect: DisplayRect, subtitle: Option<&SubtitleCue>) -> Result<()> {
        let mut log = self.log.lock();
        log.presents += 1;
        log.last_rect = Some(rect);
        log.last_subtitle = subtitle.map(|s| s.text.clone());
        Ok(())
    }
}
