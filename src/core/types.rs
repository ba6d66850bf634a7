use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// 媒体流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "视频",
            MediaType::Audio => "音频",
            MediaType::Subtitle => "字幕",
        }
    }
}

/// 有理数时间基（与容器时间基一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 转换为浮点数；分母为 0 时返回 None
    pub fn to_f64(self) -> Option<f64> {
        if self.den == 0 || self.num == 0 {
            None
        } else {
            Some(self.num as f64 / self.den as f64)
        }
    }

    /// 把以该时间基表示的时间戳换算为秒
    pub fn ts_to_seconds(self, ts: i64) -> Option<f64> {
        self.to_f64().map(|tb| ts as f64 * tb)
    }
}

/// 压缩数据包（由解封装协作方产生）
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Vec<u8>,
    /// 显示时间戳（流时间基）
    pub pts: Option<i64>,
    /// 解码时间戳（流时间基）
    pub dts: Option<i64>,
    /// 持续时间（流时间基），未知时为 0
    pub duration: i64,
    /// 在源中的字节位置
    pub pos: Option<i64>,
    pub time_base: Rational,
    pub is_keyframe: bool,
}

impl Packet {
    /// 以秒为单位的显示时间戳（无 pts 时回退到 dts）
    pub fn pts_seconds(&self) -> Option<f64> {
        self.pts
            .or(self.dts)
            .and_then(|ts| self.time_base.ts_to_seconds(ts))
    }

    /// 队列字节统计使用的大小
    pub fn byte_size(&self) -> usize {
        self.data.len() + std::mem::size_of::<Packet>()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.time_base
            .ts_to_seconds(self.duration)
            .unwrap_or(0.0)
    }
}

/// 流描述（open 后由媒体源报告）
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaType,
    pub codec_name: String,
    pub time_base: Rational,
    /// 平均帧率（视频）
    pub frame_rate: Option<Rational>,
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Option<Rational>,
    pub sample_rate: u32,
    pub channels: u16,
    /// 封面图片流（只有一个包，不参与背压）
    pub is_attached_pic: bool,
}

impl StreamInfo {
    /// 视频帧的名义时长（秒）
    pub fn frame_duration(&self) -> Option<f64> {
        self.frame_rate
            .and_then(|r| r.to_f64())
            .filter(|fps| *fps > 0.0)
            .map(|fps| 1.0 / fps)
    }
}

/// 章节
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub start: f64,
    pub end: f64,
    pub title: String,
}

/// Seek 目标（秒），`min..=max` 为允许落点范围
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekTarget {
    pub target: f64,
    pub min: f64,
    pub max: f64,
}

impl SeekTarget {
    /// 根据目标位置与相对偏移构造落点范围：
    /// 向前 seek 时不允许落在当前位置之前，向后 seek 时不允许落在当前位置之后
    pub fn new(target: f64, rel: f64) -> Self {
        let min = if rel > 0.0 { target - rel + 0.002 } else { f64::NEG_INFINITY };
        let max = if rel < 0.0 { target - rel - 0.002 } else { f64::INFINITY };
        Self { target, min, max }
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> f64 {
        match self {
            PixelFormat::RGBA => 4.0,
            PixelFormat::RGB => 3.0,
            PixelFormat::YUV420P | PixelFormat::NV12 => 1.5,
        }
    }
}

/// 解码后的视频画面
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample_aspect_ratio: Option<Rational>,
    pub data: Vec<u8>,
}

/// 解码后的音频数据（交错 f32）
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

impl AudioSamples {
    /// 每声道采样数
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 解码后的字幕
#[derive(Debug, Clone)]
pub struct SubtitleCue {
    /// 相对帧 pts 的开始显示时间（秒）
    pub start_display: f64,
    /// 相对帧 pts 的结束显示时间（秒）
    pub end_display: f64,
    pub text: String,
}

/// 帧载荷
#[derive(Debug, Clone)]
pub enum FramePayload {
    Video(VideoPicture),
    Audio(AudioSamples),
    Subtitle(SubtitleCue),
}

/// 解码器直接产出的原始帧（时间戳仍为流时间基）
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: FramePayload,
    /// 解码器报告的时间戳（流时间基），可能缺失
    pub pts: Option<i64>,
    pub pos: Option<i64>,
}

/// 帧队列中的帧
///
/// 由解码线程创建，刷新循环/音频回调消费后释放。
/// `serial` 与对应包队列的当前 serial 不一致时视为过期帧直接丢弃。
#[derive(Debug)]
pub struct Frame {
    pub payload: FramePayload,
    /// 显示时间戳（秒）
    pub pts: Option<f64>,
    /// 持续时间（秒）
    pub duration: f64,
    /// 在源中的字节位置
    pub pos: Option<i64>,
    pub serial: u64,
    uploaded: AtomicBool,
}

impl Frame {
    pub fn new(payload: FramePayload, pts: Option<f64>, duration: f64, pos: Option<i64>, serial: u64) -> Self {
        Self {
            payload,
            pts,
            duration,
            pos,
            serial,
            uploaded: AtomicBool::new(false),
        }
    }

    pub fn video(&self) -> Option<&VideoPicture> {
        match &self.payload {
            FramePayload::Video(p) => Some(p),
            _ => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioSamples> {
        match &self.payload {
            FramePayload::Audio(a) => Some(a),
            _ => None,
        }
    }

    pub fn subtitle(&self) -> Option<&SubtitleCue> {
        match &self.payload {
            FramePayload::Subtitle(s) => Some(s),
            _ => None,
        }
    }

    /// (宽, 高)；非视频帧返回 (0, 0)
    pub fn dimensions(&self) -> (u32, u32) {
        self.video().map(|p| (p.width, p.height)).unwrap_or((0, 0))
    }

    pub fn byte_size(&self) -> usize {
        let payload = match &self.payload {
            FramePayload::Video(p) => p.data.len(),
            FramePayload::Audio(a) => a.data.len() * std::mem::size_of::<f32>(),
            FramePayload::Subtitle(s) => s.text.len(),
        };
        payload + std::mem::size_of::<Frame>()
    }

    /// 是否已经上传到渲染器
    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn mark_uploaded(&self) {
        self.uploaded.store(true, Ordering::Release);
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Running,
    Paused,
    /// 暂停状态下的单帧步进
    Stepping,
    Stopped,
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    /// 总时长（秒），未知为 None（直播流）
    pub duration: Option<f64>,
    pub start_time: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_realtime: bool,
}

/// 对外通知（替代 GUI 层的信号）
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// 错误信息
    Error(String),
    /// 视频宽高发生变化
    FrameDimensionsChanged(u32, u32),
    /// 视频总时长（秒）
    TotalDuration(f64),
    /// 当前播放位置（秒）
    Position(f64),
    /// 音量变化
    Volume(f32),
    /// 暂停状态
    PauseState(bool),
    /// 开始播放
    Started(String),
    /// 播放到结尾（所有队列已排空）
    EndOfMedia,
    /// 停止播放
    Stopped,
    /// 停止完成（线程全部 join）
    StopFinished,
}
