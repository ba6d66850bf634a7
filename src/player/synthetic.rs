use crate::core::{
    wall_time, AudioSamples, Chapter, FramePayload, MediaType, Packet, PixelFormat, PlayerError, RawFrame, Rational,
    Result, SeekTarget, StreamInfo, SubtitleCue, VideoPicture,
};
use crate::player::demuxer_source::{DecodeStatus, InterruptFlag, MediaSource, ReadOutcome, SendStatus, StreamDecoder};
use log::{debug, info};
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

/// 合成源 URL 前缀
pub const SCHEME: &str = "synthetic://";

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const SUBTITLE_TIME_BASE: Rational = Rational::new(1, 1000);
const AUDIO_FRAME_SAMPLES: i64 = 1024;
const SUBTITLE_INTERVAL: f64 = 2.0;
const SUBTITLE_DISPLAY: f64 = 1.5;

/// 合成源参数（从 URL 查询串解析）
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub duration: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub video: bool,
    pub audio: bool,
    pub subtitles: bool,
    pub realtime: bool,
    pub chapters: u32,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            duration: 60.0,
            fps: 25,
            width: 320,
            height: 240,
            sample_rate: 48_000,
            channels: 2,
            video: true,
            audio: true,
            subtitles: false,
            realtime: false,
            chapters: 0,
        }
    }
}

impl SyntheticParams {
    /// 解析 `synthetic://名称?duration=10&fps=25&audio=0...`
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| PlayerError::SourceOpen(format!("不是合成源: {}", url)))?;
        let mut params = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(params);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
            let bad = || PlayerError::SourceOpen(format!("合成源参数无效: {}={}", key, value));
            let flag = |v: &str| matches!(v, "1" | "true" | "yes");
            match key {
                "duration" => params.duration = value.parse().map_err(|_| bad())?,
                "fps" => params.fps = value.parse().map_err(|_| bad())?,
                "width" => params.width = value.parse().map_err(|_| bad())?,
                "height" => params.height = value.parse().map_err(|_| bad())?,
                "sample_rate" => params.sample_rate = value.parse().map_err(|_| bad())?,
                "channels" => params.channels = value.parse().map_err(|_| bad())?,
                "video" => params.video = flag(value),
                "audio" => params.audio = flag(value),
                "subtitles" => params.subtitles = flag(value),
                "realtime" => params.realtime = flag(value),
                "chapters" => params.chapters = value.parse().map_err(|_| bad())?,
                _ => return Err(bad()),
            }
        }
        if params.duration <= 0.0 || params.fps == 0 || params.sample_rate == 0 || params.channels == 0 {
            return Err(PlayerError::SourceOpen(format!("合成源参数无效: {}", url)));
        }
        Ok(params)
    }
}

/// 下一个待产生的包位置
#[derive(Debug, Clone, Copy)]
struct Cursor {
    video_frame: i64,
    audio_sample: i64,
    subtitle_index: i64,
}

/// 内置合成媒体源：灰度渐变画面 + 正弦波音频 + 周期字幕
pub struct SyntheticSource {
    url: String,
    params: SyntheticParams,
    streams: Vec<StreamInfo>,
    cursor: Cursor,
    interrupt: InterruptFlag,
    /// 实时源：墙上时间零点对应的媒体时间
    realtime_anchor: Option<(f64, f64)>,
}

impl SyntheticSource {
    pub fn open(url: &str, interrupt: InterruptFlag) -> Result<Self> {
        let params = SyntheticParams::parse(url)?;
        let mut streams = Vec::new();
        if params.video {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: MediaType::Video,
                codec_name: "synthetic-gray".to_string(),
                time_base: VIDEO_TIME_BASE,
                frame_rate: Some(Rational::new(params.fps as i32, 1)),
                width: params.width,
                height: params.height,
                sample_aspect_ratio: Some(Rational::new(1, 1)),
                sample_rate: 0,
                channels: 0,
                is_attached_pic: false,
            });
        }
        if params.audio {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: MediaType::Audio,
                codec_name: "synthetic-sine".to_string(),
                time_base: Rational::new(1, params.sample_rate as i32),
                frame_rate: None,
                width: 0,
                height: 0,
                sample_aspect_ratio: None,
                sample_rate: params.sample_rate,
                channels: params.channels,
                is_attached_pic: false,
            });
        }
        if params.subtitles {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: MediaType::Subtitle,
                codec_name: "synthetic-text".to_string(),
                time_base: SUBTITLE_TIME_BASE,
                frame_rate: None,
                width: 0,
                height: 0,
                sample_aspect_ratio: None,
                sample_rate: 0,
                channels: 0,
                is_attached_pic: false,
            });
        }
        if streams.is_empty() {
            return Err(PlayerError::NoStreams);
        }
        info!("🧪 打开合成源: {} ({:?})", url, params);
        Ok(Self {
            url: url.to_string(),
            params,
            streams,
            cursor: Cursor {
                video_frame: 0,
                audio_sample: 0,
                subtitle_index: 0,
            },
            interrupt,
            realtime_anchor: None,
        })
    }

    fn stream_of(&self, kind: MediaType) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    fn video_pts(&self) -> Option<f64> {
        self.stream_of(MediaType::Video)
            .map(|_| self.cursor.video_frame as f64 / self.params.fps as f64)
    }

    fn audio_pts(&self) -> Option<f64> {
        self.stream_of(MediaType::Audio)
            .map(|_| self.cursor.audio_sample as f64 / self.params.sample_rate as f64)
    }

    fn subtitle_pts(&self) -> Option<f64> {
        self.stream_of(MediaType::Subtitle)
            .map(|_| self.cursor.subtitle_index as f64 * SUBTITLE_INTERVAL)
    }

    /// 实时源按墙上时间发包
    fn pace(&mut self, pts: f64) -> Result<()> {
        let (wall0, media0) = *self.realtime_anchor.get_or_insert((wall_time(), pts));
        loop {
            if self.interrupt.is_raised() {
                return Err(PlayerError::Other("读取被中断".to_string()));
            }
            let wait = (pts - media0) - (wall_time() - wall0);
            if wait <= 0.0 {
                return Ok(());
            }
            thread::sleep(Duration::from_secs_f64(wait.min(0.005)));
        }
    }

    fn make_packet(&self, stream: &StreamInfo, ts: i64, duration: i64, data: Vec<u8>) -> Packet {
        Packet {
            stream_index: stream.index,
            pos: Some(ts.max(0) * 8),
            data,
            pts: Some(ts),
            dts: Some(ts),
            duration,
            time_base: stream.time_base,
            is_keyframe: true,
        }
    }
}

impl MediaSource for SyntheticSource {
    fn description(&self) -> String {
        format!("Synthetic: {}", self.url)
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if self.interrupt.is_raised() {
            return Err(PlayerError::Other("读取被中断".to_string()));
        }
        let duration = self.params.duration;
        let candidates = [
            (MediaType::Video, self.video_pts()),
            (MediaType::Audio, self.audio_pts()),
            (MediaType::Subtitle, self.subtitle_pts()),
        ];
        let next = candidates
            .iter()
            .filter_map(|(kind, pts)| pts.filter(|p| *p < duration).map(|p| (*kind, p)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let Some((kind, pts)) = next else {
            return Ok(ReadOutcome::Eof);
        };
        if self.params.realtime {
            self.pace(pts)?;
        }

        let Some(stream) = self.stream_of(kind).cloned() else {
            return Ok(ReadOutcome::Eof);
        };
        let packet = match kind {
            MediaType::Video => {
                let index = self.cursor.video_frame;
                self.cursor.video_frame += 1;
                let ts = (pts * 90_000.0).round() as i64;
                let dur = (90_000 / self.params.fps) as i64;
                self.make_packet(&stream, ts, dur, index.to_le_bytes().to_vec())
            }
            MediaType::Audio => {
                let start = self.cursor.audio_sample;
                self.cursor.audio_sample += AUDIO_FRAME_SAMPLES;
                self.make_packet(&stream, start, AUDIO_FRAME_SAMPLES, start.to_le_bytes().to_vec())
            }
            MediaType::Subtitle => {
                let index = self.cursor.subtitle_index;
                self.cursor.subtitle_index += 1;
                let ts = (pts * 1000.0).round() as i64;
                self.make_packet(&stream, ts, (SUBTITLE_DISPLAY * 1000.0) as i64, index.to_le_bytes().to_vec())
            }
        };
        Ok(ReadOutcome::Packet(packet))
    }

    fn seek(&mut self, target: SeekTarget) -> Result<()> {
        let pos = target.target.clamp(0.0, self.params.duration);
        // 每个视频帧都是关键帧：定位到不晚于目标的那一帧
        let fps = self.params.fps as f64;
        let mut frame = (pos * fps + 1e-9).floor();
        if frame / fps < target.min {
            frame = (target.min * fps).ceil();
        }
        self.cursor.video_frame = frame as i64;
        self.cursor.audio_sample =
            (pos * self.params.sample_rate as f64 / AUDIO_FRAME_SAMPLES as f64).floor() as i64 * AUDIO_FRAME_SAMPLES;
        self.cursor.subtitle_index = (pos / SUBTITLE_INTERVAL).floor() as i64;
        self.realtime_anchor = None;
        debug!("合成源定位到 {:.3}s（视频帧 #{}）", pos, self.cursor.video_frame);
        Ok(())
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn StreamDecoder>> {
        let stream = self
            .stream(stream_index)
            .ok_or_else(|| PlayerError::Decode(format!("流 {} 不存在", stream_index)))?;
        Ok(match stream.kind {
            MediaType::Video => Box::new(SyntheticDecoder::video(stream.width, stream.height)),
            MediaType::Audio => Box::new(SyntheticDecoder::audio(stream.sample_rate, stream.channels)),
            MediaType::Subtitle => Box::new(SyntheticDecoder::subtitle()),
        })
    }

    fn duration(&self) -> Option<f64> {
        if self.params.realtime {
            None
        } else {
            Some(self.params.duration)
        }
    }

    fn is_realtime(&self) -> bool {
        self.params.realtime
    }

    fn is_seekable(&self) -> bool {
        !self.params.realtime
    }

    fn chapters(&self) -> Vec<Chapter> {
        let n = self.params.chapters;
        let len = self.params.duration / n.max(1) as f64;
        (0..n)
            .map(|i| Chapter {
                start: i as f64 * len,
                end: (i + 1) as f64 * len,
                title: format!("第 {} 章", i + 1),
            })
            .collect()
    }
}

enum SyntheticKind {
    Video { width: u32, height: u32 },
    Audio { sample_rate: u32, channels: u16 },
    Subtitle,
}

/// 合成解码器：一包一帧，送入 None 后排空
pub struct SyntheticDecoder {
    kind: SyntheticKind,
    out: VecDeque<RawFrame>,
    draining: bool,
}

impl SyntheticDecoder {
    fn new(kind: SyntheticKind) -> Self {
        Self {
            kind,
            out: VecDeque::new(),
            draining: false,
        }
    }

    pub fn video(width: u32, height: u32) -> Self {
        Self::new(SyntheticKind::Video { width, height })
    }

    pub fn audio(sample_rate: u32, channels: u16) -> Self {
        Self::new(SyntheticKind::Audio { sample_rate, channels })
    }

    pub fn subtitle() -> Self {
        Self::new(SyntheticKind::Subtitle)
    }

    fn payload_index(packet: &Packet) -> Result<i64> {
        let bytes: [u8; 8] = packet
            .data
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PlayerError::Decode(format!("合成包长度错误: {}", packet.data.len())))?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn decode(&self, packet: &Packet) -> Result<FramePayload> {
        let index = Self::payload_index(packet)?;
        Ok(match self.kind {
            SyntheticKind::Video { width, height } => {
                let gray = (index % 256) as u8;
                let mut data = vec![gray; width as usize * height as usize * 4];
                for alpha in data.iter_mut().skip(3).step_by(4) {
                    *alpha = 0xFF;
                }
                FramePayload::Video(VideoPicture {
                    width,
                    height,
                    format: PixelFormat::RGBA,
                    sample_aspect_ratio: Some(Rational::new(1, 1)),
                    data,
                })
            }
            SyntheticKind::Audio { sample_rate, channels } => {
                let mut data = Vec::with_capacity(AUDIO_FRAME_SAMPLES as usize * channels as usize);
                for n in 0..AUDIO_FRAME_SAMPLES {
                    let t = (index + n) as f64 / sample_rate as f64;
                    let value = (0.2 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as f32;
                    data.extend(std::iter::repeat(value).take(channels as usize));
                }
                FramePayload::Audio(AudioSamples {
                    sample_rate,
                    channels,
                    data,
                })
            }
            SyntheticKind::Subtitle => FramePayload::Subtitle(SubtitleCue {
                start_display: 0.0,
                end_display: SUBTITLE_DISPLAY,
                text: format!("字幕 #{}", index + 1),
            }),
        })
    }
}

impl StreamDecoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        if self.out.len() >= 4 {
            return Ok(SendStatus::Again);
        }
        let payload = self.decode(packet)?;
        self.out.push_back(RawFrame {
            payload,
            pts: packet.pts,
            pos: packet.pos,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus> {
        match self.out.pop_front() {
            Some(frame) => Ok(DecodeStatus::Frame(frame)),
            None if self.draining => Ok(DecodeStatus::Eof),
            None => Ok(DecodeStatus::NeedMore),
        }
    }

    fn flush(&mut self) {
        self.out.clear();
        self.draining = false;
    }

    fn description(&self) -> String {
        match self.kind {
            SyntheticKind::Video { width, height } => format!("synthetic video {}x{}", width, height),
            SyntheticKind::Audio { sample_rate, channels } => format!("synthetic audio {}Hz/{}ch", sample_rate, channels),
            SyntheticKind::Subtitle => "synthetic subtitle".to_string(),
        }
    }
}
