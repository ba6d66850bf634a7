//! FFmpeg 媒体源（需启用 `ffmpeg` 特性）

use crate::core::{
    AudioSamples, Chapter, FramePayload, MediaType, Packet, PixelFormat, PlayerError, RawFrame, Rational, Result,
    SeekTarget, StreamInfo, SubtitleCue, VideoPicture,
};
use crate::player::demuxer_source::{DecodeStatus, InterruptFlag, MediaSource, ReadOutcome, SendStatus, StreamDecoder};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info};
use std::sync::Once;

static FFMPEG_INIT: Once = Once::new();

fn ensure_init() -> Result<()> {
    let mut result = Ok(());
    FFMPEG_INIT.call_once(|| {
        result = ffmpeg::init().map_err(|e| PlayerError::SourceOpen(format!("FFmpeg 初始化失败: {}", e)));
        if result.is_ok() {
            info!("✅ FFmpeg 初始化成功");
        }
    });
    result
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn is_eagain(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == util::error::EAGAIN)
}

/// 秒 → AV_TIME_BASE（微秒），无穷大映射到 i64 边界
fn to_av_time(seconds: f64) -> i64 {
    if seconds == f64::INFINITY {
        i64::MAX
    } else if seconds == f64::NEG_INFINITY {
        i64::MIN
    } else {
        (seconds * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64
    }
}

/// 解封装器 - 负责读取媒体文件并分离音视频流
pub struct Demuxer {
    input_ctx: format::context::Input,
    streams: Vec<StreamInfo>,
    source_path: String,
    realtime: bool,
}

// AVFormatContext 只被读线程持有
unsafe impl Send for Demuxer {}

impl Demuxer {
    /// 打开媒体文件或网络流；`interrupt` 置位后阻塞的 IO 会尽快返回
    pub fn open(path: &str, interrupt: InterruptFlag) -> Result<Self> {
        ensure_init()?;
        info!("正在打开: {}", path);

        let flag = interrupt.clone();
        let input_ctx = format::input_with_interrupt(&path, move || flag.is_raised())
            .map_err(|e| PlayerError::SourceOpen(format!("无法打开 {}: {}", path, e)))?;

        let mut streams = Vec::new();
        for stream in input_ctx.streams() {
            let params = stream.parameters();
            let kind = match params.medium() {
                media::Type::Video => MediaType::Video,
                media::Type::Audio => MediaType::Audio,
                media::Type::Subtitle => MediaType::Subtitle,
                _ => continue,
            };
            let codec_name = params.id().name().to_string();
            let mut info = StreamInfo {
                index: stream.index(),
                kind,
                codec_name,
                time_base: rational(stream.time_base()),
                frame_rate: None,
                width: 0,
                height: 0,
                sample_aspect_ratio: None,
                sample_rate: 0,
                channels: 0,
                is_attached_pic: stream
                    .disposition()
                    .contains(format::stream::Disposition::ATTACHED_PIC),
            };
            let context = codec::context::Context::from_parameters(params)?;
            match kind {
                MediaType::Video => {
                    let video = context.decoder().video()?;
                    info.width = video.width();
                    info.height = video.height();
                    let sar = video.aspect_ratio();
                    info.sample_aspect_ratio = (sar.numerator() > 0).then(|| rational(sar));
                    let fps = stream.avg_frame_rate();
                    info.frame_rate = (fps.numerator() > 0 && fps.denominator() > 0).then(|| rational(fps));
                }
                MediaType::Audio => {
                    let audio = context.decoder().audio()?;
                    info.sample_rate = audio.rate();
                    info.channels = audio.channels();
                }
                MediaType::Subtitle => {}
            }
            debug!("流 #{}: {:?}", info.index, info);
            streams.push(info);
        }
        if !streams.iter().any(|s| s.kind != MediaType::Subtitle) {
            return Err(PlayerError::NoStreams);
        }

        let format_name = input_ctx.format().name().to_string();
        let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || path.starts_with("rtp:")
            || path.starts_with("udp:");
        if realtime {
            info!("🌐 实时流: {}", format_name);
        }

        Ok(Self {
            input_ctx,
            streams,
            source_path: path.to_string(),
            realtime,
        })
    }

    fn stream_info(&self, index: usize) -> Result<&StreamInfo> {
        self.stream(index)
            .ok_or_else(|| PlayerError::Other(format!("流 #{} 不存在", index)))
    }
}

impl MediaSource for Demuxer {
    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input_ctx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(ReadOutcome::Eof),
            Err(e) => return Err(e.into()),
        }
        let stream_index = packet.stream();
        let time_base = self
            .streams
            .iter()
            .find(|s| s.index == stream_index)
            .map_or(Rational::new(0, 1), |s| s.time_base);
        Ok(ReadOutcome::Packet(Packet {
            stream_index,
            data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            pos: (packet.position() >= 0).then(|| packet.position() as i64),
            time_base,
            is_keyframe: packet.is_key(),
        }))
    }

    fn seek(&mut self, target: SeekTarget) -> Result<()> {
        let ts = to_av_time(target.target);
        let min = to_av_time(target.min);
        let max = to_av_time(target.max);
        self.input_ctx
            .seek(ts, min..max)
            .map_err(|e| PlayerError::Seek(format!("{}: {}", self.source_path, e)))
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn StreamDecoder>> {
        let info = self.stream_info(stream_index)?.clone();
        let stream = self
            .input_ctx
            .stream(stream_index)
            .ok_or_else(|| PlayerError::Other(format!("流 #{} 不存在", stream_index)))?;
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder: Box<dyn StreamDecoder> = match info.kind {
            MediaType::Video => Box::new(FfmpegVideoDecoder {
                decoder: context.decoder().video()?,
                scaler: None,
                time_base: info.time_base,
            }),
            MediaType::Audio => Box::new(FfmpegAudioDecoder {
                decoder: context.decoder().audio()?,
                resampler: None,
                time_base: info.time_base,
            }),
            MediaType::Subtitle => Box::new(FfmpegSubtitleDecoder {
                decoder: context.decoder().subtitle()?,
                time_base: info.time_base,
                pending: None,
                draining: false,
            }),
        };
        Ok(decoder)
    }

    fn duration(&self) -> Option<f64> {
        let duration = self.input_ctx.duration();
        (duration > 0 && duration != ffmpeg::ffi::AV_NOPTS_VALUE)
            .then(|| duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
    }

    fn start_time(&self) -> f64 {
        let start = unsafe { (*self.input_ctx.as_ptr()).start_time };
        if start == ffmpeg::ffi::AV_NOPTS_VALUE {
            0.0
        } else {
            start as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        }
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn has_timestamp_discontinuities(&self) -> bool {
        self.input_ctx.format().flags().contains(format::Flags::TS_DISCONT)
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.input_ctx
            .chapters()
            .map(|chapter| {
                let tb = rational(chapter.time_base());
                Chapter {
                    start: tb.ts_to_seconds(chapter.start()).unwrap_or(0.0),
                    end: tb.ts_to_seconds(chapter.end()).unwrap_or(0.0),
                    title: chapter.metadata().get("title").unwrap_or_default().to_string(),
                }
            })
            .collect()
    }

    fn read_pause(&mut self) -> Result<()> {
        self.input_ctx.pause()?;
        Ok(())
    }

    fn read_play(&mut self) -> Result<()> {
        self.input_ctx.play()?;
        Ok(())
    }
}

/// 把队列中的包还原为 FFmpeg 包
fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut pkt = ffmpeg::Packet::copy(&packet.data);
    pkt.set_pts(packet.pts);
    pkt.set_dts(packet.dts);
    pkt.set_duration(packet.duration);
    if packet.is_keyframe {
        pkt.set_flags(codec::packet::Flags::KEY);
    }
    pkt
}

fn send_to(decoder: &mut codec::decoder::Opened, packet: Option<&Packet>) -> Result<SendStatus> {
    let result = match packet {
        Some(packet) => decoder.send_packet(&to_ffmpeg_packet(packet)),
        None => decoder.send_eof(),
    };
    match result {
        Ok(()) | Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
        Err(e) if is_eagain(&e) => Ok(SendStatus::Again),
        Err(e) => Err(PlayerError::Decode(e.to_string())),
    }
}

/// 软件视频解码器，输出 RGBA
struct FfmpegVideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
    time_base: Rational,
}

// SwsContext 本身不是 Send，但每个解码器实例只在自己的解码线程中使用
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn convert_frame(&mut self, frame: &util::frame::Video) -> Result<VideoPicture> {
        let (width, height, format) = (frame.width(), frame.height(), frame.format());
        let stale = !matches!(&self.scaler, Some((_, f, w, h)) if *f == format && *w == width && *h == height);
        if stale {
            debug!("初始化视频缩放器: {:?} {}x{} → RGBA", format, width, height);
            let scaler = software::scaling::Context::get(
                format,
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, format, width, height));
        }
        let Some((scaler, ..)) = self.scaler.as_mut() else {
            return Err(PlayerError::Decode("缩放器未初始化".to_string()));
        };

        let mut rgba_frame = util::frame::Video::empty();
        scaler.run(frame, &mut rgba_frame)?;

        // 按行复制去掉 stride 填充
        let row_size = width as usize * 4;
        let stride = rgba_frame.stride(0);
        let src = rgba_frame.data(0);
        let mut data = Vec::with_capacity(row_size * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&src[y * stride..y * stride + row_size]);
        }

        let sar = frame.aspect_ratio();
        Ok(VideoPicture {
            width,
            height,
            format: PixelFormat::RGBA,
            sample_aspect_ratio: (sar.numerator() > 0).then(|| rational(sar)),
            data,
        })
    }
}

impl StreamDecoder for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
        send_to(&mut self.decoder, packet)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus> {
        let mut decoded = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                let picture = self.convert_frame(&decoded)?;
                Ok(DecodeStatus::Frame(RawFrame {
                    payload: FramePayload::Video(picture),
                    pts: decoded.timestamp(),
                    pos: None,
                }))
            }
            Err(ffmpeg::Error::Eof) => Ok(DecodeStatus::Eof),
            Err(e) if is_eagain(&e) => Ok(DecodeStatus::NeedMore),
            Err(e) => Err(PlayerError::Decode(e.to_string())),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("FFmpeg 软件视频解码 (tb {}/{})", self.time_base.num, self.time_base.den)
    }
}

/// 音频解码器，输出源采样率的交错 f32（多于两声道时混成立体声）
struct FfmpegAudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: Rational,
}

// SwrContext 同上，只在解码线程中使用
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn convert_frame(&mut self, frame: &util::frame::Audio) -> Result<AudioSamples> {
        let rate = frame.rate();
        let in_channels = frame.channels();
        let out_channels: u16 = if in_channels == 1 { 1 } else { 2 };
        if self.resampler.is_none() {
            let target_layout = if out_channels == 1 {
                util::channel_layout::ChannelLayout::MONO
            } else {
                util::channel_layout::ChannelLayout::STEREO
            };
            let mut source_layout = frame.channel_layout();
            if source_layout.is_empty() {
                source_layout = util::channel_layout::ChannelLayout::default(i32::from(in_channels));
            }
            debug!("🔧 初始化音频转换器: {}Hz/{}ch → f32/{}ch", rate, in_channels, out_channels);
            self.resampler = Some(software::resampling::Context::get(
                frame.format(),
                source_layout,
                rate,
                util::format::Sample::F32(util::format::sample::Type::Packed),
                target_layout,
                rate,
            )?);
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(PlayerError::Decode("音频转换器未初始化".to_string()));
        };

        let mut converted = util::frame::Audio::empty();
        resampler.run(frame, &mut converted)?;

        let len = converted.samples() * out_channels as usize;
        let data = converted.data(0)[..len * 4]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(AudioSamples {
            sample_rate: rate,
            channels: out_channels,
            data,
        })
    }
}

impl StreamDecoder for FfmpegAudioDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
        send_to(&mut self.decoder, packet)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus> {
        let mut decoded = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                let samples = self.convert_frame(&decoded)?;
                Ok(DecodeStatus::Frame(RawFrame {
                    payload: FramePayload::Audio(samples),
                    pts: decoded.timestamp(),
                    pos: None,
                }))
            }
            Err(ffmpeg::Error::Eof) => Ok(DecodeStatus::Eof),
            Err(e) if is_eagain(&e) => Ok(DecodeStatus::NeedMore),
            Err(e) => Err(PlayerError::Decode(e.to_string())),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.resampler = None;
    }

    fn description(&self) -> String {
        format!("FFmpeg 音频解码 (tb {}/{})", self.time_base.num, self.time_base.den)
    }
}

/// 文本字幕解码器（位图字幕跳过）
struct FfmpegSubtitleDecoder {
    decoder: codec::decoder::Subtitle,
    time_base: Rational,
    pending: Option<RawFrame>,
    draining: bool,
}

// AVCodecContext 只在字幕解码线程中使用
unsafe impl Send for FfmpegSubtitleDecoder {}

impl StreamDecoder for FfmpegSubtitleDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        if self.pending.is_some() {
            return Ok(SendStatus::Again);
        }
        let mut subtitle = codec::subtitle::Subtitle::default();
        let got = self
            .decoder
            .decode(&to_ffmpeg_packet(packet), &mut subtitle)
            .map_err(|e| PlayerError::Decode(e.to_string()))?;
        if !got {
            return Ok(SendStatus::Accepted);
        }

        let mut text = String::new();
        for rect in subtitle.rects() {
            match rect {
                codec::subtitle::Rect::Text(t) => text.push_str(t.get()),
                codec::subtitle::Rect::Ass(a) => text.push_str(a.get()),
                _ => debug!("跳过位图字幕（当前仅支持文本字幕）"),
            }
        }
        let cue = SubtitleCue {
            start_display: f64::from(subtitle.start()) / 1000.0,
            end_display: if subtitle.end() > 0 {
                f64::from(subtitle.end()) / 1000.0
            } else {
                3.0
            },
            text,
        };
        // 必须手动释放 AVSubtitle，否则泄漏
        unsafe {
            ffmpeg::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }
        if cue.text.trim().is_empty() {
            return Ok(SendStatus::Accepted);
        }
        self.pending = Some(RawFrame {
            payload: FramePayload::Subtitle(cue),
            pts: packet.pts,
            pos: packet.pos,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus> {
        match self.pending.take() {
            Some(frame) => Ok(DecodeStatus::Frame(frame)),
            None if self.draining => {
                self.draining = false;
                Ok(DecodeStatus::Eof)
            }
            None => Ok(DecodeStatus::NeedMore),
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("FFmpeg 文本字幕解码 (tb {}/{})", self.time_base.num, self.time_base.den)
    }
}
