use crate::core::{FrameDrop, Frame, FramePayload, MediaType, QueueError, RawFrame, Rational, Result, StreamInfo, SyncMode};
use crate::player::demuxer_source::{DecodeStatus, SendStatus, StreamDecoder};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::{PacketQueue, QueuedPacket};
use crate::player::queue::Notifier;
use crate::player::sync::SyncEngine;
use log::{debug, info, warn};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 带秒级时间戳的解码输出
#[derive(Debug)]
pub struct DecodedFrame {
    pub raw: RawFrame,
    pub pts: Option<f64>,
    pub duration: f64,
    /// 产生该帧的包所属代次
    pub serial: u64,
}

/// 单个流的解码驱动
///
/// 从包队列取包送入解码器，按代次丢弃过期包；代次变化时清空解码器。
/// 解码器没有给出时间戳时，用上一帧时间戳加上其时长推算。
pub struct Decoder {
    kind: MediaType,
    codec: Box<dyn StreamDecoder>,
    queue: Arc<PacketQueue>,
    time_base: Rational,
    /// 视频名义帧时长（由帧率得出），未知为 0
    frame_duration: f64,
    pkt_serial: u64,
    /// 解码器排空时所在的代次，0 表示尚未结束
    finished: Arc<AtomicU64>,
    pending: Option<QueuedPacket>,
    next_pts: Option<f64>,
    start_pts: Option<f64>,
    empty_queue: Arc<Notifier>,
}

impl Decoder {
    pub fn new(
        codec: Box<dyn StreamDecoder>,
        stream: &StreamInfo,
        queue: Arc<PacketQueue>,
        empty_queue: Arc<Notifier>,
    ) -> Self {
        Self {
            kind: stream.kind,
            codec,
            queue,
            time_base: stream.time_base,
            frame_duration: stream.frame_duration().unwrap_or(0.0),
            pkt_serial: 0,
            finished: Arc::new(AtomicU64::new(0)),
            pending: None,
            next_pts: None,
            start_pts: None,
            empty_queue,
        }
    }

    /// 代次切换后的时间戳推算起点（没有时间戳的音频流使用流起始时间）
    pub fn with_start_pts(mut self, start_pts: f64) -> Self {
        self.start_pts = Some(start_pts);
        self.next_pts = Some(start_pts);
        self
    }

    pub fn kind(&self) -> MediaType {
        self.kind
    }

    pub fn finished_ref(&self) -> Arc<AtomicU64> {
        self.finished.clone()
    }

    pub fn packet_queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn pkt_serial(&self) -> u64 {
        self.pkt_serial
    }

    /// 解出下一帧
    ///
    /// `Ok(None)` 表示当前代次已排空（EOF）；`Err(Aborted)` 表示队列中止，线程应退出。
    pub fn decode_frame(&mut self) -> std::result::Result<Option<DecodedFrame>, QueueError> {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return Err(QueueError::Aborted);
                    }
                    match self.codec.receive_frame() {
                        Ok(DecodeStatus::Frame(raw)) => return Ok(Some(self.stamp(raw))),
                        Ok(DecodeStatus::Eof) => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.codec.flush();
                            return Ok(None);
                        }
                        Ok(DecodeStatus::NeedMore) => break,
                        Err(e) => {
                            warn!("{}解码输出错误（已跳过）: {}", self.kind.as_str(), e);
                            break;
                        }
                    }
                }
            }

            let item = self.next_packet()?;
            let sent = match &item {
                QueuedPacket::Data(pkt) => self.codec.send_packet(Some(pkt)),
                QueuedPacket::Drain => self.codec.send_packet(None),
            };
            match sent {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Again) => {
                    // 解码器未取空就又送包：先把输出取完，再重发
                    self.pending = Some(item);
                }
                Err(e) => warn!("{}包解码失败（已跳过）: {}", self.kind.as_str(), e),
            }
        }
    }

    /// 取出下一个当前代次的包；代次变化时清空解码器
    fn next_packet(&mut self) -> std::result::Result<QueuedPacket, QueueError> {
        loop {
            if self.queue.nb_packets() == 0 {
                self.empty_queue.notify();
            }
            let item = match self.pending.take() {
                Some(item) => item,
                None => {
                    let old_serial = self.pkt_serial;
                    let entry = self.queue.get(true)?;
                    self.pkt_serial = entry.serial;
                    if old_serial != self.pkt_serial {
                        debug!("{}解码器代次切换 {} → {}，清空解码器", self.kind.as_str(), old_serial, self.pkt_serial);
                        self.codec.flush();
                        self.finished.store(0, Ordering::Release);
                        self.next_pts = self.start_pts;
                    }
                    entry.item
                }
            };
            if self.queue.serial() == self.pkt_serial {
                return Ok(item);
            }
        }
    }

    fn stamp(&mut self, raw: RawFrame) -> DecodedFrame {
        let duration = match &raw.payload {
            FramePayload::Audio(samples) if samples.sample_rate > 0 => {
                samples.nb_samples() as f64 / samples.sample_rate as f64
            }
            FramePayload::Audio(_) => 0.0,
            FramePayload::Video(_) => self.frame_duration,
            FramePayload::Subtitle(cue) => (cue.end_display - cue.start_display).max(0.0),
        };
        let pts = raw
            .pts
            .and_then(|ts| self.time_base.ts_to_seconds(ts))
            .or(self.next_pts);
        if let Some(pts) = pts {
            self.next_pts = Some(pts + duration);
        }
        DecodedFrame {
            raw,
            pts,
            duration,
            serial: self.pkt_serial,
        }
    }
}

/// 丢帧统计
#[derive(Debug, Default)]
pub struct DropStats {
    pub early: AtomicU64,
    pub late: AtomicU64,
}

/// 解码线程需要的共享句柄
#[derive(Clone)]
pub struct DecodeContext {
    pub frames: Arc<FrameQueue>,
    pub sync: Arc<SyncEngine>,
    pub frame_drop: FrameDrop,
    pub drops: Arc<DropStats>,
}

/// 解码线程（每个流一个）
pub struct DecodeWorker {
    kind: MediaType,
    finished: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn(decoder: Decoder, ctx: DecodeContext) -> Result<Self> {
        let kind = decoder.kind();
        let finished = decoder.finished_ref();
        let name = match kind {
            MediaType::Video => "video_decoder",
            MediaType::Audio => "audio_decoder",
            MediaType::Subtitle => "subtitle_decoder",
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::decode_loop(decoder, ctx))?;
        Ok(Self {
            kind,
            finished,
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> MediaType {
        self.kind
    }

    /// 解码器已排空的代次（0 = 未结束）
    pub fn finished_serial(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    pub fn finished_ref(&self) -> Arc<AtomicU64> {
        self.finished.clone()
    }

    /// 等待线程退出（调用前需先中止包队列和帧队列）
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ {}解码线程异常退出", log_ctx(), self.kind.as_str());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn decode_loop(mut decoder: Decoder, ctx: DecodeContext) {
        let kind = decoder.kind();
        info!("{} 🎞 {}解码线程启动", log_ctx(), kind.as_str());
        let mut decoded: u64 = 0;

        loop {
            let frame = match decoder.decode_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("{} 📄 {}解码器已排空", log_ctx(), kind.as_str());
                    continue;
                }
                Err(_) => break,
            };
            decoded += 1;

            if kind == MediaType::Video && Self::should_drop_early(&decoder, &ctx, &frame) {
                let drops = ctx.drops.early.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} 🗑 提前丢弃视频帧 pts={:?}（累计 {}）", log_ctx(), frame.pts, drops);
                continue;
            }

            let DecodedFrame { raw, pts, duration, serial } = frame;
            let frame = Frame::new(raw.payload, pts, duration, raw.pos, serial);
            if ctx.frames.push(frame).is_err() {
                break;
            }
        }

        info!("{} 🛑 {}解码线程退出（共解码 {} 帧）", log_ctx(), kind.as_str(), decoded);
    }

    /// 视频帧已经落后于主时钟时，在进入帧队列之前丢弃
    fn should_drop_early(decoder: &Decoder, ctx: &DecodeContext, frame: &DecodedFrame) -> bool {
        let enabled = match ctx.frame_drop {
            FrameDrop::Always => true,
            FrameDrop::Never => false,
            FrameDrop::Auto => ctx.sync.master_sync_type() != SyncMode::Video,
        };
        if !enabled {
            return false;
        }
        let (Some(pts), Some(master)) = (frame.pts, ctx.sync.get_master_clock()) else {
            return false;
        };
        let diff = pts - master;
        diff.abs() < ctx.sync.config().nosync_threshold
            && diff < 0.0
            && frame.serial == ctx.sync.vidclk.serial()
            && decoder.packet_queue().nb_packets() > 0
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("{} ⚠ {}解码线程被 drop 时仍未 join", log_ctx(), self.kind.as_str());
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AudioSamples, Packet, PlayerError};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// 一包一帧的测试解码器
    struct PassThrough {
        out: VecDeque<RawFrame>,
        draining: bool,
        flushes: Arc<AtomicUsize>,
    }

    impl StreamDecoder for PassThrough {
        fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
            match packet {
                Some(pkt) if pkt.data.first() == Some(&0xFF) => Err(PlayerError::Decode("corrupt".into())),
                Some(pkt) => {
                    self.out.push_back(RawFrame {
                        payload: FramePayload::Audio(AudioSamples {
                            sample_rate: 1000,
                            channels: 1,
                            data: vec![0.0; 20],
                        }),
                        pts: pkt.pts,
                        pos: pkt.pos,
                    });
                    Ok(SendStatus::Accepted)
                }
                None => {
                    self.draining = true;
                    Ok(SendStatus::Accepted)
                }
            }
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
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream() -> StreamInfo {
        StreamInfo {
            index: 0,
            kind: MediaType::Audio,
            codec_name: "test".into(),
            time_base: Rational::new(1, 1000),
            frame_rate: None,
            width: 0,
            height: 0,
            sample_aspect_ratio: None,
            sample_rate: 1000,
            channels: 1,
            is_attached_pic: false,
        }
    }

    fn packet(pts: Option<i64>) -> Packet {
        Packet {
            stream_index: 0,
            data: vec![1; 8],
            pts,
            dts: pts,
            duration: 20,
            pos: None,
            time_base: Rational::new(1, 1000),
            is_keyframe: true,
        }
    }

    fn setup() -> (Decoder, Arc<PacketQueue>, Arc<AtomicUsize>) {
        let queue = Arc::new(PacketQueue::new(MediaType::Audio, 100));
        queue.start();
        let flushes = Arc::new(AtomicUsize::new(0));
        let codec = PassThrough {
            out: VecDeque::new(),
            draining: false,
            flushes: flushes.clone(),
        };
        let decoder = Decoder::new(Box::new(codec), &stream(), queue.clone(), Arc::new(Notifier::new()));
        (decoder, queue, flushes)
    }

    #[test]
    fn test_frames_carry_packet_serial_and_pts() {
        let (mut decoder, queue, _) = setup();
        queue.put(packet(Some(500))).unwrap();
        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.pts, Some(0.5));
        assert_eq!(frame.serial, queue.serial());
        assert!((frame.duration - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_missing_pts_is_estimated() {
        let (mut decoder, queue, _) = setup();
        queue.put(packet(Some(1000))).unwrap();
        queue.put(packet(None)).unwrap();
        queue.put(packet(None)).unwrap();
        let pts: Vec<_> = (0..3).map(|_| decoder.decode_frame().unwrap().unwrap().pts.unwrap()).collect();
        assert!((pts[1] - 1.02).abs() < 1e-9);
        assert!((pts[2] - 1.04).abs() < 1e-9);
    }

    #[test]
    fn test_flush_discards_stale_packets_and_resets_codec() {
        let (mut decoder, queue, flushes) = setup();
        queue.put(packet(Some(0))).unwrap();
        decoder.decode_frame().unwrap().unwrap();
        let before = flushes.load(Ordering::SeqCst);

        queue.put(packet(Some(20))).unwrap();
        let new_serial = queue.flush();
        queue.put(packet(Some(30_000))).unwrap();

        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.pts, Some(30.0));
        assert_eq!(frame.serial, new_serial);
        assert_eq!(flushes.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_corrupt_packet_is_skipped() {
        let (mut decoder, queue, _) = setup();
        let mut bad = packet(Some(0));
        bad.data = vec![0xFF];
        queue.put(bad).unwrap();
        queue.put(packet(Some(40))).unwrap();
        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.pts, Some(0.04));
    }

    #[test]
    fn test_drain_marks_finished_serial() {
        let (mut decoder, queue, _) = setup();
        let finished = decoder.finished_ref();
        queue.put(packet(Some(0))).unwrap();
        queue.put_drain().unwrap();
        assert!(decoder.decode_frame().unwrap().is_some());
        assert!(decoder.decode_frame().unwrap().is_none());
        assert_eq!(finished.load(Ordering::SeqCst), queue.serial());
    }

    #[test]
    fn test_abort_unblocks_decode() {
        let (mut decoder, queue, _) = setup();
        let handle = thread::spawn(move || decoder.decode_frame().map(|f| f.is_some()));
        thread::sleep(std::time::Duration::from_millis(20));
        queue.abort();
        assert_eq!(handle.join().unwrap(), Err(QueueError::Aborted));
    }
}
