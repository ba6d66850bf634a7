use crate::core::{MediaType, PlayerConfig, PlayerError, PlayerEvent, Result, SeekTarget};
use crate::player::audio_output::{AudioDevice, AudioSink, AudioSpec};
use crate::player::audio_pipeline::AudioPipeline;
use crate::player::decoder::{DecodeContext, DecodeWorker, Decoder, DropStats};
use crate::player::demuxer_source::{InterruptFlag, MediaSource, ReadOutcome};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::queue::Notifier;
use crate::player::refresh::RefreshCommand;
use crate::player::sync::SyncEngine;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 读线程命令
#[derive(Debug, Clone)]
pub enum DemuxerCommand {
    Seek(SeekTarget),
    /// 切换到下一个同类型的流
    CycleStream(MediaType),
    Stop,
}

/// 初始选择的流
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSelection {
    pub video: Option<usize>,
    pub audio: Option<usize>,
    pub subtitle: Option<usize>,
}

/// 读线程使用的共享句柄
#[derive(Clone)]
pub struct ReadContext {
    pub config: PlayerConfig,
    pub videoq: Arc<PacketQueue>,
    pub audioq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,
    pub pictq: Arc<FrameQueue>,
    pub sampq: Arc<FrameQueue>,
    pub subpq: Arc<FrameQueue>,
    pub sync: Arc<SyncEngine>,
    /// 解码线程发现包队列空了、或控制器发出命令时唤醒读线程
    pub continue_read: Arc<Notifier>,
    pub audio_device: Arc<dyn AudioDevice>,
    pub volume: Arc<AtomicCell<f32>>,
    pub paused: Arc<AtomicBool>,
    /// 当前代次已播放完毕（auto_exit 时刷新循环据此停住）
    pub ended: Arc<AtomicBool>,
    /// 出现会话级致命错误
    pub fatal: Arc<AtomicBool>,
    pub interrupt: InterruptFlag,
    pub drops: Arc<DropStats>,
    pub events: Sender<PlayerEvent>,
    /// 暂停状态下 Seek 完成后请求刷新循环步进一帧
    pub refresh_tx: Sender<RefreshCommand>,
}

impl ReadContext {
    fn packet_queue(&self, kind: MediaType) -> &Arc<PacketQueue> {
        match kind {
            MediaType::Video => &self.videoq,
            MediaType::Audio => &self.audioq,
            MediaType::Subtitle => &self.subtitleq,
        }
    }

    fn frame_queue(&self, kind: MediaType) -> &Arc<FrameQueue> {
        match kind {
            MediaType::Video => &self.pictq,
            MediaType::Audio => &self.sampq,
            MediaType::Subtitle => &self.subpq,
        }
    }

    /// 中止全部队列，唤醒所有阻塞的线程
    pub fn abort_all(&self) {
        for kind in [MediaType::Video, MediaType::Audio, MediaType::Subtitle] {
            self.packet_queue(kind).abort();
            self.frame_queue(kind).abort();
        }
        self.continue_read.notify();
    }
}

/// 已打开的流组件
struct OpenStream {
    index: usize,
    is_attached_pic: bool,
    worker: DecodeWorker,
    sink: Option<Box<dyn AudioSink>>,
}

/// 读线程管理器
///
/// 线程独占媒体源，负责打开各流的解码线程（以及音频设备），
/// 按背压策略把包分发到各包队列，处理 Seek/切换流/停止命令。
pub struct DemuxerThread {
    thread_handle: Option<JoinHandle<()>>,
    command_tx: Sender<DemuxerCommand>,
    continue_read: Arc<Notifier>,
}

impl DemuxerThread {
    /// 启动读线程
    pub fn start(source: Box<dyn MediaSource>, selection: StreamSelection, ctx: ReadContext) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<DemuxerCommand>();
        let continue_read = ctx.continue_read.clone();
        let thread_handle = thread::Builder::new()
            .name("read".to_string())
            .spawn(move || {
                let mut reader = ReadLoop::new(source, ctx, command_rx);
                reader.run(selection);
            })?;
        Ok(Self {
            thread_handle: Some(thread_handle),
            command_tx,
            continue_read,
        })
    }

    fn send(&self, cmd: DemuxerCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|e| PlayerError::Other(format!("发送读线程命令失败: {}", e)))?;
        self.continue_read.notify();
        Ok(())
    }

    pub fn seek(&self, target: SeekTarget) -> Result<()> {
        self.send(DemuxerCommand::Seek(target))
    }

    pub fn cycle_stream(&self, kind: MediaType) -> Result<()> {
        self.send(DemuxerCommand::CycleStream(kind))
    }

    /// 停止线程：发送 Stop 并 join（调用方应先中止队列、置位中断标志）
    pub fn stop(&mut self) {
        let _ = self.send(DemuxerCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 读线程异常退出", log_ctx());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ DemuxerThread 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}

struct ReadLoop {
    source: Box<dyn MediaSource>,
    ctx: ReadContext,
    command_rx: Receiver<DemuxerCommand>,
    video: Option<OpenStream>,
    audio: Option<OpenStream>,
    subtitle: Option<OpenStream>,
    eof: bool,
    last_paused: bool,
    end_reported: bool,
    loops_left: u32,
    infinite_buffer: bool,
    headroom: f64,
    packets_read: u64,
}

impl ReadLoop {
    fn new(source: Box<dyn MediaSource>, ctx: ReadContext, command_rx: Receiver<DemuxerCommand>) -> Self {
        let realtime = source.is_realtime();
        let infinite_buffer = ctx.config.infinite_buffer.unwrap_or(false);
        // 实时流允许适度超出阈值，避免抖动
        let headroom = if realtime && ctx.config.infinite_buffer.is_none() {
            ctx.config.queues.realtime_headroom.max(1.0)
        } else {
            1.0
        };
        let loops_left = ctx.config.loop_count;
        Self {
            source,
            ctx,
            command_rx,
            video: None,
            audio: None,
            subtitle: None,
            eof: false,
            last_paused: false,
            end_reported: false,
            loops_left,
            infinite_buffer,
            headroom,
            packets_read: 0,
        }
    }

    fn slot(&mut self, kind: MediaType) -> &mut Option<OpenStream> {
        match kind {
            MediaType::Video => &mut self.video,
            MediaType::Audio => &mut self.audio,
            MediaType::Subtitle => &mut self.subtitle,
        }
    }

    fn slot_ref(&self, kind: MediaType) -> Option<&OpenStream> {
        match kind {
            MediaType::Video => self.video.as_ref(),
            MediaType::Audio => self.audio.as_ref(),
            MediaType::Subtitle => self.subtitle.as_ref(),
        }
    }

    fn run(&mut self, selection: StreamSelection) {
        info!("{} 🎬 读线程启动: {}", log_ctx(), self.source.description());

        if let Err(e) = self.open_selection(selection) {
            error!("{} ❌ 打开流失败: {}", log_ctx(), e);
            self.fail(e);
        } else {
            self.read_loop();
        }

        self.close_all();
        info!("{} 🛑 读线程退出（共读取 {} 个包）", log_ctx(), self.packets_read);
    }

    /// 会话级错误：通知并隐式停止
    fn fail(&mut self, e: PlayerError) {
        self.ctx.fatal.store(true, Ordering::SeqCst);
        let _ = self.ctx.events.send(PlayerEvent::Error(e.to_string()));
        self.ctx.abort_all();
        let _ = self.ctx.events.send(PlayerEvent::Stopped);
    }

    fn open_selection(&mut self, selection: StreamSelection) -> Result<()> {
        if let Some(index) = selection.audio {
            match self.open_component(index) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("{} ⚠ 音频流 #{} 打开失败: {}", log_ctx(), index, e),
            }
        }
        if let Some(index) = selection.video {
            if let Err(e) = self.open_component(index) {
                warn!("{} ⚠ 视频流 #{} 打开失败: {}", log_ctx(), index, e);
            }
        }
        if let Some(index) = selection.subtitle {
            if let Err(e) = self.open_component(index) {
                warn!("{} ⚠ 字幕流 #{} 打开失败: {}", log_ctx(), index, e);
            }
        }
        if self.video.is_none() && self.audio.is_none() {
            return Err(PlayerError::NoStreams);
        }
        Ok(())
    }

    fn decode_context(&self, kind: MediaType) -> DecodeContext {
        DecodeContext {
            frames: self.ctx.frame_queue(kind).clone(),
            sync: self.ctx.sync.clone(),
            frame_drop: self.ctx.config.frame_drop,
            drops: self.ctx.drops.clone(),
        }
    }

    fn open_component(&mut self, index: usize) -> Result<()> {
        let stream = self
            .source
            .stream(index)
            .cloned()
            .ok_or_else(|| PlayerError::Other(format!("流 #{} 不存在", index)))?;
        let kind = stream.kind;
        let codec = self.source.open_decoder(index)?;
        info!("{} 📂 打开{}流 #{}: {} ({})", log_ctx(), kind.as_str(), index, stream.codec_name, codec.description());

        let packets = self.ctx.packet_queue(kind).clone();
        let frames = self.ctx.frame_queue(kind).clone();
        let mut decoder = Decoder::new(codec, &stream, packets.clone(), self.ctx.continue_read.clone());

        let mut sink = None;
        if kind == MediaType::Audio {
            let wanted = AudioSpec {
                sample_rate: stream.sample_rate,
                channels: stream.channels.clamp(1, 2),
                buffer_samples: self.ctx.config.audio_buffer_samples,
            };
            let mut pipeline = AudioPipeline::new(
                frames.clone(),
                packets.serial_ref(),
                self.ctx.sync.clone(),
                self.ctx.volume.clone(),
                self.ctx.paused.clone(),
            );
            let spec_handle = pipeline.spec_handle();
            let opened = self
                .ctx
                .audio_device
                .open(wanted, Box::new(move |out: &mut [f32]| pipeline.fill(out)))?;
            spec_handle.store(Some(opened.spec()));
            sink = Some(opened);
            decoder = decoder.with_start_pts(self.source.start_time());
        }

        packets.start();
        frames.start();
        let worker = DecodeWorker::spawn(decoder, self.decode_context(kind))?;
        if let Some(sink) = sink.as_mut() {
            sink.play()?;
        }
        match kind {
            MediaType::Video => self.ctx.sync.set_has_video(true),
            MediaType::Audio => self.ctx.sync.set_has_audio(true),
            MediaType::Subtitle => {}
        }
        *self.slot(kind) = Some(OpenStream {
            index,
            is_attached_pic: stream.is_attached_pic,
            worker,
            sink,
        });
        Ok(())
    }

    fn close_component(&mut self, kind: MediaType) {
        let Some(mut open) = self.slot(kind).take() else {
            return;
        };
        let packets = self.ctx.packet_queue(kind).clone();
        let frames = self.ctx.frame_queue(kind).clone();
        packets.abort();
        frames.abort();
        open.worker.join();
        if let Some(mut sink) = open.sink.take() {
            sink.close();
        }
        packets.drain();
        frames.clear();
        match kind {
            MediaType::Video => self.ctx.sync.set_has_video(false),
            MediaType::Audio => self.ctx.sync.set_has_audio(false),
            MediaType::Subtitle => {}
        }
        info!("{} 📕 关闭{}流 #{}", log_ctx(), kind.as_str(), open.index);
    }

    fn close_all(&mut self) {
        for kind in [MediaType::Audio, MediaType::Video, MediaType::Subtitle] {
            self.close_component(kind);
        }
    }

    /// 处理所有待处理命令；返回 false 表示应退出
    fn handle_commands(&mut self) -> bool {
        let mut seek = None;
        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                DemuxerCommand::Seek(target) => seek = Some(target),
                DemuxerCommand::CycleStream(kind) => self.cycle_stream(kind),
                DemuxerCommand::Stop => {
                    info!("{} ⏹ 读线程收到停止命令", log_ctx());
                    return false;
                }
            }
        }
        // 连续多次 Seek 只执行最后一次
        if let Some(target) = seek {
            self.do_seek(target);
        }
        true
    }

    fn do_seek(&mut self, target: SeekTarget) {
        if !self.source.is_seekable() {
            warn!("{} ⚠ 媒体源不支持 Seek，忽略", log_ctx());
            return;
        }
        info!("{} ⏩ Seek 到 {:.3}s", log_ctx(), target.target);
        match self.source.seek(target) {
            Ok(()) => {
                for kind in [MediaType::Video, MediaType::Audio, MediaType::Subtitle] {
                    if self.slot_ref(kind).is_some() {
                        self.ctx.packet_queue(kind).flush();
                    }
                }
                self.ctx.sync.extclk.set(target.target, 0);
                if self.ctx.paused.load(Ordering::Acquire) {
                    let _ = self.ctx.refresh_tx.send(RefreshCommand::Step);
                }
            }
            Err(e) => {
                error!("{} ❌ Seek 失败: {}", log_ctx(), e);
            }
        }
        self.eof = false;
        self.end_reported = false;
        self.ctx.ended.store(false, Ordering::SeqCst);
    }

    fn cycle_stream(&mut self, kind: MediaType) {
        let current = self.slot_ref(kind).map(|s| s.index);
        let candidates: Vec<usize> = self
            .source
            .streams()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.index)
            .collect();
        let next = match current {
            Some(cur) => candidates.iter().copied().find(|i| *i > cur).or_else(|| {
                // 字幕可以循环到“无字幕”
                if kind == MediaType::Subtitle {
                    None
                } else {
                    candidates.first().copied()
                }
            }),
            None => candidates.first().copied(),
        };
        if next == current {
            debug!("{} {}流没有其他可切换的流", log_ctx(), kind.as_str());
            return;
        }
        info!("{} 🔁 切换{}流: {:?} → {:?}", log_ctx(), kind.as_str(), current, next);
        self.close_component(kind);
        if let Some(index) = next {
            if let Err(e) = self.open_component(index) {
                error!("{} ❌ 打开{}流 #{} 失败: {}", log_ctx(), kind.as_str(), index, e);
                let _ = self.ctx.events.send(PlayerEvent::Error(e.to_string()));
            }
        }
    }

    /// 某个流是否已缓存足够的包（未打开、封面流视为足够）
    fn stream_has_enough(&self, kind: MediaType) -> bool {
        match self.slot_ref(kind) {
            None => true,
            Some(open) if open.is_attached_pic => true,
            Some(_) => {
                let q = &self.ctx.config.queues;
                let min_frames = (q.min_frames as f64 * self.headroom) as usize;
                self.ctx
                    .packet_queue(kind)
                    .has_enough_packets(min_frames, q.min_duration * self.headroom)
            }
        }
    }

    fn queues_full(&self) -> bool {
        if self.infinite_buffer {
            return false;
        }
        let total = self.ctx.videoq.size_bytes() + self.ctx.audioq.size_bytes() + self.ctx.subtitleq.size_bytes();
        let limit = (self.ctx.config.queues.max_queue_bytes as f64 * self.headroom) as usize;
        total > limit
            || (self.stream_has_enough(MediaType::Audio)
                && self.stream_has_enough(MediaType::Video)
                && self.stream_has_enough(MediaType::Subtitle))
    }

    /// 所有打开的流都已解码完当前代次且帧队列已消费完
    fn playback_finished(&self) -> bool {
        let drained = |kind: MediaType| match self.slot_ref(kind) {
            None => true,
            Some(open) => {
                open.worker.finished_serial() == self.ctx.packet_queue(kind).serial()
                    && self.ctx.frame_queue(kind).nb_remaining() == 0
            }
        };
        drained(MediaType::Audio) && drained(MediaType::Video)
    }

    fn should_loop(&mut self) -> bool {
        match self.loops_left {
            0 => true,
            1 => false,
            n => {
                self.loops_left = n - 1;
                true
            }
        }
    }

    fn read_loop(&mut self) {
        let wait = self.ctx.config.queues.read_wait();
        loop {
            if self.ctx.interrupt.is_raised() || !self.handle_commands() {
                break;
            }

            let paused = self.ctx.paused.load(Ordering::Acquire);
            if paused != self.last_paused {
                self.last_paused = paused;
                let result = if paused {
                    self.source.read_pause()
                } else {
                    self.source.read_play()
                };
                if let Err(e) = result {
                    debug!("{} read_pause/read_play 失败: {}", log_ctx(), e);
                }
            }

            if self.queues_full() {
                self.ctx.continue_read.wait_timeout(wait);
                continue;
            }

            if !paused && self.eof && !self.end_reported && self.playback_finished() {
                if self.should_loop() {
                    info!("{} 🔄 播放结束，从头循环", log_ctx());
                    let start = self.source.start_time();
                    self.do_seek(SeekTarget::new(start, 0.0));
                    continue;
                }
                info!("{} 🏁 播放结束", log_ctx());
                self.end_reported = true;
                self.ctx.ended.store(self.ctx.config.auto_exit, Ordering::SeqCst);
                let _ = self.ctx.events.send(PlayerEvent::EndOfMedia);
            }

            match self.source.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => {
                    self.eof = false;
                    self.packets_read += 1;
                    let target = [MediaType::Video, MediaType::Audio, MediaType::Subtitle]
                        .into_iter()
                        .find(|kind| self.slot_ref(*kind).map(|s| s.index) == Some(packet.stream_index));
                    if let Some(kind) = target {
                        let _ = self.ctx.packet_queue(kind).put(packet);
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    if !self.eof {
                        debug!("{} 📄 读到文件末尾，通知解码器排空", log_ctx());
                        for kind in [MediaType::Video, MediaType::Audio, MediaType::Subtitle] {
                            if self.slot_ref(kind).is_some() {
                                let _ = self.ctx.packet_queue(kind).put_drain();
                            }
                        }
                        self.eof = true;
                    }
                    self.ctx.continue_read.wait_timeout(wait);
                }
                Err(e) => {
                    if self.ctx.interrupt.is_raised() {
                        break;
                    }
                    warn!("{} ⚠ 读取包失败: {}", log_ctx(), e);
                    self.ctx.continue_read.wait_timeout(wait);
                }
            }
        }
    }
}
