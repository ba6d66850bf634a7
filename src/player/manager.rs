use crate::core::{
    Chapter, MediaInfo, MediaType, PlaybackState, PlayerConfig, PlayerError, PlayerEvent, Result, SeekTarget,
};
use crate::player::audio_output::AudioDevice;
use crate::player::decoder::DropStats;
use crate::player::demuxer_source::{InterruptFlag, MediaSource, SourceFactory};
use crate::player::demuxer_thread::{DemuxerThread, ReadContext, StreamSelection};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::queue::Notifier;
use crate::player::refresh::{RefreshCommand, RefreshContext, RefreshThread};
use crate::player::sync::{SyncEngine, MAX_FRAME_DURATION, MAX_FRAME_DURATION_DISCONTINUOUS};
use crate::renderer::Renderer;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 包队列的参考容量（真正的背压由字节数和缓存时长决定）
const PACKET_QUEUE_ADVISORY_CAPACITY: usize = 256;

/// 一次播放会话：打开媒体源之后、Stop 之前存在
struct Session {
    url: String,
    read: ReadContext,
    demuxer: DemuxerThread,
    refresh: RefreshThread,
    media_info: MediaInfo,
    chapters: Vec<Chapter>,
    frame_duration: f64,
    /// 最近一次 Seek 的目标（主时钟暂时无效时作为相对 Seek 的基准）
    last_seek: Option<f64>,
}

/// 播放控制器 - 整体控制播放流程
///
/// 持有会话的全部共享状态，工作线程只拿到各自需要的句柄。
/// 所有命令都是非阻塞的：通过命令通道交给读线程或刷新线程执行，
/// 状态变化以 [`PlayerEvent`] 通知。
pub struct PlaybackController {
    config: PlayerConfig,
    factory: Arc<dyn SourceFactory>,
    audio_device: Arc<dyn AudioDevice>,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    volume: Arc<AtomicCell<f32>>,
    state: Arc<AtomicCell<PlaybackState>>,
    drops: Arc<DropStats>,
    session: Option<Session>,
}

impl PlaybackController {
    pub fn new(config: PlayerConfig, factory: Arc<dyn SourceFactory>, audio_device: Arc<dyn AudioDevice>) -> Self {
        info!("{} 🎮 创建播放控制器...", log_ctx());
        let (events_tx, events_rx) = unbounded();
        let volume = Arc::new(AtomicCell::new(config.start_volume.clamp(0.0, 1.0)));
        Self {
            config,
            factory,
            audio_device,
            events_tx,
            events_rx,
            volume,
            state: Arc::new(AtomicCell::new(PlaybackState::Idle)),
            drops: Arc::new(DropStats::default()),
            session: None,
        }
    }

    /// 事件接收端（可以克隆多份）
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// 当前播放状态；会话内出现致命错误时视为已停止
    pub fn state(&self) -> PlaybackState {
        match &self.session {
            Some(session) if session.read.fatal.load(Ordering::Acquire) => PlaybackState::Stopped,
            _ => self.state.load(),
        }
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.session.as_ref().map(|s| &s.media_info)
    }

    pub fn chapters(&self) -> &[Chapter] {
        self.session.as_ref().map_or(&[], |s| s.chapters.as_slice())
    }

    pub fn current_url(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.url.as_str())
    }

    /// 主时钟位置（秒）
    pub fn position(&self) -> Option<f64> {
        self.session.as_ref().and_then(|s| s.read.sync.get_master_clock())
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    /// (提前丢弃, 迟到丢弃) 的视频帧数
    pub fn drop_stats(&self) -> (u64, u64) {
        (
            self.drops.early.load(Ordering::Relaxed),
            self.drops.late.load(Ordering::Relaxed),
        )
    }

    /// 会话的同步引擎（诊断用）
    pub fn sync_engine(&self) -> Option<Arc<SyncEngine>> {
        self.session.as_ref().map(|s| s.read.sync.clone())
    }

    /// 会话的包队列 (视频, 音频, 字幕)（诊断用）
    pub fn packet_queues(&self) -> Option<(Arc<PacketQueue>, Arc<PacketQueue>, Arc<PacketQueue>)> {
        self.session
            .as_ref()
            .map(|s| (s.read.videoq.clone(), s.read.audioq.clone(), s.read.subtitleq.clone()))
    }

    /// 所有工作线程是否都还在运行
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.demuxer.is_running() && s.refresh.is_running())
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// 打开媒体源并开始播放
    ///
    /// 打开失败时不会启动任何线程，返回错误并发出 `Error` 事件。
    pub fn play(&mut self, url: &str, renderer: Box<dyn Renderer>) -> Result<MediaInfo> {
        self.stop();
        info!("{} 📂 打开媒体源: {}", log_ctx(), url);

        let interrupt = InterruptFlag::new();
        let source = match self.factory.open(url, interrupt.clone()) {
            Ok(source) => source,
            Err(e) => {
                error!("{} ❌ 打开媒体源失败: {}", log_ctx(), e);
                self.emit(PlayerEvent::Error(e.to_string()));
                self.state.store(PlaybackState::Stopped);
                return Err(e);
            }
        };

        let selection = self.select_streams(source.as_ref());
        if selection.video.is_none() && selection.audio.is_none() {
            let e = PlayerError::NoStreams;
            self.emit(PlayerEvent::Error(e.to_string()));
            self.state.store(PlaybackState::Stopped);
            return Err(e);
        }
        let media_info = Self::build_media_info(source.as_ref(), selection);
        let chapters = source.chapters();
        let frame_duration = selection
            .video
            .and_then(|i| source.stream(i))
            .and_then(|s| s.frame_duration())
            .unwrap_or(1.0 / 25.0);
        info!("{} 媒体信息: {:?}", log_ctx(), media_info);

        let session = self.start_session(url, source, selection, interrupt, renderer, media_info.clone(), chapters, frame_duration)?;
        self.session = Some(session);
        self.state.store(PlaybackState::Running);

        self.emit(PlayerEvent::Started(url.to_string()));
        if let Some(duration) = media_info.duration {
            self.emit(PlayerEvent::TotalDuration(duration));
        }
        self.emit(PlayerEvent::Volume(self.volume.load()));
        Ok(media_info)
    }

    fn select_streams(&self, source: &dyn MediaSource) -> StreamSelection {
        StreamSelection {
            video: (!self.config.disable_video)
                .then(|| source.best_stream(MediaType::Video))
                .flatten(),
            audio: (!self.config.disable_audio)
                .then(|| source.best_stream(MediaType::Audio))
                .flatten(),
            subtitle: (!self.config.disable_subtitles)
                .then(|| source.best_stream(MediaType::Subtitle))
                .flatten(),
        }
    }

    fn build_media_info(source: &dyn MediaSource, selection: StreamSelection) -> MediaInfo {
        let mut info = MediaInfo {
            duration: source.duration(),
            start_time: source.start_time(),
            is_realtime: source.is_realtime(),
            video_codec: "none".to_string(),
            audio_codec: "none".to_string(),
            ..MediaInfo::default()
        };
        if let Some(video) = selection.video.and_then(|i| source.stream(i)) {
            info.width = video.width;
            info.height = video.height;
            info.fps = video.frame_duration().map_or(0.0, |d| 1.0 / d);
            info.video_codec = video.codec_name.clone();
        }
        if let Some(audio) = selection.audio.and_then(|i| source.stream(i)) {
            info.sample_rate = audio.sample_rate;
            info.channels = audio.channels;
            info.audio_codec = audio.codec_name.clone();
        }
        info
    }

    #[allow(clippy::too_many_arguments)]
    fn start_session(
        &mut self,
        url: &str,
        source: Box<dyn MediaSource>,
        selection: StreamSelection,
        interrupt: InterruptFlag,
        renderer: Box<dyn Renderer>,
        media_info: MediaInfo,
        chapters: Vec<Chapter>,
        frame_duration: f64,
    ) -> Result<Session> {
        let queues = &self.config.queues;
        let videoq = Arc::new(PacketQueue::new(MediaType::Video, PACKET_QUEUE_ADVISORY_CAPACITY));
        let audioq = Arc::new(PacketQueue::new(MediaType::Audio, PACKET_QUEUE_ADVISORY_CAPACITY));
        let subtitleq = Arc::new(PacketQueue::new(MediaType::Subtitle, PACKET_QUEUE_ADVISORY_CAPACITY));
        let pictq = Arc::new(FrameQueue::new("pictq", queues.video_frame_capacity, true));
        let sampq = Arc::new(FrameQueue::new("sampq", queues.audio_frame_capacity, true));
        let subpq = Arc::new(FrameQueue::new("subpq", queues.subtitle_frame_capacity, false));

        let sync = Arc::new(SyncEngine::new(
            self.config.sync.clone(),
            self.config.sync_mode,
            audioq.serial_ref(),
            videoq.serial_ref(),
        ));
        sync.set_max_frame_duration(if source.has_timestamp_discontinuities() {
            MAX_FRAME_DURATION_DISCONTINUOUS
        } else {
            MAX_FRAME_DURATION
        });

        self.drops.early.store(0, Ordering::Relaxed);
        self.drops.late.store(0, Ordering::Relaxed);
        let paused = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(AtomicBool::new(false));
        let continue_read = Arc::new(Notifier::new());

        let refresh = RefreshThread::start(
            renderer,
            RefreshContext {
                pictq: pictq.clone(),
                subpq: subpq.clone(),
                videoq: videoq.clone(),
                audioq: audioq.clone(),
                subtitleq: subtitleq.clone(),
                sync: sync.clone(),
                paused: paused.clone(),
                state: self.state.clone(),
                ended: ended.clone(),
                fatal: fatal.clone(),
                drops: self.drops.clone(),
                continue_read: continue_read.clone(),
                events: self.events_tx.clone(),
                frame_drop: self.config.frame_drop,
                is_realtime: media_info.is_realtime,
            },
        )?;

        let read = ReadContext {
            config: self.config.clone(),
            videoq,
            audioq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            sync,
            continue_read,
            audio_device: self.audio_device.clone(),
            volume: self.volume.clone(),
            paused,
            ended,
            fatal,
            interrupt,
            drops: self.drops.clone(),
            events: self.events_tx.clone(),
            refresh_tx: refresh.command_sender(),
        };

        let mut refresh = refresh;
        let demuxer = match DemuxerThread::start(source, selection, read.clone()) {
            Ok(demuxer) => demuxer,
            Err(e) => {
                error!("{} ❌ 启动读线程失败: {}", log_ctx(), e);
                read.abort_all();
                refresh.stop();
                return Err(e);
            }
        };

        Ok(Session {
            url: url.to_string(),
            read,
            demuxer,
            refresh,
            media_info,
            chapters,
            frame_duration,
            last_seek: None,
        })
    }

    /// 暂停/继续
    pub fn pause(&mut self) {
        if let Some(session) = &self.session {
            session.refresh.send(RefreshCommand::TogglePause);
        }
    }

    /// 单帧步进（播放中调用会在显示下一帧后暂停）
    pub fn step(&mut self) {
        if let Some(session) = &self.session {
            session.refresh.send(RefreshCommand::Step);
        }
    }

    /// 后退一帧：相对 Seek 一个帧时长，然后步进显示
    pub fn step_back(&mut self) -> Result<()> {
        let Some(frame_duration) = self.session.as_ref().map(|s| s.frame_duration) else {
            return Ok(());
        };
        self.seek(-frame_duration, true)?;
        if !self.is_paused() {
            self.step();
        }
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.read.paused.load(Ordering::Acquire))
    }

    /// Seek
    ///
    /// `relative` 为 true 时 `target` 是相对当前位置的偏移（秒），否则为绝对位置。
    /// 暂停状态下 Seek 完成后会步进显示一帧。
    pub fn seek(&mut self, target: f64, relative: bool) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(PlayerError::Seek("没有正在播放的媒体".to_string()));
        };
        if target.is_nan() {
            return Err(PlayerError::Seek("无效的 Seek 位置".to_string()));
        }
        let start = session.media_info.start_time;
        let (pos, rel) = if relative {
            let current = session
                .read
                .sync
                .get_master_clock()
                .or(session.last_seek)
                .unwrap_or(start);
            (current + target, target)
        } else {
            (target, 0.0)
        };
        let mut pos = pos.max(start);
        if let Some(duration) = session.media_info.duration {
            pos = pos.min(start + duration);
        }
        session.last_seek = Some(pos);
        info!("{} ⏩ 请求 Seek 到 {:.3}s（相对 {:.3}s）", log_ctx(), pos, rel);
        session.demuxer.seek(SeekTarget::new(pos, rel))
    }

    /// 按总时长比例 Seek（0.0 ~ 1.0）
    pub fn seek_fraction(&mut self, fraction: f64) -> Result<()> {
        let Some(info) = self.media_info() else {
            return Err(PlayerError::Seek("没有正在播放的媒体".to_string()));
        };
        let Some(duration) = info.duration else {
            return Err(PlayerError::Seek("媒体时长未知，无法按比例 Seek".to_string()));
        };
        let target = info.start_time + fraction.clamp(0.0, 1.0) * duration;
        self.seek(target, false)
    }

    pub fn seek_forward(&mut self) -> Result<()> {
        self.seek(self.config.seek_interval, true)
    }

    pub fn seek_back(&mut self) -> Result<()> {
        self.seek(-self.config.seek_interval, true)
    }

    /// 跳到相邻章节（`incr` 为 +1 下一章，-1 上一章）
    pub fn seek_chapter(&mut self, incr: i32) -> Result<()> {
        let Some(session) = &self.session else {
            return Err(PlayerError::Seek("没有正在播放的媒体".to_string()));
        };
        if session.chapters.is_empty() {
            return Ok(());
        }
        let pos = session
            .read
            .sync
            .get_master_clock()
            .or(session.last_seek)
            .unwrap_or(session.media_info.start_time);
        let current = session
            .chapters
            .iter()
            .position(|c| pos < c.start)
            .map_or(session.chapters.len() as i64 - 1, |i| i as i64 - 1);
        let index = (current + incr as i64).max(0);
        let Some(chapter) = session.chapters.get(index as usize) else {
            return Ok(());
        };
        info!("{} 📑 跳到章节 #{}: {}", log_ctx(), index, chapter.title);
        let start = chapter.start;
        self.seek(start, false)
    }

    /// 设置音量（0.0 ~ 1.0）
    pub fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume.store(volume);
        self.emit(PlayerEvent::Volume(volume));
    }

    pub fn add_volume(&mut self) {
        let volume = self.volume.load() + self.config.volume_step;
        self.set_volume(volume);
    }

    pub fn sub_volume(&mut self) {
        let volume = self.volume.load() - self.config.volume_step;
        self.set_volume(volume);
    }

    /// 切换到下一个同类型的流
    pub fn cycle_stream(&mut self, kind: MediaType) -> Result<()> {
        match &self.session {
            Some(session) => session.demuxer.cycle_stream(kind),
            None => Ok(()),
        }
    }

    /// 重绘当前帧
    pub fn refresh(&mut self) {
        if let Some(session) = &self.session {
            session.refresh.send(RefreshCommand::ForceRefresh);
        }
    }

    /// 停止播放：中止所有队列、打断阻塞的读取并等待全部线程退出（可重复调用）
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!("{} ⏹ 停止播放: {}", log_ctx(), session.url);
        self.state.store(PlaybackState::Stopped);

        session.read.interrupt.raise();
        session.read.abort_all();
        session.refresh.stop();
        session.demuxer.stop();

        let freed = session.read.pictq.clear() + session.read.sampq.clear() + session.read.subpq.clear();
        let packets = session.read.videoq.drain() + session.read.audioq.drain() + session.read.subtitleq.drain();
        info!("{} ✅ 所有线程已退出（释放 {} 帧、{} 个包）", log_ctx(), freed, packets);

        if !session.read.fatal.load(Ordering::Acquire) {
            self.emit(PlayerEvent::Stopped);
        }
        self.emit(PlayerEvent::StopFinished);
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("{} ⚠ PlaybackController 被 drop 时仍在播放，自动停止", log_ctx());
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::audio_output::NullAudioDevice;
    use crate::player::demuxer_source::DefaultSourceFactory;
    use crate::renderer::NullRenderer;
    use std::time::Duration;

    fn controller(config: PlayerConfig) -> PlaybackController {
        PlaybackController::new(config, Arc::new(DefaultSourceFactory), Arc::new(NullAudioDevice))
    }

    #[test]
    fn test_open_failure_starts_nothing() {
        let mut player = controller(PlayerConfig::default());
        let events = player.events();
        let err = player
            .play("synthetic://x?video=0&audio=0", Box::new(NullRenderer::default()))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!player.is_running());
        assert!(matches!(events.try_recv(), Ok(PlayerEvent::Error(_))));
    }

    #[test]
    fn test_volume_clamped() {
        let mut player = controller(PlayerConfig::default());
        player.set_volume(1.7);
        assert_eq!(player.volume(), 1.0);
        player.sub_volume();
        assert!((player.volume() - 0.95).abs() < 1e-6);
        player.set_volume(-3.0);
        assert_eq!(player.volume(), 0.0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut player = controller(PlayerConfig::default());
        player
            .play("synthetic://x?duration=5", Box::new(NullRenderer::default()))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(player.is_running());
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(player.media_info().is_none());
    }

    #[test]
    fn test_media_info_reports_streams() {
        let mut player = controller(PlayerConfig::default());
        let info = player
            .play("synthetic://x?duration=12&fps=30&width=640&height=360", Box::new(NullRenderer::default()))
            .unwrap();
        assert_eq!(info.duration, Some(12.0));
        assert_eq!((info.width, info.height), (640, 360));
        assert!((info.fps - 30.0).abs() < 1e-6);
        assert_eq!(info.sample_rate, 48000);
        player.stop();
    }

    #[test]
    fn test_seek_without_session_fails() {
        let mut player = controller(PlayerConfig::default());
        assert!(player.seek(5.0, false).is_err());
        assert!(player.seek_fraction(0.5).is_err());
    }
}
