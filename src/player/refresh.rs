use crate::core::{wall_time, Frame, FrameDrop, PixelFormat, PlaybackState, PlayerEvent, Result, SyncMode};
use crate::player::decoder::DropStats;
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::queue::Notifier;
use crate::player::sync::SyncEngine;
use crate::renderer::{calculate_display_rect, DisplayCapabilities, Renderer};
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 刷新循环命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCommand {
    TogglePause,
    /// 暂停状态下前进一帧
    Step,
    /// 重绘当前帧（例如 Seek 后或窗口变化）
    ForceRefresh,
    Stop,
}

/// 刷新循环使用的共享句柄
#[derive(Clone)]
pub struct RefreshContext {
    pub pictq: Arc<FrameQueue>,
    pub subpq: Arc<FrameQueue>,
    pub videoq: Arc<PacketQueue>,
    pub audioq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,
    pub sync: Arc<SyncEngine>,
    pub paused: Arc<AtomicBool>,
    pub state: Arc<AtomicCell<PlaybackState>>,
    pub ended: Arc<AtomicBool>,
    pub fatal: Arc<AtomicBool>,
    pub drops: Arc<DropStats>,
    pub continue_read: Arc<Notifier>,
    pub events: Sender<PlayerEvent>,
    pub frame_drop: FrameDrop,
    pub is_realtime: bool,
}

/// 视频刷新线程：按同步引擎给出的延迟决定何时显示下一帧
pub struct RefreshThread {
    thread_handle: Option<JoinHandle<()>>,
    command_tx: Sender<RefreshCommand>,
}

impl RefreshThread {
    pub fn start(renderer: Box<dyn Renderer>, ctx: RefreshContext) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<RefreshCommand>();
        let thread_handle = thread::Builder::new()
            .name("refresh".to_string())
            .spawn(move || {
                let mut refresh = RefreshLoop::new(renderer, ctx, command_rx);
                refresh.run();
            })?;
        Ok(Self {
            thread_handle: Some(thread_handle),
            command_tx,
        })
    }

    /// 命令发送端（读线程在暂停状态下 Seek 后用它请求步进）
    pub fn command_sender(&self) -> Sender<RefreshCommand> {
        self.command_tx.clone()
    }

    pub fn send(&self, cmd: RefreshCommand) {
        if self.command_tx.send(cmd).is_err() {
            debug!("{} 刷新线程已退出，忽略命令 {:?}", log_ctx(), cmd);
        }
    }

    pub fn stop(&mut self) {
        self.send(RefreshCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 刷新线程异常退出", log_ctx());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for RefreshThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ RefreshThread 被 drop，但可能未调用 stop()", log_ctx());
            self.stop();
        }
    }
}

struct RefreshLoop {
    renderer: Box<dyn Renderer>,
    capabilities: DisplayCapabilities,
    ctx: RefreshContext,
    command_rx: Receiver<RefreshCommand>,
    /// 当前帧应开始显示的墙上时间
    frame_timer: f64,
    force_refresh: bool,
    /// 尚未显示的步进帧数；归零时重新暂停
    pending_steps: u32,
    surface: Option<(u32, u32)>,
    /// 最近一次因超出渲染能力而拒绝的画面尺寸（同一尺寸只报告一次）
    rejected: Option<(u32, u32)>,
    last_position: Option<i64>,
    refresh_rate: f64,
}

impl RefreshLoop {
    fn new(renderer: Box<dyn Renderer>, ctx: RefreshContext, command_rx: Receiver<RefreshCommand>) -> Self {
        let refresh_rate = ctx.sync.config().refresh_rate;
        let capabilities = renderer.capabilities();
        debug!("{} 渲染器能力: {:?}", log_ctx(), capabilities);
        Self {
            renderer,
            capabilities,
            ctx,
            command_rx,
            frame_timer: 0.0,
            force_refresh: false,
            pending_steps: 0,
            surface: None,
            rejected: None,
            last_position: None,
            refresh_rate,
        }
    }

    fn paused(&self) -> bool {
        self.ctx.paused.load(Ordering::Acquire)
    }

    fn run(&mut self) {
        info!("{} 🖥 刷新线程启动", log_ctx());
        let mut remaining: f64 = 0.0;
        loop {
            let wait = Duration::from_secs_f64(remaining.max(0.0));
            match self.command_rx.recv_timeout(wait) {
                Ok(RefreshCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(cmd) => {
                    self.handle_command(cmd);
                    // 命令处理后立即再走一轮刷新
                    remaining = 0.0;
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.ctx.fatal.load(Ordering::Acquire) {
                break;
            }

            remaining = self.refresh_rate;
            if self.ctx.ended.load(Ordering::Acquire) {
                // auto_exit：播放结束后停在最后一帧
                continue;
            }
            if !self.paused() || self.force_refresh {
                self.video_refresh(&mut remaining);
            }
            self.report_position();
        }
        info!(
            "{} 🛑 刷新线程退出（迟到丢帧 {}，提前丢帧 {}）",
            log_ctx(),
            self.ctx.drops.late.load(Ordering::Relaxed),
            self.ctx.drops.early.load(Ordering::Relaxed)
        );
    }

    fn handle_command(&mut self, cmd: RefreshCommand) {
        match cmd {
            RefreshCommand::TogglePause => {
                self.toggle_pause();
                self.pending_steps = 0;
            }
            RefreshCommand::Step => {
                // 连续多次 Step 逐个累加，每次显示一帧
                self.pending_steps += 1;
                if self.paused() {
                    self.toggle_pause();
                }
                self.ctx.state.store(PlaybackState::Stepping);
                debug!("{} ⏭ 单帧步进（待显示 {} 帧）", log_ctx(), self.pending_steps);
            }
            RefreshCommand::ForceRefresh => self.force_refresh = true,
            RefreshCommand::Stop => {}
        }
    }

    fn toggle_pause(&mut self) {
        let paused = self.paused();
        if paused {
            // 恢复播放：暂停期间的墙上时间不计入帧定时
            self.frame_timer += wall_time() - self.ctx.sync.vidclk.last_updated();
        }
        self.ctx.sync.set_paused(!paused);
        self.ctx.paused.store(!paused, Ordering::Release);
        self.ctx.continue_read.notify();
        let state = if paused {
            PlaybackState::Running
        } else {
            PlaybackState::Paused
        };
        self.ctx.state.store(state);
        let _ = self.ctx.events.send(PlayerEvent::PauseState(!paused));
        info!("{} {} {}", log_ctx(), if paused { "▶" } else { "⏸" }, if paused { "继续播放" } else { "暂停" });
    }

    fn late_drop_enabled(&self) -> bool {
        match self.ctx.frame_drop {
            FrameDrop::Always => true,
            FrameDrop::Never => false,
            FrameDrop::Auto => self.ctx.sync.master_sync_type() != SyncMode::Video,
        }
    }

    fn video_refresh(&mut self, remaining: &mut f64) {
        let sync = self.ctx.sync.clone();
        if !self.paused() && sync.master_sync_type() == SyncMode::External && self.ctx.is_realtime {
            let video = sync.has_video().then(|| self.ctx.videoq.nb_packets());
            let audio = sync.has_audio().then(|| self.ctx.audioq.nb_packets());
            sync.check_external_clock_speed(video, audio);
        }

        if sync.has_video() {
            self.advance_video(remaining);
            if self.force_refresh && self.ctx.pictq.has_shown() {
                self.display();
            }
        }
        self.force_refresh = false;
    }

    fn advance_video(&mut self, remaining: &mut f64) {
        let sync = self.ctx.sync.clone();
        let pictq = self.ctx.pictq.clone();
        loop {
            if pictq.nb_remaining() == 0 {
                return;
            }
            let (Some(last), Some(vp)) = (pictq.peek_last(), pictq.peek()) else {
                return;
            };
            if vp.serial != self.ctx.videoq.serial() {
                pictq.next();
                continue;
            }
            if last.serial != vp.serial {
                self.frame_timer = wall_time();
            }
            if self.paused() {
                return;
            }

            let last_duration = sync.vp_duration(&last, &vp);
            let delay = sync.compute_target_delay(last_duration);
            let time = wall_time();
            if time < self.frame_timer + delay {
                *remaining = remaining.min(self.frame_timer + delay - time);
                return;
            }
            self.frame_timer += delay;
            if delay > 0.0 && time - self.frame_timer > sync.config().sync_threshold_max {
                self.frame_timer = time;
            }
            if let Some(pts) = vp.pts {
                sync.update_video_clock(pts, vp.serial);
            }

            if pictq.nb_remaining() > 1 {
                if let Some(next) = pictq.peek_next() {
                    let duration = sync.vp_duration(&vp, &next);
                    if self.pending_steps == 0 && self.late_drop_enabled() && time > self.frame_timer + duration {
                        let drops = self.ctx.drops.late.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("{} 🗑 迟到丢弃视频帧 pts={:?}（累计 {}）", log_ctx(), vp.pts, drops);
                        pictq.next();
                        continue;
                    }
                }
            }

            self.expire_subtitles();
            pictq.next();
            self.force_refresh = true;

            if self.pending_steps > 0 {
                self.pending_steps -= 1;
                if self.pending_steps == 0 && !self.paused() {
                    self.toggle_pause();
                }
            }
            return;
        }
    }

    /// 释放过期代次或已经结束显示的字幕
    fn expire_subtitles(&self) {
        let subpq = &self.ctx.subpq;
        let video_clock = self.ctx.sync.vidclk.get();
        while subpq.nb_remaining() > 0 {
            let Some(sp) = subpq.peek() else {
                break;
            };
            let next = if subpq.nb_remaining() > 1 {
                subpq.peek_next()
            } else {
                None
            };
            let expired = sp.serial != self.ctx.subtitleq.serial()
                || match (video_clock, sp.pts, sp.subtitle()) {
                    (Some(clock), Some(pts), Some(cue)) => clock > pts + cue.end_display,
                    _ => false,
                }
                || match (video_clock, next.as_ref().and_then(|n| n.pts.zip(n.subtitle()))) {
                    (Some(clock), Some((pts, cue))) => clock > pts + cue.start_display,
                    _ => false,
                };
            if !expired {
                break;
            }
            subpq.next();
        }
    }

    fn current_subtitle(&self, vp: &Frame) -> Option<Arc<Frame>> {
        if self.ctx.subpq.nb_remaining() == 0 {
            return None;
        }
        let sp = self.ctx.subpq.peek()?;
        let cue = sp.subtitle()?;
        match (vp.pts, sp.pts) {
            (Some(vpts), Some(spts)) if vpts >= spts + cue.start_display => Some(sp),
            _ => None,
        }
    }

    fn display(&mut self) {
        let Some(vp) = self.ctx.pictq.peek_last() else {
            return;
        };
        let Some(picture) = vp.video() else {
            return;
        };
        if let Err(e) = self.ensure_surface(picture.width, picture.height, picture.format) {
            if self.rejected != Some((picture.width, picture.height)) {
                self.rejected = Some((picture.width, picture.height));
                error!("{} ❌ 创建显示表面失败: {}", log_ctx(), e);
                let _ = self.ctx.events.send(PlayerEvent::Error(e.to_string()));
            }
            return;
        }
        if !vp.is_uploaded() {
            match self.renderer.upload_frame(&vp) {
                Ok(()) => vp.mark_uploaded(),
                Err(e) => {
                    warn!("{} ⚠ 上传视频帧失败: {}", log_ctx(), e);
                    return;
                }
            }
        }
        let (sw, sh) = self.renderer.surface_size();
        let rect = calculate_display_rect(sw, sh, picture.width, picture.height, picture.sample_aspect_ratio);
        let subtitle = self.current_subtitle(&vp);
        let cue = subtitle.as_ref().and_then(|s| s.subtitle());
        if let Err(e) = self.renderer.present(rect, cue) {
            warn!("{} ⚠ 显示失败: {}", log_ctx(), e);
        }
    }

    fn ensure_surface(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        if self.surface == Some((width, height)) {
            return Ok(());
        }
        self.capabilities.check(width, height, format)?;
        match self.surface {
            Some(_) => self.renderer.resize_surface(width, height)?,
            None => self.renderer.create_surface(width, height, format)?,
        }
        info!("{} 📐 视频尺寸: {}x{}", log_ctx(), width, height);
        self.surface = Some((width, height));
        let _ = self.ctx.events.send(PlayerEvent::FrameDimensionsChanged(width, height));
        Ok(())
    }

    /// 主时钟跨过整秒时通知一次当前位置
    fn report_position(&mut self) {
        let Some(position) = self.ctx.sync.get_master_clock() else {
            return;
        };
        let second = position.floor() as i64;
        if self.last_position != Some(second) {
            self.last_position = Some(second);
            let _ = self.ctx.events.send(PlayerEvent::Position(position.max(0.0)));
        }
    }
}
