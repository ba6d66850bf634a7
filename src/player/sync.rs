use crate::core::{Clock, Frame, PlayerError, Result, SerialRef, SyncConfig, SyncMode};
use crossbeam::atomic::AtomicCell;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};

/// 有时间戳不连续风险的源（如 MPEG-TS）允许的最大帧时长
pub const MAX_FRAME_DURATION_DISCONTINUOUS: f64 = 10.0;
/// 普通源允许的最大帧时长
pub const MAX_FRAME_DURATION: f64 = 3600.0;

/// 音频漂移的累计状态（只由音频回调线程持有）
#[derive(Debug, Clone)]
pub struct AudioDriftState {
    diff_cum: f64,
    avg_count: u32,
    avg_coef: f64,
    /// 平均漂移低于该值时不做校正（通常为一个设备缓冲的时长）
    diff_threshold: f64,
}

impl AudioDriftState {
    pub fn new(avg_nb: u32, diff_threshold: f64) -> Self {
        let avg_nb = avg_nb.max(1);
        Self {
            diff_cum: 0.0,
            avg_count: 0,
            // 指数加权系数：经过 avg_nb 次测量后旧值权重衰减到 1%
            avg_coef: (0.01f64.ln() / avg_nb as f64).exp(),
            diff_threshold,
        }
    }

    pub fn reset(&mut self) {
        self.diff_cum = 0.0;
        self.avg_count = 0;
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.diff_threshold = threshold;
    }
}

/// 同步引擎：持有音频/视频/外部三个时钟，选择主时钟并计算每帧延迟
///
/// 由读线程、解码线程、刷新循环和音频回调共享（`Arc<SyncEngine>`）。
pub struct SyncEngine {
    config: SyncConfig,
    sync_mode: SyncMode,
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,
    has_audio: AtomicBool,
    has_video: AtomicBool,
    max_frame_duration: AtomicCell<f64>,
}

impl SyncEngine {
    /// 音频/视频时钟分别关联对应包队列的 serial，外部时钟独立
    pub fn new(config: SyncConfig, sync_mode: SyncMode, audio_serial: SerialRef, video_serial: SerialRef) -> Self {
        Self {
            config,
            sync_mode,
            audclk: Clock::new("audio", Some(audio_serial)),
            vidclk: Clock::new("video", Some(video_serial)),
            extclk: Clock::new("external", None),
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            max_frame_duration: AtomicCell::new(MAX_FRAME_DURATION),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn set_has_audio(&self, present: bool) {
        self.has_audio.store(present, Ordering::Release);
    }

    pub fn set_has_video(&self, present: bool) {
        self.has_video.store(present, Ordering::Release);
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio.load(Ordering::Acquire)
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    pub fn set_max_frame_duration(&self, value: f64) {
        self.max_frame_duration.store(value);
    }

    pub fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration.load()
    }

    /// 实际生效的主时钟
    ///
    /// 请求音频主时钟但没有音频流时，有视频则退回视频主时钟，否则用外部时钟；
    /// 请求视频主时钟但没有视频流时退回音频主时钟。
    pub fn master_sync_type(&self) -> SyncMode {
        match self.sync_mode {
            SyncMode::Video if self.has_video() => SyncMode::Video,
            SyncMode::Video => SyncMode::Audio,
            SyncMode::Audio if self.has_audio() => SyncMode::Audio,
            SyncMode::Audio if self.has_video() => SyncMode::Video,
            SyncMode::Audio | SyncMode::External => SyncMode::External,
        }
    }

    pub fn master_clock(&self) -> &Clock {
        match self.master_sync_type() {
            SyncMode::Audio => &self.audclk,
            SyncMode::Video => &self.vidclk,
            SyncMode::External => &self.extclk,
        }
    }

    /// 主时钟当前读数
    pub fn get_master_clock(&self) -> Option<f64> {
        self.master_clock().get()
    }

    /// 刷新循环显示一帧后更新视频时钟，并让外部时钟跟随
    pub fn update_video_clock(&self, pts: f64, serial: u64) {
        self.vidclk.set(pts, serial);
        self.extclk.sync_to_slave(&self.vidclk, self.config.nosync_threshold);
    }

    /// 音频回调在 `time` 时刻更新音频时钟，并让外部时钟跟随
    pub fn update_audio_clock_at(&self, pts: f64, serial: u64, time: f64) {
        self.audclk.set_at(pts, serial, time);
        self.extclk.sync_to_slave(&self.audclk, self.config.nosync_threshold);
    }

    /// 冻结/解冻所有时钟
    pub fn set_paused(&self, paused: bool) {
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
    }

    /// 两个视频帧之间的时长
    ///
    /// 同一代次时用 pts 差值；差值无效（非正、NaN、超过最大帧时长）时退回当前帧自身时长；
    /// 跨代次（中间发生过 seek）返回 0。
    pub fn vp_duration(&self, cur: &Frame, next: &Frame) -> f64 {
        if cur.serial != next.serial {
            return 0.0;
        }
        match (cur.pts, next.pts) {
            (Some(a), Some(b)) => {
                let duration = b - a;
                if duration.is_nan() || duration <= 0.0 || duration > self.max_frame_duration() {
                    cur.duration
                } else {
                    duration
                }
            }
            _ => cur.duration,
        }
    }

    /// 根据视频时钟相对主时钟的漂移调整下一帧的显示延迟
    pub fn compute_target_delay(&self, delay: f64) -> f64 {
        if self.master_sync_type() == SyncMode::Video {
            return delay;
        }
        let now = crate::core::wall_time();
        let (Some(video), Some(master)) = (self.vidclk.get_at(now), self.master_clock().get_at(now)) else {
            return delay;
        };
        let adjusted = self.adjust_delay(delay, video - master);
        debug!("video: delay={:.3} A-V={:.3} target={:.3}", delay, video - master, adjusted);
        adjusted
    }

    /// `diff` = 视频时钟 - 主时钟
    ///
    /// 阈值随帧时长缩放，但不小于 `sync_threshold_min`、不大于 `sync_threshold_max`。
    /// 单帧修正量不超过 `max_delay_correction`。
    pub fn adjust_delay(&self, delay: f64, diff: f64) -> f64 {
        let cfg = &self.config;
        let sync_threshold = cfg.sync_threshold_min.max(cfg.sync_threshold_max.min(delay));
        if diff.is_nan() || diff.abs() >= self.max_frame_duration() {
            return delay;
        }
        let cap = cfg.max_delay_correction;
        if diff <= -sync_threshold {
            // 视频落后：缩短等待去追赶
            (delay + diff.max(-cap)).max(0.0)
        } else if diff >= sync_threshold && delay > cfg.framedup_threshold {
            delay + diff.min(cap)
        } else if diff >= sync_threshold {
            // 视频超前且帧时长较短：重复当前帧（延迟翻倍）
            delay + delay.min(cap)
        } else {
            delay
        }
    }

    /// 音频不是主时钟时计算本次应输出的采样数
    ///
    /// 连续测量 `audio_diff_avg_nb` 次之后才开始校正，校正量不超过
    /// `sample_correction_percent_max`%。漂移超过 `nosync_threshold` 时清空累计并返回
    /// `ClockDriftExceeded`，由调用方重新锚定。
    pub fn synchronize_audio(&self, state: &mut AudioDriftState, nb_samples: usize, sample_rate: u32) -> Result<usize> {
        if self.master_sync_type() == SyncMode::Audio {
            return Ok(nb_samples);
        }
        let now = crate::core::wall_time();
        let diff = match (self.audclk.get_at(now), self.master_clock().get_at(now)) {
            (Some(audio), Some(master)) => audio - master,
            _ => {
                state.reset();
                return Ok(nb_samples);
            }
        };
        if diff.abs() >= self.config.nosync_threshold {
            state.reset();
            return Err(PlayerError::ClockDriftExceeded(diff));
        }

        state.diff_cum = diff + state.avg_coef * state.diff_cum;
        if state.avg_count < self.config.audio_diff_avg_nb {
            state.avg_count += 1;
            return Ok(nb_samples);
        }

        let avg_diff = state.diff_cum * (1.0 - state.avg_coef);
        if avg_diff.abs() < state.diff_threshold {
            return Ok(nb_samples);
        }
        let percent = self.config.sample_correction_percent_max as f64;
        let min_nb = (nb_samples as f64 * (100.0 - percent) / 100.0) as i64;
        let max_nb = (nb_samples as f64 * (100.0 + percent) / 100.0) as i64;
        let wanted = nb_samples as i64 + (diff * sample_rate as f64) as i64;
        let wanted = wanted.clamp(min_nb, max_nb).max(0) as usize;
        debug!(
            "audio: diff={:.3} adiff={:.3} sample_diff={} threshold={:.3}",
            diff,
            avg_diff,
            wanted as i64 - nb_samples as i64,
            state.diff_threshold
        );
        Ok(wanted)
    }

    /// 外部主时钟 + 实时流：根据包队列水位微调外部时钟速率
    ///
    /// 参数为各流当前包数，未打开的流传 None。
    pub fn check_external_clock_speed(&self, video_packets: Option<usize>, audio_packets: Option<usize>) {
        let cfg = &self.config;
        let starving = video_packets.map_or(false, |n| n <= cfg.external_clock_min_frames)
            || audio_packets.map_or(false, |n| n <= cfg.external_clock_min_frames);
        let overfilled = video_packets.map_or(true, |n| n > cfg.external_clock_max_frames)
            && audio_packets.map_or(true, |n| n > cfg.external_clock_max_frames);
        let speed = self.extclk.speed();
        if starving {
            self.extclk
                .set_speed(cfg.external_clock_speed_min.max(speed - cfg.external_clock_speed_step));
        } else if overfilled {
            self.extclk
                .set_speed(cfg.external_clock_speed_max.min(speed + cfg.external_clock_speed_step));
        } else if speed != 1.0 {
            let step = cfg.external_clock_speed_step * (1.0 - speed) / (1.0 - speed).abs();
            self.extclk.set_speed(speed + step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{wall_time, FramePayload, SubtitleCue};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn engine(mode: SyncMode) -> SyncEngine {
        let engine = SyncEngine::new(
            SyncConfig::default(),
            mode,
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicU64::new(1)),
        );
        engine.set_has_audio(true);
        engine.set_has_video(true);
        engine
    }

    fn frame(pts: Option<f64>, duration: f64, serial: u64) -> Frame {
        Frame::new(
            FramePayload::Subtitle(SubtitleCue {
                start_display: 0.0,
                end_display: 0.0,
                text: String::new(),
            }),
            pts,
            duration,
            None,
            serial,
        )
    }

    #[test]
    fn test_master_fallbacks() {
        let e = engine(SyncMode::Audio);
        assert_eq!(e.master_sync_type(), SyncMode::Audio);
        e.set_has_audio(false);
        assert_eq!(e.master_sync_type(), SyncMode::Video);
        e.set_has_video(false);
        assert_eq!(e.master_sync_type(), SyncMode::External);

        let e = engine(SyncMode::Video);
        e.set_has_video(false);
        assert_eq!(e.master_sync_type(), SyncMode::Audio);
    }

    #[test]
    fn test_video_lagging_shrinks_delay_to_floor() {
        let e = engine(SyncMode::Audio);
        let t = wall_time();
        e.audclk.set_at(10.000, 1, t);
        e.vidclk.set_at(9.800, 1, t);
        let delay = e.compute_target_delay(0.04);
        assert!(delay.abs() < 1e-3, "delay = {}", delay);
    }

    #[test]
    fn test_video_ahead_stretches_delay_within_cap() {
        let e = engine(SyncMode::Audio);
        let t = wall_time();
        e.audclk.set_at(10.000, 1, t);
        e.vidclk.set_at(10.150, 1, t);
        let delay = e.compute_target_delay(0.04);
        assert!(delay > 0.04);
        assert!(delay <= 0.04 + e.config().max_delay_correction + 1e-9);
    }

    #[test]
    fn test_long_frames_add_capped_diff() {
        let e = engine(SyncMode::Audio);
        // 帧时长 0.2 > framedup 阈值：直接加上漂移，但不超过单帧上限
        assert!((e.adjust_delay(0.2, 0.15) - 0.3).abs() < 1e-9);
        assert!((e.adjust_delay(0.2, 0.12) - 0.3).abs() < 1e-9);
        // 阈值内不调整
        assert_eq!(e.adjust_delay(0.04, 0.01), 0.04);
        // 漂移超过最大帧时长：时间戳异常，不调整
        e.set_max_frame_duration(MAX_FRAME_DURATION_DISCONTINUOUS);
        assert_eq!(e.adjust_delay(0.04, 20.0), 0.04);
    }

    #[test]
    fn test_video_master_keeps_nominal_delay() {
        let e = engine(SyncMode::Video);
        let t = wall_time();
        e.audclk.set_at(10.0, 1, t);
        e.vidclk.set_at(5.0, 1, t);
        assert_eq!(e.compute_target_delay(0.04), 0.04);
    }

    #[test]
    fn test_stale_video_clock_is_ignored() {
        let audio_serial = Arc::new(AtomicU64::new(1));
        let video_serial = Arc::new(AtomicU64::new(2));
        let e = SyncEngine::new(SyncConfig::default(), SyncMode::Audio, audio_serial, video_serial);
        e.set_has_audio(true);
        e.set_has_video(true);
        e.audclk.set(10.0, 1);
        e.vidclk.set(9.0, 1);
        assert_eq!(e.compute_target_delay(0.04), 0.04);
    }

    #[test]
    fn test_vp_duration() {
        let e = engine(SyncMode::Audio);
        let a = frame(Some(1.0), 0.04, 1);
        let b = frame(Some(1.04), 0.04, 1);
        assert!((e.vp_duration(&a, &b) - 0.04).abs() < 1e-9);

        // 时间戳倒退：退回帧自身时长
        let back = frame(Some(0.5), 0.04, 1);
        assert_eq!(e.vp_duration(&a, &back), 0.04);

        // 跨代次
        let other = frame(Some(30.0), 0.04, 2);
        assert_eq!(e.vp_duration(&a, &other), 0.0);
    }

    #[test]
    fn test_synchronize_audio_hysteresis_then_clip() {
        let e = engine(SyncMode::External);
        let nb = 1024;
        let mut state = AudioDriftState::new(e.config().audio_diff_avg_nb, 0.02);
        let t = wall_time();
        e.extclk.set_at(10.0, 0, t);
        e.audclk.set_at(10.5, 1, t);

        for _ in 0..e.config().audio_diff_avg_nb {
            assert_eq!(e.synchronize_audio(&mut state, nb, 48_000).unwrap(), nb);
        }
        // 音频超前 0.5s：需要多输出采样，但最多 +10%
        let wanted = e.synchronize_audio(&mut state, nb, 48_000).unwrap();
        assert_eq!(wanted, nb * 110 / 100);

        // 音频落后：最多 -10%
        let t = wall_time();
        e.extclk.set_at(10.0, 0, t);
        e.audclk.set_at(9.0, 1, t);
        state.reset();
        for _ in 0..e.config().audio_diff_avg_nb {
            e.synchronize_audio(&mut state, nb, 48_000).unwrap();
        }
        let wanted = e.synchronize_audio(&mut state, nb, 48_000).unwrap();
        assert_eq!(wanted, nb * 90 / 100);
    }

    #[test]
    fn test_synchronize_audio_large_drift_reanchors() {
        let e = engine(SyncMode::External);
        let mut state = AudioDriftState::new(20, 0.02);
        let t = wall_time();
        e.extclk.set_at(0.0, 0, t);
        e.audclk.set_at(50.0, 1, t);
        let err = e.synchronize_audio(&mut state, 512, 48_000).unwrap_err();
        assert!(matches!(err, PlayerError::ClockDriftExceeded(d) if d > 10.0));
    }

    #[test]
    fn test_audio_master_never_adjusts_samples() {
        let e = engine(SyncMode::Audio);
        let mut state = AudioDriftState::new(20, 0.02);
        e.audclk.set(3.0, 1);
        assert_eq!(e.synchronize_audio(&mut state, 777, 44_100).unwrap(), 777);
    }

    #[test]
    fn test_external_clock_speed_adapts_to_queue_levels() {
        let e = engine(SyncMode::External);
        e.extclk.set(0.0, 0);
        e.check_external_clock_speed(Some(1), Some(30));
        assert!(e.extclk.speed() < 1.0);
        let slowed = e.extclk.speed();

        // 水位正常时向 1.0 回归
        e.check_external_clock_speed(Some(5), Some(5));
        assert!(e.extclk.speed() > slowed);

        e.check_external_clock_speed(Some(30), None);
        e.check_external_clock_speed(Some(30), None);
        assert!(e.extclk.speed() > 1.0);
        assert!(e.extclk.speed() <= e.config().external_clock_speed_max + 1e-9);
    }
}
