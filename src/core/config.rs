use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 主时钟选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 以音频为主时钟（默认，没有音频流时退回视频主时钟）
    Audio,
    /// 以视频为主时钟
    Video,
    /// 以外部时钟为主时钟
    External,
}

/// 丢帧策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDrop {
    /// 视频不是主时钟时才丢帧
    Auto,
    Always,
    Never,
}

/// 同步相关的调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 同步阈值下限（秒）
    pub sync_threshold_min: f64,
    /// 同步阈值上限（秒）
    pub sync_threshold_max: f64,
    /// 帧时长超过该值时不再重复帧，而是直接加上差值
    pub framedup_threshold: f64,
    /// 漂移超过该值视为不同步，不再校正而是重新锚定
    pub nosync_threshold: f64,
    /// 单帧最大延迟修正量（秒）
    pub max_delay_correction: f64,
    /// 音频采样数最大修正百分比
    pub sample_correction_percent_max: u32,
    /// 音频漂移平均所需的连续测量次数
    pub audio_diff_avg_nb: u32,
    pub external_clock_speed_min: f64,
    pub external_clock_speed_max: f64,
    pub external_clock_speed_step: f64,
    /// 实时流包队列低于该值时外部时钟减速
    pub external_clock_min_frames: usize,
    /// 实时流包队列高于该值时外部时钟加速
    pub external_clock_max_frames: usize,
    /// 刷新循环最大等待粒度（秒）
    pub refresh_rate: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_threshold_min: 0.04,
            sync_threshold_max: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            max_delay_correction: 0.1,
            sample_correction_percent_max: 10,
            audio_diff_avg_nb: 20,
            external_clock_speed_min: 0.900,
            external_clock_speed_max: 1.010,
            external_clock_speed_step: 0.001,
            external_clock_min_frames: 2,
            external_clock_max_frames: 10,
            refresh_rate: 0.01,
        }
    }
}

/// 队列容量与背压参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 所有包队列的总字节上限
    pub max_queue_bytes: usize,
    /// 每个流至少缓存的包数
    pub min_frames: usize,
    /// 每个流至少缓存的时长（秒）
    pub min_duration: f64,
    /// 视频帧队列容量（帧占内存大，容量小）
    pub video_frame_capacity: usize,
    /// 音频帧队列容量
    pub audio_frame_capacity: usize,
    /// 字幕帧队列容量
    pub subtitle_frame_capacity: usize,
    /// 实时流允许超出阈值的倍数（避免抖动）
    pub realtime_headroom: f64,
    /// 读线程背压等待时间（毫秒）
    pub read_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 15 * 1024 * 1024,
            min_frames: 25,
            min_duration: 1.0,
            video_frame_capacity: 3,
            audio_frame_capacity: 9,
            subtitle_frame_capacity: 16,
            realtime_headroom: 1.5,
            read_wait_ms: 10,
        }
    }
}

impl QueueConfig {
    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

/// 播放器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sync_mode: SyncMode,
    pub frame_drop: FrameDrop,
    /// None 表示跟随媒体源的实时流标志
    pub infinite_buffer: Option<bool>,
    /// 播放次数：1 = 播放一次，0 = 无限循环
    pub loop_count: u32,
    /// 播放结束后停止刷新并通知
    pub auto_exit: bool,
    pub start_volume: f32,
    pub volume_step: f32,
    /// 快进/快退步长（秒）
    pub seek_interval: f64,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_subtitles: bool,
    /// 请求的音频设备缓冲（每声道采样数）
    pub audio_buffer_samples: u32,
    pub sync: SyncConfig,
    pub queues: QueueConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Audio,
            frame_drop: FrameDrop::Auto,
            infinite_buffer: None,
            loop_count: 1,
            auto_exit: false,
            start_volume: 1.0,
            volume_step: 0.05,
            seek_interval: 10.0,
            disable_audio: false,
            disable_video: false,
            disable_subtitles: false,
            audio_buffer_samples: 1024,
            sync: SyncConfig::default(),
            queues: QueueConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 字符串加载，未给出的字段使用默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PlayerConfig::from_json_str(
            r#"{ "sync_mode": "external", "sync": { "nosync_threshold": 5.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.sync_mode, SyncMode::External);
        assert_eq!(config.sync.nosync_threshold, 5.0);
        assert_eq!(config.sync.sync_threshold_min, 0.04);
        assert_eq!(config.queues.video_frame_capacity, 3);
        assert_eq!(config.frame_drop, FrameDrop::Auto);
    }

    #[test]
    fn test_json_roundtrip_keeps_tuning() {
        let mut config = PlayerConfig::default();
        config.queues.min_frames = 7;
        let json = config.to_json_pretty().unwrap();
        let back = PlayerConfig::from_json_str(&json).unwrap();
        assert_eq!(back.queues.min_frames, 7);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = PlayerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::core::PlayerError::Config(_)));
    }
}
