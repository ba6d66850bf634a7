//! 音视频播放同步引擎
//!
//! 入口是 [`PlaybackController`]。媒体源、解码器、音频设备和渲染器都通过 trait 接入。

pub mod core;
pub mod player;
pub mod renderer;

pub use crate::core::{MediaInfo, PlaybackState, PlayerConfig, PlayerError, PlayerEvent, Result};
pub use crate::player::PlaybackController;
