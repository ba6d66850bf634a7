// 播放器核心模块

pub mod audio_output;
pub mod audio_pipeline;
pub mod decoder;
#[cfg(feature = "ffmpeg")]
pub mod demuxer;
pub mod demuxer_source;  // 媒体源/解码器抽象接口
pub mod demuxer_thread;  // 读线程
pub mod frame_queue;
pub mod manager;
pub mod packet_queue;
pub mod queue;
pub mod refresh;
pub mod resampler;  // 音频重采样（rubato）
pub mod sync;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use demuxer::Demuxer;
pub use audio_output::{AudioDevice, AudioSink, AudioSpec, NullAudioDevice};
#[cfg(feature = "cpal-output")]
pub use audio_output::CpalAudioDevice;
pub use demuxer_source::{DefaultSourceFactory, InterruptFlag, MediaSource, SourceFactory, StreamDecoder};
pub use demuxer_thread::DemuxerThread;
pub use manager::PlaybackController;
pub use sync::SyncEngine;
pub use synthetic::SyntheticSource;
