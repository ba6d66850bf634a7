use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// 媒体源无法打开：会话级致命错误，不启动任何线程
    #[error("无法打开媒体源: {0}")]
    SourceOpen(String),

    /// 单个数据包解码失败：记录后跳过，不影响流继续播放
    #[error("解码错误: {0}")]
    Decode(String),

    /// 队列已中止（停止/Seek 时的正常路径，不向用户报告）
    #[error("队列已中止")]
    QueueAborted,

    /// 时钟漂移超过上限，仅用于内部触发重新锚定
    #[error("时钟漂移超限: {0:.3}s")]
    ClockDriftExceeded(f64),

    /// 音频/视频输出设备初始化失败：会话级致命错误
    #[error("输出设备初始化失败: {0}")]
    DeviceOpen(String),

    #[error("渲染错误: {0}")]
    Render(String),

    #[error("Seek 失败: {0}")]
    Seek(String),

    #[error("没有可播放的音视频流")]
    NoStreams,

    #[error("配置错误: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpeg(#[from] ffmpeg_next::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 是否为会话级致命错误（需要通知用户并隐式 Stop）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlayerError::SourceOpen(_) | PlayerError::DeviceOpen(_) | PlayerError::NoStreams
        )
    }
}

/// 队列操作错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("队列已中止")]
    Aborted,

    #[error("队列为空")]
    Empty,

    #[error("等待超时")]
    Timeout,
}

impl From<QueueError> for PlayerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Aborted => PlayerError::QueueAborted,
            other => PlayerError::Other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
