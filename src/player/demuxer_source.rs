use crate::core::{Chapter, MediaType, Packet, PlayerError, RawFrame, Result, SeekTarget, StreamInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 中断标志：Stop 时置位，协作方在阻塞 I/O 中轮询它以尽快返回
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 读包结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    /// 到达结尾（之后仍可 seek）
    Eof,
}

/// Demuxer 数据源抽象接口
///
/// 不同的媒体源（本地文件、网络流、合成测试源等）实现这个接口。
/// 实现只会在读线程中被调用。
pub trait MediaSource: Send {
    /// 获取描述信息（用于日志）
    fn description(&self) -> String;

    /// 所有流的描述
    fn streams(&self) -> &[StreamInfo];

    /// 按流编号查找（编号不一定等于在 `streams()` 中的位置）
    fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.index == index)
    }

    /// 读取下一个包；阻塞读取应轮询 open 时拿到的 `InterruptFlag`
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    /// 重新定位读取位置
    fn seek(&mut self, target: SeekTarget) -> Result<()>;

    /// 为指定流创建解码器
    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn StreamDecoder>>;

    /// 总时长（秒），直播流为 None
    fn duration(&self) -> Option<f64>;

    /// 起始时间（秒）
    fn start_time(&self) -> f64 {
        0.0
    }

    /// 是否为实时流（直播、采集设备）
    fn is_realtime(&self) -> bool {
        false
    }

    /// 时间戳是否可能不连续（决定最大帧时长）
    fn has_timestamp_discontinuities(&self) -> bool {
        false
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn chapters(&self) -> Vec<Chapter> {
        Vec::new()
    }

    /// 暂停网络读取（RTSP 等协议）
    fn read_pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_play(&mut self) -> Result<()> {
        Ok(())
    }

    /// 默认选择某种类型的第一个流（优先非封面流）
    fn best_stream(&self, kind: MediaType) -> Option<usize> {
        let streams = self.streams();
        streams
            .iter()
            .find(|s| s.kind == kind && !s.is_attached_pic)
            .or_else(|| streams.iter().find(|s| s.kind == kind))
            .map(|s| s.index)
    }
}

/// send_packet 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// 解码器内部已满，需要先取帧，稍后重发同一个包
    Again,
}

/// receive_frame 结果
#[derive(Debug)]
pub enum DecodeStatus {
    Frame(RawFrame),
    /// 需要更多输入
    NeedMore,
    /// 已排空（收到 drain 后的所有帧都已取出）
    Eof,
}

/// 单个流的解码器（send/receive 模型）
pub trait StreamDecoder: Send {
    /// 送入一个包；None 表示排空
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus>;

    fn receive_frame(&mut self) -> Result<DecodeStatus>;

    /// 清空内部缓冲（seek 后调用）
    fn flush(&mut self);

    fn description(&self) -> String {
        "decoder".to_string()
    }
}

/// 媒体源工厂：根据 URL 打开数据源
pub trait SourceFactory: Send + Sync {
    fn open(&self, url: &str, interrupt: InterruptFlag) -> Result<Box<dyn MediaSource>>;
}

/// 默认工厂：`synthetic://` 使用内置合成源，其余交给 FFmpeg（需启用 `ffmpeg` 特性）
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn open(&self, url: &str, interrupt: InterruptFlag) -> Result<Box<dyn MediaSource>> {
        if url.starts_with(crate::player::synthetic::SCHEME) {
            let source = crate::player::synthetic::SyntheticSource::open(url, interrupt)?;
            return Ok(Box::new(source));
        }
        #[cfg(feature = "ffmpeg")]
        {
            let source = crate::player::demuxer::Demuxer::open(url, interrupt)?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            let _ = interrupt;
            Err(PlayerError::SourceOpen(format!(
                "{}: 未启用 ffmpeg 特性，只支持 synthetic:// 源",
                url
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_shared() {
        let flag = InterruptFlag::new();
        let clone = flag.clone();
        clone.raise();
        assert!(flag.is_raised());
        flag.clear();
        assert!(!clone.is_raised());
    }

    #[test]
    fn test_default_factory_opens_synthetic() {
        let source = DefaultSourceFactory
            .open("synthetic://test?duration=2", InterruptFlag::new())
            .unwrap();
        assert!(source.best_stream(MediaType::Video).is_some());
    }
}
