use crate::core::{MediaType, Packet, QueueError, SerialRef};
use crate::player::queue::{BoundedQueue, Capacity, Entry, QueueItem};

/// 包队列元素
#[derive(Debug, Clone)]
pub enum QueuedPacket {
    Data(Packet),
    /// 文件结尾：通知解码器排空内部缓冲
    Drain,
}

impl QueueItem for QueuedPacket {
    fn byte_size(&self) -> usize {
        match self {
            QueuedPacket::Data(pkt) => pkt.byte_size(),
            QueuedPacket::Drain => std::mem::size_of::<Packet>(),
        }
    }

    fn duration(&self) -> f64 {
        match self {
            QueuedPacket::Data(pkt) => pkt.duration_seconds(),
            QueuedPacket::Drain => 0.0,
        }
    }
}

/// 每个流一条的压缩包队列
///
/// 容量只是背压参考（由读线程判断是否继续读包），push 不阻塞。
/// `flush()` 递增 serial，相当于插入一个 flush 标记：
/// 解码线程发现 serial 变化后清空解码器，并丢弃旧代次的包。
pub struct PacketQueue {
    kind: MediaType,
    queue: BoundedQueue<QueuedPacket>,
}

impl PacketQueue {
    pub fn new(kind: MediaType, advisory_capacity: usize) -> Self {
        let name = match kind {
            MediaType::Video => "videoq",
            MediaType::Audio => "audioq",
            MediaType::Subtitle => "subtitleq",
        };
        Self {
            kind,
            queue: BoundedQueue::new(name, Capacity::Advisory(advisory_capacity)),
        }
    }

    pub fn kind(&self) -> MediaType {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.queue.start()
    }

    pub fn put(&self, packet: Packet) -> Result<(), QueueError> {
        self.queue.push(QueuedPacket::Data(packet))
    }

    /// 放入一个排空标记（EOF）
    pub fn put_drain(&self) -> Result<(), QueueError> {
        self.queue.push(QueuedPacket::Drain)
    }

    /// 取出下一个包及其 serial
    pub fn get(&self, block: bool) -> Result<Entry<QueuedPacket>, QueueError> {
        self.queue.pop(block)
    }

    pub fn flush(&self) -> u64 {
        self.queue.flush()
    }

    pub fn abort(&self) {
        self.queue.abort();
    }

    pub fn drain(&self) -> usize {
        self.queue.drain()
    }

    pub fn is_aborted(&self) -> bool {
        self.queue.is_aborted()
    }

    pub fn nb_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.queue.bytes()
    }

    pub fn duration(&self) -> f64 {
        self.queue.total_duration()
    }

    pub fn serial(&self) -> u64 {
        self.queue.serial()
    }

    pub fn serial_ref(&self) -> SerialRef {
        self.queue.serial_ref()
    }

    /// 该流是否已有足够的缓存包
    ///
    /// 包数超过 `min_frames` 且缓存时长超过 `min_duration`（时长未知时只看包数）
    pub fn has_enough_packets(&self, min_frames: usize, min_duration: f64) -> bool {
        if self.is_aborted() {
            return true;
        }
        let duration = self.duration();
        self.nb_packets() > min_frames && (duration <= 0.0 || duration > min_duration)
    }
}
