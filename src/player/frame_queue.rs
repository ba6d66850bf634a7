use crate::core::{Frame, QueueError};
use crate::player::queue::{BoundedQueue, Capacity, QueueItem};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

impl QueueItem for Frame {
    fn byte_size(&self) -> usize {
        Frame::byte_size(self)
    }

    fn duration(&self) -> f64 {
        self.duration
    }
}

/// 解码帧队列（固定容量环形缓冲）
///
/// 生产者（解码线程）在队列满时阻塞；消费者（刷新循环/音频回调）
/// 通过 peek/next 访问。`keep_last` 为 true 时，最近显示过的一帧保留在队头，
/// 用于暂停/窗口变化时重绘，以及计算当前帧时长。
pub struct FrameQueue {
    queue: BoundedQueue<Arc<Frame>>,
    keep_last: bool,
    /// 队头帧是否已经显示过（只由消费者线程修改）
    shown: AtomicBool,
}

impl FrameQueue {
    pub fn new(name: &'static str, capacity: usize, keep_last: bool) -> Self {
        Self {
            queue: BoundedQueue::new(name, Capacity::Hard(capacity.max(1))),
            keep_last,
            shown: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.queue.name()
    }

    pub fn start(&self) {
        self.shown.store(false, Ordering::Release);
        self.queue.start();
    }

    /// 入队；队列满时阻塞，中止后返回 `Aborted`
    pub fn push(&self, frame: Frame) -> Result<(), QueueError> {
        let serial = frame.serial;
        self.queue.push_tagged(Arc::new(frame), serial)
    }

    fn shown_offset(&self) -> usize {
        usize::from(self.shown.load(Ordering::Acquire))
    }

    /// 尚未显示的帧数
    pub fn nb_remaining(&self) -> usize {
        self.queue.len().saturating_sub(self.shown_offset())
    }

    /// 下一帧待显示的帧
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.queue.nth(self.shown_offset()).map(|e| e.item)
    }

    /// 待显示帧之后的一帧
    pub fn peek_next(&self) -> Option<Arc<Frame>> {
        self.queue.nth(self.shown_offset() + 1).map(|e| e.item)
    }

    /// 最近显示过的帧（keep_last 时为队头）
    pub fn peek_last(&self) -> Option<Arc<Frame>> {
        self.queue.nth(0).map(|e| e.item)
    }

    /// 是否有已显示过的帧保留在队头
    pub fn has_shown(&self) -> bool {
        self.shown.load(Ordering::Acquire)
    }

    /// 阻塞等待下一帧可读（超时或中止时返回错误）
    pub fn peek_readable(&self, timeout: Option<Duration>) -> Result<Arc<Frame>, QueueError> {
        self.queue.wait_for_len(self.shown_offset() + 1, timeout)?;
        self.peek().ok_or(QueueError::Empty)
    }

    /// 前进一帧：keep_last 时第一次只把队头标记为已显示，之后释放旧的队头
    pub fn next(&self) {
        if self.keep_last && !self.shown.load(Ordering::Acquire) {
            self.shown.store(true, Ordering::Release);
            return;
        }
        match self.queue.pop(false) {
            Ok(_) => {}
            // 停止中：帧留给 clear() 统一释放
            Err(QueueError::Aborted) => debug!("{} 已中止，next() 不释放帧", self.name()),
            Err(e) => debug!("{} next() 没有可释放的帧: {}", self.name(), e),
        }
    }

    pub fn abort(&self) {
        self.queue.abort();
    }

    /// 唤醒等待者（例如包队列中止时）
    pub fn signal(&self) {
        self.queue.signal();
    }

    pub fn is_aborted(&self) -> bool {
        self.queue.is_aborted()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 释放所有帧（停止时调用）；返回释放数量
    pub fn clear(&self) -> usize {
        self.shown.store(false, Ordering::Release);
        self.queue.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FramePayload, SubtitleCue};
    use std::thread;

    fn frame(pts: f64, serial: u64) -> Frame {
        Frame::new(
            FramePayload::Subtitle(SubtitleCue {
                start_display: 0.0,
                end_display: 1.0,
                text: format!("{pts}"),
            }),
            Some(pts),
            0.04,
            None,
            serial,
        )
    }

    #[test]
    fn test_keep_last_semantics() {
        let q = FrameQueue::new("pictq", 3, true);
        q.start();
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(0.04, 1)).unwrap();

        assert_eq!(q.nb_remaining(), 2);
        assert_eq!(q.peek().unwrap().pts, Some(0.0));

        // 第一次 next 只是标记为已显示，帧仍保留
        q.next();
        assert_eq!(q.len(), 2);
        assert_eq!(q.nb_remaining(), 1);
        assert_eq!(q.peek_last().unwrap().pts, Some(0.0));
        assert_eq!(q.peek().unwrap().pts, Some(0.04));

        // 之后的 next 释放上一帧
        q.next();
        assert_eq!(q.len(), 1);
        assert_eq!(q.nb_remaining(), 0);
        assert_eq!(q.peek_last().unwrap().pts, Some(0.04));
        assert!(q.peek().is_none());
    }

    #[test]
    fn test_without_keep_last_next_releases() {
        let q = FrameQueue::new("subpq", 4, false);
        q.start();
        q.push(frame(1.0, 1)).unwrap();
        q.next();
        assert!(q.is_empty());
    }

    #[test]
    fn test_next_after_abort_leaves_frames_for_clear() {
        let q = FrameQueue::new("subpq", 4, false);
        q.start();
        q.push(frame(1.0, 1)).unwrap();
        q.push(frame(2.0, 1)).unwrap();
        q.abort();
        q.next();
        assert_eq!(q.len(), 2);
        assert_eq!(q.clear(), 2);

        // 空队列上的 next 也只是记录日志
        q.start();
        q.next();
        assert!(q.is_empty());
    }

    #[test]
    fn test_producer_blocks_when_full() {
        let q = Arc::new(FrameQueue::new("pictq", 2, true));
        q.start();
        q.push(frame(0.0, 1)).unwrap();
        q.push(frame(0.04, 1)).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(frame(0.08, 1)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 2);
        q.next(); // 标记已显示，不释放
        thread::sleep(Duration::from_millis(10));
        assert_eq!(q.len(), 2);
        q.next(); // 释放队头
        producer.join().unwrap().unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_peek_readable_wakes_on_abort() {
        let q = Arc::new(FrameQueue::new("sampq", 9, true));
        q.start();
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.peek_readable(None).map(|f| f.pts))
        };
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Aborted));
    }

    #[test]
    fn test_peek_readable_timeout() {
        let q = FrameQueue::new("sampq", 9, true);
        q.start();
        assert_eq!(
            q.peek_readable(Some(Duration::from_millis(5))).map(|f| f.pts),
            Err(QueueError::Timeout)
        );
    }
}
