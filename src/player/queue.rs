use crate::core::{QueueError, SerialRef};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 队列元素：提供字节数与时长，用于背压统计
pub trait QueueItem {
    fn byte_size(&self) -> usize;

    /// 元素覆盖的媒体时长（秒）
    fn duration(&self) -> f64 {
        0.0
    }
}

impl<T: QueueItem> QueueItem for Arc<T> {
    fn byte_size(&self) -> usize {
        (**self).byte_size()
    }

    fn duration(&self) -> f64 {
        (**self).duration()
    }
}

/// 容量策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// 仅供生产者做背压判断，push 永不阻塞（包队列）
    Advisory(usize),
    /// 硬上限，队列满时 push 阻塞（帧队列）
    Hard(usize),
}

impl Capacity {
    pub fn limit(&self) -> usize {
        match *self {
            Capacity::Advisory(n) | Capacity::Hard(n) => n,
        }
    }
}

/// 带 serial 标签的队列元素
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub item: T,
    pub serial: u64,
}

struct QueueState<T> {
    items: VecDeque<Entry<T>>,
    bytes: usize,
    duration: f64,
    aborted: bool,
}

/// 线程安全的有界 FIFO（互斥锁 + 条件变量）
///
/// - 元素严格按插入顺序消费
/// - `flush()` 清空内容并递增 serial，旧 serial 的在途数据由消费者丢弃
/// - `abort()` 是终态：唤醒所有等待者，之后的 push/pop 都返回 `Aborted`
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: Capacity,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    /// serial 在锁内修改，同时镜像到原子量供时钟无锁读取
    serial: SerialRef,
}

impl<T: QueueItem> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: Capacity) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.limit().min(1024)),
                bytes: 0,
                duration: 0.0,
                aborted: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// 启动队列（清除中止标志并开启新的 serial 代次）
    pub fn start(&self) -> u64 {
        let mut st = self.state.lock();
        st.aborted = false;
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 以当前 serial 入队
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let serial = self.serial.load(Ordering::Acquire);
        self.push_locked(&mut st, item, serial)
    }

    /// 以指定 serial 入队（帧沿用其来源数据包的 serial）
    pub fn push_tagged(&self, item: T, serial: u64) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        self.push_locked(&mut st, item, serial)
    }

    fn push_locked(
        &self,
        st: &mut parking_lot::MutexGuard<'_, QueueState<T>>,
        item: T,
        serial: u64,
    ) -> Result<(), QueueError> {
        if let Capacity::Hard(limit) = self.capacity {
            while st.items.len() >= limit && !st.aborted {
                self.not_full.wait(st);
            }
        }
        if st.aborted {
            return Err(QueueError::Aborted);
        }
        st.bytes += item.byte_size();
        st.duration += item.duration();
        st.items.push_back(Entry { item, serial });
        self.not_empty.notify_one();
        Ok(())
    }

    /// 出队；非阻塞模式下队列为空返回 `Empty`
    pub fn pop(&self, block: bool) -> Result<Entry<T>, QueueError> {
        let mut st = self.state.lock();
        loop {
            if st.aborted {
                return Err(QueueError::Aborted);
            }
            if let Some(entry) = self.pop_locked(&mut st) {
                return Ok(entry);
            }
            if !block {
                return Err(QueueError::Empty);
            }
            self.not_empty.wait(&mut st);
        }
    }

    /// 最多等待 `timeout` 的出队
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Entry<T>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.aborted {
                return Err(QueueError::Aborted);
            }
            if let Some(entry) = self.pop_locked(&mut st) {
                return Ok(entry);
            }
            if self.not_empty.wait_until(&mut st, deadline).timed_out() {
                if st.aborted {
                    return Err(QueueError::Aborted);
                }
                return self.pop_locked(&mut st).ok_or(QueueError::Timeout);
            }
        }
    }

    fn pop_locked(&self, st: &mut QueueState<T>) -> Option<Entry<T>> {
        let entry = st.items.pop_front()?;
        st.bytes = st.bytes.saturating_sub(entry.item.byte_size());
        st.duration = (st.duration - entry.item.duration()).max(0.0);
        self.not_full.notify_one();
        Some(entry)
    }

    /// 等待直到队列中至少有 `min_len` 个元素
    ///
    /// `timeout` 为 None 时一直等待（直到中止）
    pub fn wait_for_len(&self, min_len: usize, timeout: Option<Duration>) -> Result<(), QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock();
        loop {
            if st.aborted {
                return Err(QueueError::Aborted);
            }
            if st.items.len() >= min_len {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut st, deadline).timed_out() {
                        if st.aborted {
                            return Err(QueueError::Aborted);
                        }
                        return if st.items.len() >= min_len {
                            Ok(())
                        } else {
                            Err(QueueError::Timeout)
                        };
                    }
                }
                None => self.not_empty.wait(&mut st),
            }
        }
    }

    /// 清空内容并递增 serial；返回新的 serial
    pub fn flush(&self) -> u64 {
        let mut st = self.state.lock();
        st.items.clear();
        st.bytes = 0;
        st.duration = 0.0;
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        self.not_full.notify_all();
        serial
    }

    /// 丢弃所有内容但不改变 serial；返回丢弃的数量
    pub fn drain(&self) -> usize {
        let mut st = self.state.lock();
        let n = st.items.len();
        st.items.clear();
        st.bytes = 0;
        st.duration = 0.0;
        self.not_full.notify_all();
        n
    }

    /// 中止：唤醒所有等待者，之后不再接受 push
    pub fn abort(&self) {
        let mut st = self.state.lock();
        st.aborted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// 唤醒所有等待者重新检查条件
    pub fn signal(&self) {
        let _st = self.state.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前排队的字节数
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// 当前排队的媒体时长（秒）
    pub fn total_duration(&self) -> f64 {
        self.state.lock().duration
    }

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// serial 的共享引用（供时钟判断过期）
    pub fn serial_ref(&self) -> SerialRef {
        self.serial.clone()
    }
}

impl<T: QueueItem + Clone> BoundedQueue<T> {
    /// 复制第 n 个元素（不出队）
    pub fn nth(&self, n: usize) -> Option<Entry<T>> {
        self.state.lock().items.get(n).cloned()
    }
}

/// 一次性唤醒信号（互斥锁 + 条件变量）
///
/// 读线程背压等待时用它休眠，解码线程发现包队列空了、或控制器发出命令时唤醒它。
#[derive(Default)]
pub struct Notifier {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// 最多等待 `timeout`；返回是否被唤醒（信号在返回前被消费）
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_for(&mut signaled, timeout);
        }
        std::mem::replace(&mut *signaled, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_notifier_wakes_waiter() {
        let n = Arc::new(Notifier::new());
        assert!(!n.wait_timeout(Duration::from_millis(5)));
        let waker = {
            let n = n.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                n.notify();
            })
        };
        assert!(n.wait_timeout(Duration::from_secs(2)));
        waker.join().unwrap();
        // 已消费
        assert!(!n.wait_timeout(Duration::from_millis(1)));
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Item(u32);

    impl QueueItem for Item {
        fn byte_size(&self) -> usize {
            100
        }

        fn duration(&self) -> f64 {
            0.5
        }
    }

    fn started(capacity: Capacity) -> Arc<BoundedQueue<Item>> {
        let q = Arc::new(BoundedQueue::new("test", capacity));
        q.start();
        q
    }

    #[test]
    fn test_fifo_order_across_threads() {
        let q = started(Capacity::Hard(4));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    q.push(Item(i)).unwrap();
                }
            })
        };
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.push(q.pop(true).unwrap().item.0);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_abort_wakes_blocked_pop() {
        let q = started(Capacity::Advisory(10));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop(true).map(|e| e.item))
        };
        thread::sleep(Duration::from_millis(30));
        q.abort();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Aborted));
        // 中止后的 pop/push 立即返回
        assert_eq!(q.pop(true).map(|e| e.item), Err(QueueError::Aborted));
        assert_eq!(q.push(Item(1)), Err(QueueError::Aborted));
    }

    #[test]
    fn test_abort_wakes_blocked_push_on_full_queue() {
        let q = started(Capacity::Hard(1));
        q.push(Item(0)).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(Item(1)))
        };
        thread::sleep(Duration::from_millis(30));
        q.abort();
        assert_eq!(producer.join().unwrap(), Err(QueueError::Aborted));
    }

    #[test]
    fn test_hard_capacity_blocks_until_pop() {
        let q = started(Capacity::Hard(2));
        q.push(Item(0)).unwrap();
        q.push(Item(1)).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(Item(2)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(true).unwrap().item, Item(0));
        producer.join().unwrap().unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_advisory_capacity_never_blocks() {
        let q = started(Capacity::Advisory(1));
        for i in 0..5 {
            q.push(Item(i)).unwrap();
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.bytes(), 500);
        assert!((q.total_duration() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_non_blocking_pop_on_empty() {
        let q = started(Capacity::Advisory(4));
        assert_eq!(q.pop(false).map(|e| e.item), Err(QueueError::Empty));
    }

    #[test]
    fn test_pop_timeout() {
        let q = started(Capacity::Advisory(4));
        let start = Instant::now();
        assert_eq!(
            q.pop_timeout(Duration::from_millis(20)).map(|e| e.item),
            Err(QueueError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_flush_bumps_serial_and_tags_entries() {
        let q = started(Capacity::Advisory(8));
        let s1 = q.serial();
        q.push(Item(1)).unwrap();
        let s2 = q.flush();
        assert_eq!(s2, s1 + 1);
        assert!(q.is_empty());
        assert_eq!(q.bytes(), 0);

        q.push(Item(2)).unwrap();
        let entry = q.pop(false).unwrap();
        assert_eq!(entry.serial, s2);
    }

    #[test]
    fn test_double_flush_is_idempotent_on_contents() {
        let q = started(Capacity::Advisory(8));
        q.push(Item(1)).unwrap();
        let before = q.serial();
        q.flush();
        q.flush();
        assert!(q.is_empty());
        assert_eq!(q.serial(), before + 2);
    }

    #[test]
    fn test_stale_entries_detectable_by_serial() {
        let q = started(Capacity::Advisory(8));
        q.push(Item(1)).unwrap();
        let stale = q.pop(false).unwrap();
        q.flush();
        assert_ne!(stale.serial, q.serial());
    }

    #[test]
    fn test_wait_for_len() {
        let q = started(Capacity::Advisory(8));
        assert_eq!(
            q.wait_for_len(1, Some(Duration::from_millis(10))),
            Err(QueueError::Timeout)
        );
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                q.push(Item(9)).unwrap();
            })
        };
        assert_eq!(q.wait_for_len(1, Some(Duration::from_secs(2))), Ok(()));
        producer.join().unwrap();
        assert_eq!(q.nth(0).map(|e| e.item), Some(Item(9)));
    }
}
