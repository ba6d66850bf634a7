use crossbeam::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 单调墙上时间（秒），以进程内第一次调用为零点
pub fn wall_time() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 包队列 serial 的共享引用，时钟据此判断自身读数是否过期
pub type SerialRef = Arc<AtomicU64>;

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: f64,            // 最近一次设置的值（秒），NaN 表示尚无数据
    last_updated: f64,   // 最近一次设置时的墙上时间
    speed: f64,          // 播放速率
    serial: u64,         // 所属的解码代次
    paused: bool,
}

// 按位比较：`fetch_update` 的比较交换需要 Eq，NaN 也要能与自身相等
impl PartialEq for ClockState {
    fn eq(&self, other: &Self) -> bool {
        self.pts.to_bits() == other.pts.to_bits()
            && self.last_updated.to_bits() == other.last_updated.to_bits()
            && self.speed.to_bits() == other.speed.to_bits()
            && self.serial == other.serial
            && self.paused == other.paused
    }
}

impl Eq for ClockState {}

impl ClockState {
    fn value_at(&self, time: f64) -> f64 {
        if self.paused {
            self.pts
        } else {
            self.pts + (time - self.last_updated) * self.speed
        }
    }
}

/// 播放时钟 - 用于音视频同步
///
/// 整个状态放在一个 `AtomicCell` 里，读者不会看到半更新的结构。
/// 外部时钟有多个写者：读线程 Seek 时 `set`，音频回调和刷新循环 `sync_to_slave`，
/// 刷新循环 `set_speed`。所以每个写操作都用 `fetch_update` 做比较交换，
/// 基于过期快照的写入会重试，不会覆盖别人的更新。
pub struct Clock {
    name: &'static str,
    state: AtomicCell<ClockState>,
    /// 关联包队列的 serial；None 表示独立时钟（外部时钟），永远不过期
    queue_serial: Option<SerialRef>,
}

impl Clock {
    pub fn new(name: &'static str, queue_serial: Option<SerialRef>) -> Self {
        Self {
            name,
            state: AtomicCell::new(ClockState {
                pts: f64::NAN,
                last_updated: wall_time(),
                speed: 1.0,
                serial: 0,
                paused: false,
            }),
            queue_serial,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 时钟 serial 与当前解码代次不一致时，读数视为过期
    pub fn is_stale(&self) -> bool {
        self.is_stale_state(&self.state.load())
    }

    fn is_stale_state(&self, st: &ClockState) -> bool {
        match &self.queue_serial {
            Some(q) => q.load(Ordering::Acquire) != st.serial,
            None => false,
        }
    }

    fn read_state(&self, st: &ClockState, time: f64) -> Option<f64> {
        if self.is_stale_state(st) {
            return None;
        }
        let value = st.value_at(time);
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    /// 当前时间（秒）；过期或尚未设置时返回 None
    pub fn get(&self) -> Option<f64> {
        self.get_at(wall_time())
    }

    /// 在指定墙上时间的读数
    pub fn get_at(&self, time: f64) -> Option<f64> {
        self.read_state(&self.state.load(), time)
    }

    /// 覆盖值与锚定时间，保留速率
    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, wall_time());
    }

    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        let _ = self.state.fetch_update(|st| {
            Some(ClockState {
                pts,
                last_updated: time,
                serial,
                ..st
            })
        });
    }

    /// 调整速率：先以当前读数重新锚定，避免速率切换产生跳变
    pub fn set_speed(&self, speed: f64) {
        let now = wall_time();
        let _ = self.state.fetch_update(|st| {
            Some(ClockState {
                pts: self.read_state(&st, now).unwrap_or(f64::NAN),
                last_updated: now,
                speed,
                ..st
            })
        });
    }

    pub fn speed(&self) -> f64 {
        self.state.load().speed
    }

    pub fn serial(&self) -> u64 {
        self.state.load().serial
    }

    pub fn last_updated(&self) -> f64 {
        self.state.load().last_updated
    }

    pub fn is_paused(&self) -> bool {
        self.state.load().paused
    }

    /// 暂停/恢复
    ///
    /// 必须先按旧状态取得当前读数并重新锚定，再翻转 paused，
    /// 否则暂停期间时钟仍会继续走。
    pub fn set_paused(&self, paused: bool) {
        let now = wall_time();
        let _ = self.state.fetch_update(|st| {
            (st.paused != paused).then(|| ClockState {
                pts: st.value_at(now),
                last_updated: now,
                paused,
                ..st
            })
        });
    }

    /// 两个时钟相差超过阈值且从时钟有有效数据时，把本时钟重新锚定到从时钟
    ///
    /// 返回是否发生了重新锚定
    pub fn sync_to_slave(&self, slave: &Clock, threshold: f64) -> bool {
        let now = wall_time();
        let Some(slave_value) = slave.get_at(now) else {
            return false;
        };
        let slave_serial = slave.serial();
        self.state
            .fetch_update(|st| {
                let needs_anchor = match self.read_state(&st, now) {
                    Some(value) => (value - slave_value).abs() > threshold,
                    None => true,
                };
                needs_anchor.then(|| ClockState {
                    pts: slave_value,
                    last_updated: now,
                    serial: slave_serial,
                    ..st
                })
            })
            .is_ok()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.load();
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("pts", &st.pts)
            .field("speed", &st.speed)
            .field("serial", &st.serial)
            .field("paused", &st.paused)
            .field("stale", &self.is_stale())
            .finish()
    }
}
