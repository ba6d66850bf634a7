use crate::core::{wall_time, PlayerError, Result, SerialRef};
use crate::player::audio_output::AudioSpec;
use crate::player::frame_queue::FrameQueue;
use crate::player::resampler::{map_channels, AudioResampler};
use crate::player::sync::{AudioDriftState, SyncEngine};
use crossbeam::atomic::AtomicCell;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 音频取帧最长等待时间的下限
const MIN_FRAME_WAIT: Duration = Duration::from_millis(1);

/// 音频拉取管线：运行在音频设备的回调线程中
///
/// 从采样帧队列取帧（只做有界等待），丢弃过期代次的帧，
/// 采样率与设备不同或音频不是主时钟需要伸缩时交给 [`AudioResampler`]，
/// 最后按设备缓冲延迟更新音频时钟。
pub struct AudioPipeline {
    sampq: Arc<FrameQueue>,
    audioq_serial: SerialRef,
    sync: Arc<SyncEngine>,
    volume: Arc<AtomicCell<f32>>,
    paused: Arc<AtomicBool>,
    /// 设备实际参数（打开设备后写入）
    spec: Arc<AtomicCell<Option<AudioSpec>>>,
    drift: AudioDriftState,
    /// 已转换但尚未交给设备的采样（跨回调保留）
    buf: Vec<f32>,
    buf_index: usize,
    /// 一旦需要重采样就持续使用，直到代次或参数变化
    resampler: Option<AudioResampler>,
    /// buf 末尾对应的音频时间（秒）
    audio_clock: Option<f64>,
    audio_clock_serial: u64,
}

impl AudioPipeline {
    pub fn new(
        sampq: Arc<FrameQueue>,
        audioq_serial: SerialRef,
        sync: Arc<SyncEngine>,
        volume: Arc<AtomicCell<f32>>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let avg_nb = sync.config().audio_diff_avg_nb;
        Self {
            sampq,
            audioq_serial,
            sync,
            volume,
            paused,
            spec: Arc::new(AtomicCell::new(None)),
            drift: AudioDriftState::new(avg_nb, 0.0),
            buf: Vec::new(),
            buf_index: 0,
            resampler: None,
            audio_clock: None,
            audio_clock_serial: 0,
        }
    }

    /// 设备参数句柄：打开设备后写入实际参数，回调才开始输出音频
    pub fn spec_handle(&self) -> Arc<AtomicCell<Option<AudioSpec>>> {
        self.spec.clone()
    }

    /// 设备回调入口
    pub fn fill(&mut self, out: &mut [f32]) {
        let callback_time = wall_time();
        let Some(spec) = self.spec.load() else {
            out.fill(0.0);
            return;
        };
        let volume = self.volume.load().clamp(0.0, 1.0);

        let mut written = 0;
        while written < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.decode_frame(&spec) {
                    // 暂停或没有数据：输出一小段静音
                    let silence = (spec.buffer_samples as usize * spec.channels as usize).max(spec.channels as usize);
                    self.buf.clear();
                    self.buf.resize(silence, 0.0);
                }
                self.buf_index = 0;
            }
            let n = (out.len() - written).min(self.buf.len() - self.buf_index);
            for (dst, src) in out[written..written + n]
                .iter_mut()
                .zip(&self.buf[self.buf_index..self.buf_index + n])
            {
                *dst = src * volume;
            }
            written += n;
            self.buf_index += n;
        }

        if let Some(clock) = self.audio_clock {
            // 设备中还有两个硬件缓冲加上本地剩余采样尚未播放
            let unplayed = (self.buf.len() - self.buf_index) / spec.channels.max(1) as usize;
            let latency = 2.0 * spec.buffer_duration() + unplayed as f64 / spec.sample_rate as f64;
            self.sync
                .update_audio_clock_at(clock - latency, self.audio_clock_serial, callback_time);
        }
    }

    /// 取一帧并转换到 buf；返回 false 表示本次没有可用数据
    fn decode_frame(&mut self, spec: &AudioSpec) -> bool {
        if self.paused.load(Ordering::Acquire) {
            return false;
        }
        // 最多等半个硬件缓冲，避免设备欠载
        let wait = Duration::from_secs_f64(spec.buffer_duration() / 2.0).max(MIN_FRAME_WAIT);
        let frame = loop {
            let frame = match self.sampq.peek_readable(Some(wait)) {
                Ok(frame) => frame,
                Err(_) => return false,
            };
            self.sampq.next();
            if frame.serial == self.audioq_serial.load(Ordering::Acquire) {
                break frame;
            }
            trace!("丢弃过期音频帧 serial={}", frame.serial);
        };
        let Some(samples) = frame.audio() else {
            return false;
        };
        if samples.sample_rate == 0 || samples.channels == 0 {
            return false;
        }

        self.drift.set_threshold(spec.buffer_duration());
        let nb_samples = samples.nb_samples();
        let wanted = match self.sync.synchronize_audio(&mut self.drift, nb_samples, samples.sample_rate) {
            Ok(wanted) => wanted,
            Err(PlayerError::ClockDriftExceeded(diff)) => {
                // 漂移过大不做伸缩，本回调末尾更新音频时钟时外部时钟会重新锚定
                debug!("音频漂移 {:.3}s 超限，跳过校正", diff);
                nb_samples
            }
            Err(_) => nb_samples,
        };

        if frame.serial != self.audio_clock_serial {
            // Seek 之后旧代次残留在重采样器里的输入作废
            self.resampler = None;
        }
        let mapped = map_channels(samples, spec.channels);
        let needs_resample = self.resampler.is_some() || samples.sample_rate != spec.sample_rate || wanted != nb_samples;
        if needs_resample {
            self.buf.clear();
            if let Err(e) = self.resample(&mapped, samples.sample_rate, spec, wanted as f64 / nb_samples.max(1) as f64) {
                warn!("⚠ {}，本帧按原样输出", e);
                self.resampler = None;
                self.buf = mapped;
            }
        } else {
            self.buf = mapped;
        }

        // 还留在重采样器里的输入尚未变成可播放的采样
        let pending = self.resampler.as_ref().map_or(0.0, |r| r.pending_duration());
        self.audio_clock = frame
            .pts
            .map(|pts| pts + nb_samples as f64 / samples.sample_rate as f64 - pending);
        self.audio_clock_serial = frame.serial;
        true
    }

    fn resample(&mut self, mapped: &[f32], source_rate: u32, spec: &AudioSpec, factor: f64) -> Result<()> {
        let resampler = match self.resampler.take() {
            Some(r) if r.matches(source_rate, spec.sample_rate, spec.channels) => r,
            _ => AudioResampler::new(source_rate, spec.sample_rate, spec.channels)?,
        };
        let resampler = self.resampler.insert(resampler);
        resampler.set_compensation(factor)?;
        resampler.process(mapped, &mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AudioSamples, Frame, FramePayload, SyncConfig, SyncMode};
    use std::sync::atomic::AtomicU64;

    struct Fixture {
        pipeline: AudioPipeline,
        sampq: Arc<FrameQueue>,
        serial: SerialRef,
        sync: Arc<SyncEngine>,
        paused: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let sampq = Arc::new(FrameQueue::new("sampq", 9, true));
        sampq.start();
        let serial: SerialRef = Arc::new(AtomicU64::new(1));
        let sync = Arc::new(SyncEngine::new(
            SyncConfig::default(),
            SyncMode::Audio,
            serial.clone(),
            Arc::new(AtomicU64::new(1)),
        ));
        sync.set_has_audio(true);
        let paused = Arc::new(AtomicBool::new(false));
        let pipeline = AudioPipeline::new(
            sampq.clone(),
            serial.clone(),
            sync.clone(),
            Arc::new(AtomicCell::new(1.0)),
            paused.clone(),
        );
        pipeline.spec_handle().store(Some(AudioSpec {
            sample_rate: 1000,
            channels: 1,
            buffer_samples: 10,
        }));
        Fixture {
            pipeline,
            sampq,
            serial,
            sync,
            paused,
        }
    }

    fn audio_frame(pts: f64, serial: u64, value: f32) -> Frame {
        Frame::new(
            FramePayload::Audio(AudioSamples {
                sample_rate: 1000,
                channels: 1,
                data: vec![value; 20],
            }),
            Some(pts),
            0.02,
            None,
            serial,
        )
    }

    #[test]
    fn test_fill_sets_audio_clock_with_latency() {
        let mut f = fixture();
        f.sampq.push(audio_frame(5.0, 1, 0.25)).unwrap();
        let mut out = vec![0.0; 10];
        f.pipeline.fill(&mut out);
        assert!(out.iter().all(|s| (*s - 0.25).abs() < 1e-6));

        // 帧结尾 5.02，减去 2 个硬件缓冲 (0.02) 和剩余 10 个采样 (0.01)
        let clock = f.sync.audclk.get().unwrap();
        assert!((clock - 4.99).abs() < 0.005, "clock = {}", clock);
    }

    #[test]
    fn test_stale_frames_are_skipped() {
        let mut f = fixture();
        f.sampq.push(audio_frame(1.0, 1, 0.1)).unwrap();
        f.serial.store(2, Ordering::SeqCst);
        f.sampq.push(audio_frame(30.0, 2, 0.9)).unwrap();
        let mut out = vec![0.0; 10];
        f.pipeline.fill(&mut out);
        assert!(out.iter().all(|s| (*s - 0.9).abs() < 1e-6));
    }

    #[test]
    fn test_paused_outputs_silence() {
        let mut f = fixture();
        f.paused.store(true, Ordering::SeqCst);
        f.sampq.push(audio_frame(1.0, 1, 0.5)).unwrap();
        let mut out = vec![1.0; 10];
        f.pipeline.fill(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(f.sampq.nb_remaining(), 1);
    }

    #[test]
    fn test_unconfigured_pipeline_is_silent() {
        let mut f = fixture();
        f.pipeline.spec_handle().store(None);
        let mut out = vec![1.0; 4];
        f.pipeline.fill(&mut out);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_rate_mismatch_goes_through_resampler() {
        let mut f = fixture();
        f.pipeline.spec_handle().store(Some(AudioSpec {
            sample_rate: 2000,
            channels: 2,
            buffer_samples: 10,
        }));
        for i in 0..4 {
            let frame = Frame::new(
                FramePayload::Audio(AudioSamples {
                    sample_rate: 1000,
                    channels: 1,
                    data: vec![0.25; 300],
                }),
                Some(i as f64 * 0.3),
                0.3,
                None,
                1,
            );
            f.sampq.push(frame).unwrap();
        }
        // 1000 个立体声输出帧约需 500 个输入采样
        let mut out = vec![0.0; 2000];
        f.pipeline.fill(&mut out);
        assert!(f.pipeline.resampler.is_some());
        let tail = &out[out.len() - 20..];
        assert!(tail.iter().all(|s| (*s - 0.25).abs() < 0.05), "tail = {:?}", tail);
        // 左右声道相同
        assert!(out.chunks_exact(2).all(|lr| lr[0] == lr[1]));
    }
}
