use crate::core::{PlayerError, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 音频设备参数（交错 f32）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// 设备一次回调请求的每声道采样数
    pub buffer_samples: u32,
}

impl AudioSpec {
    pub fn bytes_per_sec(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * std::mem::size_of::<f32>()
    }

    /// 一个硬件缓冲的时长（秒）
    pub fn buffer_duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.buffer_samples as f64 / self.sample_rate as f64
        }
    }
}

/// 拉取回调：设备线程请求把 `out` 填满（交错 f32）
pub type AudioCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// 音频输出设备
pub trait AudioDevice: Send + Sync {
    /// 打开设备并注册回调；返回的 sink 处于暂停状态，调用 `play()` 后开始回调
    fn open(&self, wanted: AudioSpec, callback: AudioCallback) -> Result<Box<dyn AudioSink>>;
}

/// 已打开的设备句柄（只在打开它的线程中使用）
pub trait AudioSink {
    /// 实际获得的参数
    fn spec(&self) -> AudioSpec;

    fn play(&mut self) -> Result<()>;

    /// 关闭设备：返回后回调不会再被调用
    fn close(&mut self);
}

enum NullCommand {
    Play,
    Close,
}

/// 软件音频设备：按请求参数的实时速率拉取回调并丢弃采样
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioDevice;

impl AudioDevice for NullAudioDevice {
    fn open(&self, wanted: AudioSpec, mut callback: AudioCallback) -> Result<Box<dyn AudioSink>> {
        if wanted.sample_rate == 0 || wanted.channels == 0 || wanted.buffer_samples == 0 {
            return Err(PlayerError::DeviceOpen(format!("无效的音频参数: {:?}", wanted)));
        }
        let spec = wanted;
        let (command_tx, command_rx) = unbounded::<NullCommand>();
        let handle = thread::Builder::new()
            .name("null_audio".to_string())
            .spawn(move || {
                // 先等待 play
                match command_rx.recv() {
                    Ok(NullCommand::Play) => {}
                    _ => return,
                }
                let period = Duration::from_secs_f64(spec.buffer_duration());
                let mut buf = vec![0f32; spec.buffer_samples as usize * spec.channels as usize];
                let mut deadline = Instant::now();
                loop {
                    callback(&mut buf);
                    deadline += period;
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match command_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) | Ok(NullCommand::Play) => {}
                        Ok(NullCommand::Close) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("🔇 软件音频设备线程退出");
            })?;
        info!("🔈 打开软件音频设备: {} Hz, {} 声道, 缓冲 {} 采样", spec.sample_rate, spec.channels, spec.buffer_samples);
        Ok(Box::new(NullSink {
            spec,
            command_tx,
            handle: Some(handle),
        }))
    }
}

struct NullSink {
    spec: AudioSpec,
    command_tx: Sender<NullCommand>,
    handle: Option<JoinHandle<()>>,
}

impl AudioSink for NullSink {
    fn spec(&self) -> AudioSpec {
        self.spec
    }

    fn play(&mut self) -> Result<()> {
        self.command_tx
            .send(NullCommand::Play)
            .map_err(|e| PlayerError::DeviceOpen(format!("音频设备线程已退出: {}", e)))
    }

    fn close(&mut self) {
        let _ = self.command_tx.send(NullCommand::Close);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("⚠ 软件音频设备线程异常退出");
            }
        }
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "cpal-output")]
pub use self::cpal_device::CpalAudioDevice;

#[cfg(feature = "cpal-output")]
mod cpal_device {
    use super::{AudioCallback, AudioDevice, AudioSink, AudioSpec};
    use crate::core::{PlayerError, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{StreamConfig, SupportedStreamConfigRange};
    use log::{debug, error, info, warn};

    /// 默认 cpal 输出设备（支持非标准配置自动回退）
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalAudioDevice;

    impl CpalAudioDevice {
        fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
            config.sample_rate.0 >= supported.min_sample_rate().0
                && config.sample_rate.0 <= supported.max_sample_rate().0
                && config.channels == supported.channels()
        }

        fn supports(device: &cpal::Device, config: &StreamConfig) -> Result<bool> {
            let mut supported = device
                .supported_output_configs()
                .map_err(|e| PlayerError::DeviceOpen(format!("无法获取支持的音频配置: {}", e)))?;
            Ok(supported.any(|range| Self::is_config_compatible(config, &range)))
        }
    }

    impl AudioDevice for CpalAudioDevice {
        fn open(&self, wanted: AudioSpec, mut callback: AudioCallback) -> Result<Box<dyn AudioSink>> {
            info!("初始化音频输出: {} Hz, {} 声道", wanted.sample_rate, wanted.channels);

            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| PlayerError::DeviceOpen("无法找到音频输出设备".to_string()))?;
            debug!("使用音频设备: {}", device.name().unwrap_or_default());

            let mut config = StreamConfig {
                channels: wanted.channels,
                sample_rate: cpal::SampleRate(wanted.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            if !Self::supports(&device, &config)? {
                warn!(
                    "⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置",
                    wanted.sample_rate, wanted.channels
                );
                let fallback = [(48000, 2), (44100, 2), (48000, 1), (44100, 1)];
                let mut found = false;
                for (rate, channels) in fallback {
                    let candidate = StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(rate),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    if Self::supports(&device, &candidate)? {
                        info!("✅ 使用回退配置: {} Hz, {} 声道", rate, channels);
                        config = candidate;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(PlayerError::DeviceOpen(format!(
                        "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                        wanted.sample_rate, wanted.channels
                    )));
                }
            }

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback(data),
                    move |err| error!("音频流错误: {}", err),
                    None,
                )
                .map_err(|e| PlayerError::DeviceOpen(format!("创建音频流失败: {}", e)))?;

            let spec = AudioSpec {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
                buffer_samples: wanted.buffer_samples,
            };
            Ok(Box::new(CpalSink {
                spec,
                stream: Some(stream),
            }))
        }
    }

    struct CpalSink {
        spec: AudioSpec,
        stream: Option<cpal::Stream>,
    }

    impl AudioSink for CpalSink {
        fn spec(&self) -> AudioSpec {
            self.spec
        }

        fn play(&mut self) -> Result<()> {
            if let Some(stream) = &self.stream {
                stream
                    .play()
                    .map_err(|e| PlayerError::DeviceOpen(format!("启动音频流失败: {}", e)))?;
                info!("音频输出已启动");
            }
            Ok(())
        }

        fn close(&mut self) {
            if self.stream.take().is_some() {
                info!("音频输出已停止");
            }
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.close();
        }
    }
}
