use crate::core::{AudioSamples, PlayerError, Result};
use log::{debug, info};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

/// 每次送入 rubato 的输入帧数
const CHUNK_FRAMES: usize = 256;
/// 同步校正最多 ±10%，比例上限留出余量
const MAX_RELATIVE_RATIO: f64 = 1.25;

/// 把一帧音频映射到目标声道数（交织格式，采样率不变）
///
/// 多声道到单声道取平均，少声道到多声道按序循环复制。
pub fn map_channels(samples: &AudioSamples, out_channels: u16) -> Vec<f32> {
    let in_channels = samples.channels.max(1) as usize;
    let out_channels = out_channels.max(1) as usize;
    if in_channels == out_channels {
        return samples.data.clone();
    }
    let frames = samples.data.len() / in_channels;
    let mut out = Vec::with_capacity(frames * out_channels);
    for frame in samples.data.chunks_exact(in_channels) {
        if out_channels == 1 {
            out.push(frame.iter().sum::<f32>() / in_channels as f32);
        } else {
            out.extend((0..out_channels).map(|c| frame[c % in_channels]));
        }
    }
    out
}

/// 流式音频重采样器
///
/// 完成源采样率到设备采样率的转换，并按同步引擎给出的比例
/// 做 ±10% 以内的伸缩。输入按块送入 rubato，不足一块的采样留到下一帧。
pub struct AudioResampler {
    inner: SincFixedIn<f32>,
    source_rate: u32,
    target_rate: u32,
    channels: usize,
    /// 每声道尚未送入 rubato 的输入
    pending: Vec<Vec<f32>>,
}

impl AudioResampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Result<Self> {
        let channels = channels.max(1) as usize;
        let ratio = target_rate as f64 / source_rate.max(1) as f64;
        let parameters = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(ratio, MAX_RELATIVE_RATIO, parameters, CHUNK_FRAMES, channels)
            .map_err(|e| PlayerError::Other(format!("创建音频重采样器失败: {}", e)))?;
        info!(
            "🔄 创建音频重采样器: {} Hz -> {} Hz, 声道: {}",
            source_rate, target_rate, channels
        );
        Ok(Self {
            inner,
            source_rate,
            target_rate,
            channels,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels],
        })
    }

    /// 参数是否与当前重采样器一致（不一致时需要重建）
    pub fn matches(&self, source_rate: u32, target_rate: u32, channels: u16) -> bool {
        self.source_rate == source_rate && self.target_rate == target_rate && self.channels == channels.max(1) as usize
    }

    /// 设置本帧的伸缩比例：输出采样数 / 名义采样数
    pub fn set_compensation(&mut self, factor: f64) -> Result<()> {
        let factor = factor.clamp(1.0 / MAX_RELATIVE_RATIO, MAX_RELATIVE_RATIO);
        self.inner
            .set_resample_ratio_relative(factor, true)
            .map_err(|e| PlayerError::Other(format!("设置音频伸缩比例失败: {}", e)))
    }

    /// 送入一段交织采样，把已经产生的输出追加到 `out`（交织格式）
    pub fn process(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<()> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (channel, sample) in self.pending.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let output = self
                .inner
                .process(&chunk, None)
                .map_err(|e| PlayerError::Other(format!("音频重采样失败: {}", e)))?;
            let frames = output[0].len();
            out.reserve(frames * self.channels);
            for i in 0..frames {
                out.extend(output.iter().map(|channel| channel[i]));
            }
        }
        Ok(())
    }

    /// 已经送入但还没有产生输出的输入时长（秒）
    pub fn pending_duration(&self) -> f64 {
        self.pending[0].len() as f64 / self.source_rate.max(1) as f64
    }
}

impl Drop for AudioResampler {
    fn drop(&mut self) {
        debug!("释放音频重采样器 ({} Hz -> {} Hz)", self.source_rate, self.target_rate);
    }
}
