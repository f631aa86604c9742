use crate::core::{AudioFormat, PlayerError, Result};
use crate::output::{AudioOutput, AudioStream};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 默认输出设备（cpal）
pub struct CpalOutput {
    volume: Arc<Mutex<f32>>,
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalOutput {
    pub fn new() -> Self {
        Self {
            volume: Arc::new(Mutex::new(1.0)),
        }
    }

    /// 设置音量 (0.0 - 1.0)，对已打开的流立即生效
    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    fn supports(device: &Device, config: &StreamConfig) -> Result<bool> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported.any(|range| Self::is_config_compatible(config, &range)))
    }

    /// 先试请求的格式，不支持时依次回退到常见格式
    fn choose_config(device: &Device, requested: AudioFormat) -> Result<StreamConfig> {
        let config = |rate: u32, channels: u16| StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let wanted = config(requested.sample_rate, requested.channels);
        if Self::supports(device, &wanted)? {
            return Ok(wanted);
        }

        warn!(
            "⚠️  音频设备不支持 {} Hz, {} 声道，尝试回退配置",
            requested.sample_rate, requested.channels
        );
        let fallbacks = [
            (48000, requested.channels),
            (44100, requested.channels),
            (48000, 2),
            (44100, 2),
            (48000, 1),
            (44100, 1),
        ];
        for (rate, channels) in fallbacks {
            let candidate = config(rate, channels);
            if Self::supports(device, &candidate)? {
                info!("✅ 使用回退配置: {} Hz, {} 声道", rate, channels);
                return Ok(candidate);
            }
        }

        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            requested.sample_rate, requested.channels
        )))
    }
}

impl AudioOutput for CpalOutput {
    fn open(&self, requested: AudioFormat, buffer_usecs: i64) -> Result<Box<dyn AudioStream>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = Self::choose_config(&device, requested)?;
        let format = AudioFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };
        let capacity = (format.bytes_for_duration(buffer_usecs) / std::mem::size_of::<f32>())
            .max(format.channels as usize * 256);

        let queue = Arc::new(SegQueue::new());
        let played = Arc::new(AtomicU64::new(0));
        let volume = self.volume.clone();

        let stream = {
            let queue = queue.clone();
            let played = played.clone();
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let vol = *volume.lock();
                        let mut count = 0u64;
                        for sample in data.iter_mut() {
                            *sample = match queue.pop() {
                                Some(value) => {
                                    count += 1;
                                    value * vol
                                }
                                None => 0.0,
                            };
                        }
                        played.fetch_add(count, Ordering::AcqRel);
                    },
                    move |err| {
                        warn!("音频流错误: {}", err);
                    },
                    None,
                )
                .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?
        };
        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        info!(
            "音频输出已启动: {} Hz, {} 声道, 缓冲 {} 采样",
            format.sample_rate, format.channels, capacity
        );
        Ok(Box::new(CpalStream {
            _stream: stream,
            format,
            queue,
            played,
            capacity,
        }))
    }
}

/// cpal 输出流：写端是渲染线程，读端是设备回调
struct CpalStream {
    _stream: cpal::Stream,
    format: AudioFormat,
    queue: Arc<SegQueue<f32>>,
    played: Arc<AtomicU64>,
    capacity: usize,
}

// cpal::Stream 不是 Send；它只会在音频渲染线程上被写入和释放
unsafe impl Send for CpalStream {}

impl AudioStream for CpalStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        // 只接受整帧
        let channels = self.format.channels.max(1) as usize;
        let space = self.capacity.saturating_sub(self.queue.len());
        let count = samples.len().min(space) / channels * channels;
        for sample in &samples[..count] {
            self.queue.push(*sample);
        }
        count
    }

    fn buffer_size(&self) -> usize {
        self.capacity * std::mem::size_of::<f32>()
    }

    fn processed_usecs(&self) -> i64 {
        let frames = self.played.load(Ordering::Acquire) / self.format.channels.max(1) as u64;
        (frames * 1_000_000 / self.format.sample_rate.max(1) as u64) as i64
    }

    fn reset(&mut self) {
        while self.queue.pop().is_some() {}
        self.played.store(0, Ordering::Release);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        debug!("音频输出已停止");
    }
}
