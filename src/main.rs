use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use myy_engine::core::{EngineConfig, PlaybackState, PlayerEvent, TrackType, VideoFrame};
use myy_engine::output::{CpalOutput, VideoSink};
use myy_engine::player::{Decoder, DemuxerSource, FfmpegSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 无界面播放器：音频走默认设备，视频帧只记录日志
#[derive(Parser, Debug)]
#[command(name = "myy-play", version, about)]
struct Args {
    /// 本地文件或网络 URL
    url: String,

    /// 不输出音频
    #[arg(long)]
    no_audio: bool,

    /// 不渲染视频
    #[arg(long)]
    no_video: bool,

    /// 播放速率
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    /// 起始位置（毫秒）
    #[arg(long)]
    start: Option<i64>,

    /// 音频轨道编号
    #[arg(long)]
    audio_track: Option<usize>,

    /// 字幕轨道编号
    #[arg(long)]
    subtitle_track: Option<usize>,

    /// 音量 (0.0 - 1.0)
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// 以 JSON 打印轨道和元数据后退出
    #[arg(long)]
    info: bool,

    /// 管线参数（JSON）
    #[arg(long)]
    config: Option<PathBuf>,
}

/// 只打日志的视频输出
#[derive(Default)]
struct LoggingVideoSink {
    frames: AtomicU64,
}

impl VideoSink for LoggingVideoSink {
    fn set_video_frame(&self, frame: Option<VideoFrame>) {
        match frame {
            Some(frame) => {
                let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 100 == 1 {
                    info!("🖼️ 第 {} 帧: pts={}ms {}x{}", count, frame.pts, frame.width, frame.height);
                } else {
                    debug!("🖼️ 帧 pts={}ms", frame.pts);
                }
            }
            None => debug!("🖼️ 画面已清空"),
        }
    }

    fn set_subtitle_text(&self, text: Option<String>) {
        match text {
            Some(text) => info!("💬 {}", text),
            None => debug!("💬 字幕清除"),
        }
    }
}

fn print_info(url: &str) -> Result<()> {
    let source = FfmpegSource::open(url).with_context(|| format!("无法打开 {}", url))?;
    let report = serde_json::json!({
        "source": source.description(),
        "duration_ms": source.duration(),
        "seekable": source.is_seekable(),
        "metadata": source.metadata(),
        "streams": source.streams(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    if args.info {
        return print_info(&args.url);
    }

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("无法读取配置 {}", path.display()))?,
        None => EngineConfig::default(),
    };
    info!("🎬 myy-play 启动: {}", args.url);

    let mut decoder = Decoder::new(config);
    let video_sink = Arc::new(LoggingVideoSink::default());
    if !args.no_video {
        decoder.set_video_sink(Some(video_sink.clone()));
    }
    if !args.no_audio {
        let output = CpalOutput::new();
        output.set_volume(args.volume);
        decoder.set_audio_output(Some(Arc::new(output)));
    }

    decoder.set_url(&args.url).with_context(|| format!("无法打开 {}", args.url))?;
    for kind in TrackType::ALL {
        info!("{} 轨道: {} 条, 当前 {:?}", kind.as_str(), decoder.tracks(kind).len(), decoder.active_track(kind));
    }

    if args.audio_track.is_some() {
        decoder.set_active_track(TrackType::Audio, args.audio_track);
    }
    if args.subtitle_track.is_some() {
        decoder.set_active_track(TrackType::Subtitle, args.subtitle_track);
    }
    if (args.rate - 1.0).abs() > f64::EPSILON {
        decoder.set_playback_rate(args.rate);
    }
    if let Some(start) = args.start {
        decoder.seek(start);
    }
    decoder.play();

    let mut last_report = 0;
    'playback: loop {
        for event in decoder.poll_events() {
            match event {
                PlayerEvent::PositionChanged(position) => {
                    if (position - last_report).abs() >= 1000 {
                        last_report = position;
                        info!("⏱️ {} / {} ms", position, decoder.duration());
                    }
                }
                PlayerEvent::Error { kind, message } => {
                    error!("❌ {:?}: {}", kind, message);
                    if decoder.state() == PlaybackState::Closed {
                        break 'playback;
                    }
                }
                PlayerEvent::TrackResynced { track, position } => {
                    info!("🔀 {} 轨道在 {}ms 重新同步", track.as_str(), position);
                }
                PlayerEvent::EndOfMedia => {
                    info!("🏁 播放完毕，共 {} 帧", video_sink.frames.load(Ordering::Relaxed));
                    break 'playback;
                }
                other => debug!("事件: {:?}", other),
            }
        }
        if decoder.state() == PlaybackState::Closed {
            warn!("会话已关闭");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    decoder.close();
    Ok(())
}
