use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use log::{error, info, warn};
use myy_playback::core::{FrameDrop, PlayerConfig, PlayerEvent, SyncMode};
use myy_playback::player::{AudioDevice, DefaultSourceFactory, NullAudioDevice, PlaybackController};
use myy_playback::renderer::NullRenderer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncArg {
    Audio,
    Video,
    Ext,
}

#[derive(Debug, Parser)]
#[command(name = "myy_playback", version, about = "无界面播放器：按主时钟驱动音视频同步")]
struct Args {
    /// 媒体地址（文件、网络流或 synthetic://名称?duration=10）
    url: String,

    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 主时钟
    #[arg(long, value_enum)]
    sync: Option<SyncArg>,

    /// 播放次数（0 = 无限循环）
    #[arg(long = "loop")]
    loop_count: Option<u32>,

    /// 起始位置（秒）
    #[arg(long)]
    seek: Option<f64>,

    /// 最多播放多少秒后停止
    #[arg(long)]
    duration: Option<f64>,

    /// 禁止丢帧
    #[arg(long)]
    no_framedrop: bool,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_video: bool,

    /// 使用系统音频输出（需启用 cpal-output 特性）
    #[arg(long)]
    cpal: bool,
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_json_file(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    if let Some(sync) = args.sync {
        config.sync_mode = match sync {
            SyncArg::Audio => SyncMode::Audio,
            SyncArg::Video => SyncMode::Video,
            SyncArg::Ext => SyncMode::External,
        };
    }
    if let Some(count) = args.loop_count {
        config.loop_count = count;
    }
    if args.no_framedrop {
        config.frame_drop = FrameDrop::Never;
    }
    config.disable_audio |= args.no_audio;
    config.disable_video |= args.no_video;
    config.auto_exit = true;
    Ok(config)
}

fn audio_device(use_cpal: bool) -> Arc<dyn AudioDevice> {
    #[cfg(feature = "cpal-output")]
    if use_cpal {
        return Arc::new(myy_playback::player::CpalAudioDevice);
    }
    if use_cpal {
        warn!("⚠ 未启用 cpal-output 特性，使用软件音频设备");
    }
    Arc::new(NullAudioDevice)
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("🎬 MYY Playback 启动");

    let mut player = PlaybackController::new(config, Arc::new(DefaultSourceFactory), audio_device(args.cpal));
    let events = player.events();
    let renderer = NullRenderer::default();
    let render_log = renderer.log();

    let media_info = player
        .play(&args.url, Box::new(renderer))
        .with_context(|| format!("播放失败: {}", args.url))?;
    info!("媒体信息: {:?}", media_info);

    if let Some(position) = args.seek {
        player.seek(position, false)?;
    }

    let started = Instant::now();
    let limit = args.duration.map(Duration::from_secs_f64);
    loop {
        if limit.map_or(false, |limit| started.elapsed() >= limit) {
            info!("⏱ 达到播放时长上限");
            break;
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PlayerEvent::Position(pos)) => info!("▶ {:.1}s", pos),
            Ok(PlayerEvent::FrameDimensionsChanged(w, h)) => info!("📐 {}x{}", w, h),
            Ok(PlayerEvent::Error(msg)) => error!("❌ {}", msg),
            Ok(PlayerEvent::EndOfMedia) => {
                info!("🏁 播放结束");
                break;
            }
            Ok(PlayerEvent::Stopped) => break,
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (early, late) = player.drop_stats();
    player.stop();
    let log = render_log.lock();
    info!(
        "✅ 已停止：显示 {} 帧，绘制 {} 次，丢帧 {}/{}",
        log.uploads.len(),
        log.presents,
        early,
        late
    );
    Ok(())
}
