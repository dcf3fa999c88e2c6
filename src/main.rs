//! pcm-bridge - 低延迟 PCM 输出演示
//!
//! 用默认引擎打开一个流，播放正弦波，结束后打印统计：
//! - callback: 引擎拉取，underrun 增量随回调送达
//! - write: 调用方阻塞写入，带预缓冲自动启动

use std::f32::consts::TAU;
use std::io::{self, Write as IoWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use pcm_bridge::audio::{
    build_config, default_backend, ChannelCount, ChannelErrorReporter, ProducerStatus,
    SharingMode, StreamConfig, StreamManager, StreamSession, WriteOptions,
};

/// 正弦波发生器
struct Tone {
    phase: f32,
    step: f32,
    amplitude: f32,
}

impl Tone {
    fn new(frequency: f32, sample_rate: i32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
            amplitude: i16::MAX as f32 * 0.25,
        }
    }

    /// 填充交织 buffer，每帧所有声道同值
    fn fill(&mut self, buffer: &mut [i16], channels: usize) {
        for frame in buffer.chunks_exact_mut(channels) {
            let sample = (self.phase.sin() * self.amplitude) as i16;
            frame.fill(sample);
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// pcm-bridge - Low-latency PCM output bridge
#[derive(Parser)]
#[command(name = "pcm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    rate: i32,

    /// Frames per engine burst (process-wide default)
    #[arg(short, long, default_value = "192")]
    burst: i32,

    /// Buffer capacity in frames
    #[arg(short, long, default_value = "960")]
    capacity: i32,

    /// Channel count (1 or 2)
    #[arg(long, default_value = "2")]
    channels: i32,

    /// Share the device instead of opening it exclusively
    #[arg(long)]
    shared: bool,

    /// Tone frequency in Hz
    #[arg(long, default_value = "440")]
    frequency: f32,

    /// Playback duration in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Engine pulls frames through the realtime callback
    Callback,

    /// Caller pushes frames with blocking writes
    Write {
        /// Per-write timeout in milliseconds (0 waits forever)
        #[arg(short, long, default_value = "0")]
        timeout_ms: u64,

        /// Writes to buffer before the stream starts (0 starts immediately)
        #[arg(short, long, default_value = "2")]
        prebuffer: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let sharing = if cli.shared {
        SharingMode::Shared
    } else {
        SharingMode::Exclusive
    };
    let config = build_config(cli.rate, cli.burst, cli.capacity, sharing)
        .with_channels(ChannelCount::from_count(cli.channels)?);

    let manager = StreamManager::new(Arc::from(default_backend()));
    println!(
        "pcm-bridge - {} backend, {}Hz, {}ch, burst {}, capacity {} frames",
        manager.backend().name(),
        config.sample_rate,
        config.channel_count.count(),
        config.frames_per_burst,
        config.buffer_capacity_frames
    );
    println!("Press Ctrl+C to stop.\n");

    let deadline = Instant::now() + Duration::from_secs(cli.duration);

    match cli.command {
        Commands::Callback => run_callback(&manager, config, cli.frequency, &running, deadline),
        Commands::Write {
            timeout_ms,
            prebuffer,
        } => {
            let mut options = WriteOptions::default().with_prebuffer_writes(prebuffer);
            if timeout_ms > 0 {
                options = options.with_timeout(Duration::from_millis(timeout_ms));
            }
            run_write(&manager, config, options, cli.frequency, &running, deadline)
        }
    }
}

/// 回调模式播放
fn run_callback(
    manager: &StreamManager,
    config: StreamConfig,
    frequency: f32,
    running: &Arc<AtomicBool>,
    deadline: Instant,
) -> anyhow::Result<()> {
    let channels = config.channel_count.count();
    let mut tone = Tone::new(frequency, config.sample_rate);
    let keep_going = running.clone();
    let producer = move |buffer: &mut [i16], _frames: usize, _underrun_delta: i32| {
        tone.fill(buffer, channels);
        if keep_going.load(Ordering::Relaxed) {
            ProducerStatus::Continue
        } else {
            ProducerStatus::Stop
        }
    };
    let (reporter, errors) = ChannelErrorReporter::bounded(16);

    let mut session =
        manager.open_callback(config, Box::new(producer), Some(Arc::new(reporter)))?;
    session.start()?;

    while running.load(Ordering::SeqCst)
        && Instant::now() < deadline
        && !session.is_stopped_by_producer()
    {
        for code in errors.try_iter() {
            log::warn!("Engine reported error {}", code);
        }
        print_progress(&session)?;
        std::thread::sleep(Duration::from_millis(50));
    }

    finish(session)
}

/// 写入模式播放
fn run_write(
    manager: &StreamManager,
    config: StreamConfig,
    options: WriteOptions,
    frequency: f32,
    running: &Arc<AtomicBool>,
    deadline: Instant,
) -> anyhow::Result<()> {
    let channels = config.channel_count.count();
    let frames_per_write = (config.frames_per_burst.max(1) as usize) * 2;
    let mut tone = Tone::new(frequency, config.sample_rate);
    let mut buffer = vec![0i16; frames_per_write * channels];

    let auto_start = options.prebuffer_writes > 0;
    let mut session = manager.open_write(config, options)?;
    if !auto_start {
        session.start()?;
    }
    let mut last_progress = Instant::now();

    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        tone.fill(&mut buffer, channels);
        let written = session.write_frames(&buffer, frames_per_write)?;
        if written == 0 {
            log::warn!("Engine accepted no frames, retrying");
        }
        if last_progress.elapsed() >= Duration::from_millis(50) {
            print_progress(&session)?;
            last_progress = Instant::now();
        }
    }

    finish(session)
}

fn print_progress(session: &StreamSession) -> anyhow::Result<()> {
    let stats = session.stats();
    let underruns = match session.underrun_count() {
        Ok(n) => n.to_string(),
        Err(_) => "n/a".to_string(),
    };
    print!(
        "\r  Callbacks: {:8}  |  Written: {:10}  |  Underruns: {}  ",
        stats.callback_count(),
        stats.frames_written(),
        underruns
    );
    io::stdout().flush()?;
    Ok(())
}

fn finish(mut session: StreamSession) -> anyhow::Result<()> {
    println!("\n");
    let report = session.close()?;
    println!("{}", report);
    Ok(())
}
