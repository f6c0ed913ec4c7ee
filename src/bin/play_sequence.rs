//! Sequence player: streams a sequence through the volume streamer.
//!
//! Usage: cargo run --release --bin play_sequence -- --manifest <PATH> [OPTIONS]
//!
//! Options:
//!   --manifest <PATH>    Sequence manifest (required)
//!   --config <PATH>      Streaming config JSON (defaults otherwise)
//!   --budget-mb <MB>     Override the memory budget
//!   --window <N>         Override the prefetch window
//!   --workers <N>        Override the decode worker count
//!   --speed <S>          Playback speed, negative plays backwards (default: 1.0)
//!   --loop               Loop playback
//!   --seconds <S>        Wall time to play (default: one pass)
//!   --host               Upload into host memory instead of a GPU device
//!   --debug-port <PORT>  Serve the status board over TCP

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vdbstream::render::GpuContext;
use vdbstream::streaming::{
    FileGridSource, HostBackend, PlaybackState, StreamingConfig, UploadBackend, VolumeStreamer,
};

/// Simulated display refresh
const TICK: Duration = Duration::from_millis(16);

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(manifest) = parse_str_arg(&args, "--manifest").map(PathBuf::from) else {
        eprintln!("Usage: play_sequence --manifest <PATH> [--config <PATH>] [--host] [--loop] ...");
        std::process::exit(2);
    };

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => StreamingConfig::load(Path::new(&path)).unwrap_or_else(|e| {
            eprintln!("Failed to load config {}: {}", path, e);
            std::process::exit(1);
        }),
        None => StreamingConfig::default(),
    };
    if let Some(mb) = parse_u64_arg(&args, "--budget-mb") {
        config.memory_budget_bytes = mb * 1024 * 1024;
    }
    if let Some(window) = parse_u32_arg(&args, "--window") {
        config.prefetch_window = window;
    }
    if let Some(workers) = parse_usize_arg(&args, "--workers") {
        config.worker_count = workers;
    }
    let speed = parse_f32_arg(&args, "--speed").unwrap_or(1.0);
    let looping = args.iter().any(|a| a == "--loop");
    let host = args.iter().any(|a| a == "--host");

    let backend: Box<dyn UploadBackend> = if host {
        Box::new(HostBackend::new())
    } else {
        match pollster::block_on(GpuContext::headless()) {
            Ok(gpu) => {
                log::info!("Uploading to {}", gpu.adapter_description());
                Box::new(gpu.upload_backend())
            }
            Err(e) => {
                log::warn!("{}; falling back to host memory", e);
                Box::new(HostBackend::new())
            }
        }
    };

    let mut streamer = VolumeStreamer::new(config, Arc::new(FileGridSource), backend).unwrap_or_else(|e| {
        eprintln!("Failed to start streamer: {}", e);
        std::process::exit(1);
    });
    let debug_port = parse_u32_arg(&args, "--debug-port").and_then(|port| u16::try_from(port).ok());
    let _debug_server = debug_port.and_then(|port| {
        match streamer.start_debug_server(port) {
            Ok(server) => Some(server),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    });

    let sequence = streamer.open_sequence(&manifest).unwrap_or_else(|e| {
        eprintln!("Failed to open {}: {}", manifest.display(), e);
        std::process::exit(1);
    });
    let Some(catalog) = streamer.catalog(sequence) else {
        std::process::exit(1);
    };
    let mut playback = PlaybackState::for_catalog(catalog);
    let pass = Duration::from_secs_f32(catalog.duration_secs() / speed.abs().max(0.01));
    let run_for = parse_f32_arg(&args, "--seconds").map(Duration::from_secs_f32).unwrap_or(pass);

    println!("=== vdbstream Player ===");
    println!("Sequence: {} ({} frames at {} fps)", catalog.name(), catalog.frame_count(), catalog.frame_rate());
    println!("Budget:   {:.1} MB", streamer.config().memory_budget_bytes as f64 / (1024.0 * 1024.0));
    println!("Playing:  {:.1}s at {}x{}", run_for.as_secs_f32(), speed, if looping { ", looping" } else { "" });
    println!();

    playback.set_speed(speed);
    playback.set_looping(looping);
    if speed < 0.0 {
        playback.seek(playback.frame_count().saturating_sub(1));
    }
    playback.play();

    let start = Instant::now();
    let mut last = start;
    let mut shown = 0u32;
    let mut unavailable = 0u32;
    let mut buffering_ticks = 0u32;

    while start.elapsed() < run_for {
        let now = Instant::now();
        let dt = (now - last).as_secs_f32();
        last = now;

        let step = match streamer.tick(sequence, &mut playback, dt, now) {
            Ok(step) => step,
            Err(e) => {
                log::error!("Tick failed: {}", e);
                break;
            }
        };
        if playback.is_buffering() {
            buffering_ticks += 1;
        }

        if step.crossed || shown == 0 {
            match streamer.request_current_frame(sequence, step.current) {
                Ok(view) => {
                    shown += 1;
                    log::info!(
                        "frame {:>4}  lod {}  {:>8} voxels  {:>8} bytes",
                        step.current,
                        view.lod,
                        view.handle.active_voxel_count,
                        view.handle.bytes
                    );
                }
                Err(e) => {
                    unavailable += 1;
                    log::warn!("{}", e);
                }
            }
        }
        if step.finished {
            break;
        }

        std::thread::sleep(TICK.saturating_sub(now.elapsed()));
    }

    let stats = streamer.stats();
    println!();
    println!("=== Playback Complete ===");
    println!("Shown:       {} frames ({} unavailable)", shown, unavailable);
    println!("Buffering:   {} ticks", buffering_ticks);
    println!("Loops:       {}", playback.loop_count());
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => log::warn!("Failed to serialize stats: {}", e),
    }

    streamer.close_sequence(sequence);
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
