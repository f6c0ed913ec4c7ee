//! Test sequence generator: writes a synthetic animated volume to disk.
//!
//! Usage: cargo run --release --bin gen_test_sequence -- [OPTIONS]
//!
//! Options:
//!   --name <NAME>        Sequence name / file stem (default: "smoke")
//!   --frames <N>         Number of frames (default: 48)
//!   --lods <N>           LOD levels per frame (default: 3)
//!   --resolution <R>     Grid resolution of the finest LOD (default: 32)
//!   --fps <F>            Frame rate (default: 30)
//!   --out <DIR>          Output directory (default: "assets/sequences")
//!   --jobs <N>           Max parallel frame builds (default: 4)
//!   --corrupt <FRAME>    Write garbage for one frame (exercises failure paths)
//!
//! Output structure:
//!   <out>/
//!     <name>.vdbs          # Concatenated LZ4/rkyv grid blobs
//!     <name>.json          # Manifest: frame rate + (offset, length) per frame and LOD

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use glam::Vec3;
use rayon::prelude::*;

use vdbstream::streaming::disk_io::{compress_grid, GridRecord, SequenceWriter};
use vdbstream::streaming::upload::gpu_layout_size;

/// One encoded grid, ready to append
struct EncodedGrid {
    frame: u32,
    level: u8,
    blob: Vec<u8>,
    uncompressed_size: u64,
    active_voxels: u64,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let args: Vec<String> = std::env::args().collect();
    let name = parse_str_arg(&args, "--name").unwrap_or_else(|| "smoke".to_string());
    let frames = parse_u32_arg(&args, "--frames").unwrap_or(48).max(1);
    let lods = parse_u32_arg(&args, "--lods").unwrap_or(3).clamp(1, 8) as u8;
    let resolution = parse_u32_arg(&args, "--resolution").unwrap_or(32).max(2);
    let fps = parse_f32_arg(&args, "--fps").unwrap_or(30.0);
    let out_dir = PathBuf::from(parse_str_arg(&args, "--out").unwrap_or_else(|| "assets/sequences".to_string()));
    let jobs = parse_usize_arg(&args, "--jobs").unwrap_or(4);
    let corrupt = parse_u32_arg(&args, "--corrupt");

    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build_global()
        .expect("Failed to configure thread pool");

    println!("=== vdbstream Test Sequence Generator ===");
    println!("Sequence:   {}", name);
    println!("Frames:     {} at {} fps", frames, fps);
    println!("LODs:       {} (finest {}^3)", lods, resolution);
    println!("Jobs:       {} parallel", jobs);
    println!("Output:     {}", out_dir.display());
    println!();

    // Phase 1: build and compress every (frame, LOD) grid in parallel
    let start = Instant::now();
    let built = AtomicUsize::new(0);
    let total = frames as usize * lods as usize;

    let keys: Vec<(u32, u8)> = (0..frames)
        .flat_map(|frame| (0..lods).map(move |level| (frame, level)))
        .collect();

    let mut grids: Vec<EncodedGrid> = keys
        .par_iter()
        .map(|&(frame, level)| {
            let level_resolution = (resolution >> (lods - 1 - level)).max(2);
            let record = build_grid(frame, frames, level_resolution);
            let blob = if corrupt == Some(frame) {
                let mut garbage = vec![16, 0, 0, 0];
                garbage.extend(std::iter::repeat_n(0xEE, 60));
                garbage
            } else {
                compress_grid(&record).expect("Failed to compress grid")
            };

            let done = built.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 50 == 0 || done == total {
                eprintln!("  [{}/{}] grids built", done, total);
            }

            EncodedGrid {
                frame,
                level,
                blob,
                uncompressed_size: gpu_layout_size(record.tree.len() as u64),
                active_voxels: record.active_voxel_count,
            }
        })
        .collect();
    grids.sort_by_key(|g| (g.frame, g.level));

    // Phase 2: append in frame order and write the manifest
    let data_path = out_dir.join(format!("{}.vdbs", name));
    let mut writer = SequenceWriter::create(&data_path).expect("Failed to create data file");
    let mut compressed_bytes = 0u64;
    let mut voxels = 0u64;
    for grid in &grids {
        writer
            .append_blob(grid.frame, grid.level, &grid.blob, grid.uncompressed_size)
            .expect("Failed to append grid");
        compressed_bytes += grid.blob.len() as u64;
        voxels += grid.active_voxels;
    }

    let manifest = writer.finish(&name, fps).expect("Failed to finish data file");
    let manifest_path = out_dir.join(format!("{}.json", name));
    manifest.save(&manifest_path).expect("Failed to write manifest");

    let elapsed = start.elapsed();
    println!();
    println!("=== Generation Complete ===");
    println!("Grids:  {} in {:.2}s", grids.len(), elapsed.as_secs_f64());
    println!("Voxels: {} active across all grids", voxels);
    println!("Size:   {:.1} KB on disk", compressed_bytes as f64 / 1024.0);
    if let Some(frame) = corrupt {
        println!("Frame {} written corrupt", frame);
    }
    println!("Manifest: {}", manifest_path.display());
    println!();
    println!("To play this sequence:");
    println!("  cargo run --release --bin play_sequence -- --manifest {}", manifest_path.display());
}

/// A pulsing, drifting ball of density sampled on a `resolution`^3 grid.
///
/// The tree payload is one occupancy byte per cell.
fn build_grid(frame: u32, frames: u32, resolution: u32) -> GridRecord {
    let t = frame as f32 / frames as f32;
    let phase = t * std::f32::consts::TAU;
    let center = Vec3::new(0.5 + 0.15 * phase.cos(), 0.4 + 0.3 * t, 0.5 + 0.15 * phase.sin());
    let radius = 0.25 + 0.08 * (phase * 2.0).sin();

    let cell = 1.0 / resolution as f32;
    let mut tree = Vec::with_capacity((resolution * resolution * resolution) as usize);
    let mut active = 0u64;
    for z in 0..resolution {
        for y in 0..resolution {
            for x in 0..resolution {
                let p = (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * cell;
                let density = 1.0 - (p - center).length() / radius;
                let value = (density.clamp(0.0, 1.0) * 255.0) as u8;
                if value > 0 {
                    active += 1;
                }
                tree.push(value);
            }
        }
    }

    let min = (center - Vec3::splat(radius)).max(Vec3::ZERO);
    let max = (center + Vec3::splat(radius)).min(Vec3::ONE);
    GridRecord {
        bounds_min: min.to_array(),
        bounds_max: max.to_array(),
        active_voxel_count: active,
        tree,
    }
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
