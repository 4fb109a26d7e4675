use playa_cache::cli::Args;
use playa_cache::config::{self, CacheSettings};
use playa_cache::core::stats::CacheStats;
use playa_cache::sim::{self, PlaybackOptions, Playhead, SyntheticSource};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn print_stats(stats: &CacheStats) {
    let pct = if stats.capacity > 0 {
        stats.used as f64 * 100.0 / stats.capacity as f64
    } else {
        0.0
    };
    let ranges: Vec<String> = stats
        .cached_ranges
        .iter()
        .map(|(s, e)| if s == e { s.to_string() } else { format!("{}-{}", s, e) })
        .collect();
    println!(
        "cache {:>6.1} MB / {:>6.1} MB ({:>5.1}%)  look-ahead {:>5.2}s  ranges [{}]",
        stats.used as f64 / 1024.0 / 1024.0,
        stats.capacity as f64 / 1024.0 / 1024.0,
        pct,
        stats.look_ahead_seconds,
        ranges.join(", ")
    );
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let settings_path = config::config_file(config::SETTINGS_FILE, &path_config);
    info!("Settings path: {}", settings_path.display());

    let mut settings = CacheSettings::load_or_default(&settings_path);
    settings.apply_env();
    if let Some(mb) = args.capacity_mb {
        settings.capacity_mb = Some(mb);
    }
    if let Some(n) = args.workers {
        settings.workers = Some(n);
    }
    if let Some(fraction) = args.look_behind {
        settings.look_behind_fraction = fraction;
    }
    if let Some(mode) = args.free_mode {
        settings.free_mode = mode.into();
    }
    if let Some(policy) = args.policy {
        settings.caching_mode = policy.into();
    }
    if args.active_tail {
        settings.active_tail_caching = true;
    }

    if args.save_settings {
        settings.save(&settings_path)?;
        info!("Settings saved to {}", settings_path.display());
    }

    let cache = Arc::new(settings.build_cache());
    let source = Arc::new(SyntheticSource::layered(
        args.layer_kb * 1024,
        Duration::from_millis(args.render_ms),
    ));

    let (in_frame, out_frame) = args.loop_range();
    let inc = if args.reverse { -1 } else { 1 };
    let playhead = Playhead::new(args.start_frame, inc, in_frame, out_frame);

    let opts = PlaybackOptions {
        fps: args.fps,
        duration: Duration::from_secs_f32(args.duration.max(0.0)),
        workers: settings.worker_count(),
        group_size: settings.group_size,
        report_every: Some(Duration::from_secs(1)),
    };

    println!(
        "playing {}..={} at {} fps for {:.1}s, {} workers, {:.1} MB per frame",
        in_frame,
        out_frame,
        args.fps,
        args.duration,
        opts.workers,
        source.frame_bytes() as f64 / 1024.0 / 1024.0
    );

    let report = sim::play(&cache, &source, playhead, opts, print_stats);

    let mut stats = CacheStats::default();
    if cache.cache_stats(&mut stats) {
        print_stats(&stats);
    }
    println!(
        "shown {} frames: {} hits, {} misses ({:.1}% hit rate), {} produced by workers",
        report.shown,
        report.hits,
        report.misses,
        report.hit_rate() * 100.0,
        report.produced_by_workers
    );

    let drift = cache.check_metadata();
    if !drift.is_consistent() {
        println!("metadata drift: {:?}", drift);
    }
    debug!("{}", cache.show_cache_contents());

    source.shutdown(&cache);
    Ok(())
}
