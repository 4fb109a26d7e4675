use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::core::utility::{CachingMode, FreeMode};

/// Frame cache simulator: synthetic layered source, caching workers and a
/// moving playhead
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Frames in the sequence (loop range is the whole sequence unless --range)
    #[arg(long = "frames", value_name = "N", default_value_t = 240)]
    pub frames: i32,

    /// Loop range inside the sequence
    #[arg(long = "range", value_names = ["IN", "OUT"], num_args = 2)]
    pub range: Option<Vec<i32>>,

    /// Playback rate
    #[arg(long = "fps", value_name = "FPS", default_value_t = 24.0)]
    pub fps: f32,

    /// Seconds to play before printing the final report
    #[arg(short = 'd', long = "duration", value_name = "SECS", default_value_t = 10.0)]
    pub duration: f32,

    /// Start frame
    #[arg(long = "frame", value_name = "N", default_value_t = 0)]
    pub start_frame: i32,

    /// Play backwards
    #[arg(short = 'r', long = "reverse")]
    pub reverse: bool,

    /// Simulated render time per frame
    #[arg(long = "render-ms", value_name = "MS", default_value_t = 20)]
    pub render_ms: u64,

    /// Size of one layer item
    #[arg(long = "layer-kb", value_name = "KB", default_value_t = 4096)]
    pub layer_kb: usize,

    /// Cache budget (overrides settings; default from system memory)
    #[arg(short = 'm', long = "capacity-mb", value_name = "MB")]
    pub capacity_mb: Option<usize>,

    /// Caching threads (overrides settings)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Share of the budget kept behind the playhead
    #[arg(long = "look-behind", value_name = "FRACTION")]
    pub look_behind: Option<f32>,

    /// Which frames inside the loop range may be evicted
    #[arg(long = "free-mode", value_enum)]
    pub free_mode: Option<FreeModeArg>,

    /// Utility policy
    #[arg(long = "policy", value_enum)]
    pub policy: Option<PolicyArg>,

    /// Actively cache behind the playhead
    #[arg(long = "active-tail")]
    pub active_tail: bool,

    /// Write the effective settings back to the settings file
    #[arg(long = "save-settings")]
    pub save_settings: bool,

    /// Enable debug logging to file (default: playa-cache.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FreeModeArg {
    Conservative,
    Active,
    Greedy,
}

impl From<FreeModeArg> for FreeMode {
    fn from(arg: FreeModeArg) -> Self {
        match arg {
            FreeModeArg::Conservative => FreeMode::Conservative,
            FreeModeArg::Active => FreeMode::Active,
            FreeModeArg::Greedy => FreeMode::Greedy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Lookahead,
    Region,
}

impl From<PolicyArg> for CachingMode {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Lookahead => CachingMode::Lookahead,
            PolicyArg::Region => CachingMode::Region,
        }
    }
}

impl Args {
    /// Inclusive loop range, clamped to the sequence.
    pub fn loop_range(&self) -> (i32, i32) {
        let last = (self.frames - 1).max(0);
        match self.range.as_deref() {
            Some([a, b]) => {
                let (lo, hi) = if a <= b { (*a, *b) } else { (*b, *a) };
                (lo.clamp(0, last), hi.clamp(0, last))
            }
            _ => (0, last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["playa-cache"]);
        assert_eq!(args.frames, 240);
        assert_eq!(args.loop_range(), (0, 239));
        assert!(args.log_file.is_none());
        assert_eq!(args.verbosity, 0);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "playa-cache",
            "-vv",
            "--range",
            "50",
            "10",
            "--free-mode",
            "greedy",
            "--policy",
            "region",
            "-l",
        ]);
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.loop_range(), (10, 50));
        assert_eq!(args.free_mode.map(FreeMode::from), Some(FreeMode::Greedy));
        assert_eq!(args.policy.map(CachingMode::from), Some(CachingMode::Region));
        assert_eq!(args.log_file, Some(None));
    }
}
