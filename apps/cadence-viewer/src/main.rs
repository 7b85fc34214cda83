//! Cadence Demo Viewer
//!
//! Animates a compute-generated gradient, composites it through a fullscreen
//! pass, blends a textured quad on top and presents the result.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cadence-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--fps <N>`: Limit presentation to N frames per second (0 = unlimited)
//! - `--no-vsync`: Prefer mailbox or immediate presentation
//! - `--validation`: Enable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use cadence_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewerArgs {
    fps: Option<u32>,
    vsync: bool,
    validation: bool,
    help: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            help: false,
        }
    }
}

impl ViewerArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--fps" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--fps needs a value"))?;
                    let fps: u32 = value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid --fps value {value:?}: {e}"))?;
                    parsed.fps = (fps > 0).then_some(fps);
                }
                "--no-vsync" => parsed.vsync = false,
                "--validation" => parsed.validation = true,
                "-h" | "--help" => parsed.help = true,
                other => anyhow::bail!("unknown argument {other:?}"),
            }
        }
        Ok(parsed)
    }

    fn config(&self) -> AppConfig {
        let config = AppConfig::new("Cadence Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(self.vsync)
            .with_validation(self.validation);
        match self.fps {
            Some(fps) => config.with_target_fps(fps),
            None => config,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::parse(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(args.config())
}

fn print_help() {
    eprintln!(
        "Cadence Demo Viewer

USAGE:
    cargo run -p cadence-viewer -- [OPTIONS]

OPTIONS:
    --fps <N>       Limit presentation to N frames per second (0 = unlimited)
    --no-vsync      Prefer mailbox or immediate presentation
    --validation    Enable Vulkan validation layers
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ViewerArgs> {
        ViewerArgs::parse(args.iter().map(|arg| (*arg).to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(parse(&[]).unwrap(), ViewerArgs::default());
    }

    #[test]
    fn flags_are_applied() {
        let args = parse(&["--fps", "30", "--no-vsync", "--validation"]).unwrap();
        assert_eq!(args.fps, Some(30));
        assert!(!args.vsync);
        assert!(args.validation);

        let config = args.config();
        assert_eq!(config.target_fps, Some(30));
        assert!(!config.vsync);
    }

    #[test]
    fn zero_fps_is_unlimited() {
        assert_eq!(parse(&["--fps", "0"]).unwrap().fps, None);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse(&["--fps"]).is_err());
        assert!(parse(&["--fps", "fast"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["-h"]).unwrap().help);
    }
}
