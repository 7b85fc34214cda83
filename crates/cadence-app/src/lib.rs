//! Windowed application framework for Cadence.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Window creation and management
//! - GPU context and presenter initialization
//! - Surface rebuilds on resize
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use cadence_app::{run_app, AppConfig, AppContext, CadenceApp, FrameContext};
//!
//! struct MyApp;
//!
//! impl CadenceApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         // Record work into an image and hand it to `ctx.present`.
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::CadenceApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use cadence_gpu::{GpuContext, PresentOutcome, Presenter};
pub use winit::event::WindowEvent;
