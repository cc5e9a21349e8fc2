//! Parallel fan-out engine for image generation.
//!
//! Phase 5 turns every panel from phase 4 into an [`ImageGenerationTask`],
//! sorts the tasks by priority and drains them through a semaphore-bounded
//! worker pool with per-task retry and a content-addressed result cache.
//! Completion order is unspecified; the emitted result list preserves the
//! priority-sorted submission order.

pub mod analysis;
pub mod engine;
pub mod task;

pub use analysis::{cache_hit_rate, consistency_report, parallel_efficiency};
pub use engine::{CachedImage, FanOutConfig, FanOutEngine, FanOutReport};
pub use task::{ImageGenerationResult, ImageGenerationTask, panel_priority};
