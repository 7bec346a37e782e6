//! Simulated hardware for the acquisition engine.
//!
//! Implements the `acq-core` capability traits without physical devices,
//! with realistic timing (tokio sleeps scaled to the configured periods)
//! so engine tests exercise the same concurrency paths as real drivers:
//! readers sampling while the emitter plays its waveform, per-tile
//! timeouts, cancellation mid-read, and transient-fault injection.

pub mod detector;
pub mod emitter;
pub mod stage;

pub use detector::{
    SimAnalogDetector, SimCamera, SimCountingDetector, SimProbeCurrent, SimStreakCamera,
    SimTimeCorrelator,
};
pub use emitter::SimEmitter;
pub use stage::SimStage;
