pub mod sweep;

pub use sweep::{spawn_sweep_task, EvictionCallback, IdleSweep, ProjectTracker, SweepHandle, TrackedProject};
