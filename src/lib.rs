pub mod allocator;
pub mod config;
pub mod control;
pub mod crash_sim;
pub mod crc;
pub mod device;
pub mod dispatcher;
pub mod error_worker;
pub mod errors;
pub mod logging;
pub mod metadata_codec;
pub mod metadata_store;
pub mod remap_index;
pub mod stats;
pub mod target;

pub use crate::config::{Config, ConfigBuilder, WriteQuorum};
pub use crate::control::{ControlMessage, ControlResponse, TableLine};
pub use crate::errors::{RemapError, Result};
pub use crate::metadata_codec::PlacementStrategyKind;
pub use crate::stats::Stats;
pub use crate::target::{ExitCode, Target};
