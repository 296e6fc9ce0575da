//! Power telemetry for benchmark sweeps.
//!
//! Samples GPU and wall-socket power on drift-free schedules into one shared
//! snapshot, and logs that snapshot to CSV once per tick until the benchmark
//! raises the shutdown signal.

pub mod csv_emitter;
pub mod eng110;
pub mod error;
pub mod power;
pub mod sampler;
pub mod shutdown;
pub mod snapshot;
pub mod ticker;

pub use csv_emitter::{write_results_csv, ResultRow, TelemetryCsvWriter, TelemetryRow};
pub use eng110::{query_power_meter, Eng110Meter, MeterConfig, MeterFrame, MeterLink, PowerSample};
pub use error::{Result, TelemetryError};
pub use power::{Eng110Source, MockPowerSource, NvidiaSmiSource, PowerSource};
pub use sampler::{Channel, Sampler, SamplerStats};
pub use shutdown::ShutdownSignal;
pub use snapshot::{TelemetrySnapshot, TelemetryState};
pub use ticker::Ticker;
