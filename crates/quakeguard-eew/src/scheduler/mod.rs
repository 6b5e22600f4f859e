//! Monitor scheduling: power modes, sampling duty cycle and the periodic
//! background tick.

pub mod background;
pub mod monitor;
pub mod power;

pub use background::{BackgroundHost, BackgroundRegistration, BackgroundTask, TokioIntervalHost};
pub use monitor::{DetectionTick, MonitorScheduler, TickReport};
pub use power::SchedulerConfig;
