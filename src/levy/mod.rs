//! Zakat levy scheduling

pub mod scheduler;

pub use scheduler::{LevyPolicy, LevyScheduler, DEFAULT_PERIOD_DAYS, DEFAULT_RATE_BPS, LEVY_NOTE};
