// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Runtime switchable log level.
//!
//! The backend logger is initialized with the most verbose filter and the
//! effective level is gated through [`log::set_max_level`], so the level can
//! be raised or lowered at runtime without touching the backend.

use log::LevelFilter;

#[derive(Debug)]
pub struct RuntimeLevel {
    default_level: LevelFilter,
}

impl RuntimeLevel {
    pub fn new(default_level: LevelFilter) -> Self {
        log::set_max_level(default_level);
        Self { default_level }
    }

    pub fn current_level(&self) -> LevelFilter {
        log::max_level()
    }

    pub fn default_level(&self) -> LevelFilter {
        self.default_level
    }

    pub fn reset(&self) {
        log::set_max_level(self.default_level);
    }

    pub fn set_level_by_str(&self, level_str: &str) -> Result<(), String> {
        let level = match level_str.to_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => return Err(format!("Unknown log level:{level_str}")),
        };

        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_level_by_str() {
        let runtime_level = RuntimeLevel::new(LevelFilter::Info);

        assert!(runtime_level.set_level_by_str("debug").is_ok());
        assert_eq!(runtime_level.current_level(), LevelFilter::Debug);

        assert!(runtime_level.set_level_by_str("no_such_level").is_err());
        assert_eq!(runtime_level.current_level(), LevelFilter::Debug);

        runtime_level.reset();
        assert_eq!(runtime_level.current_level(), LevelFilter::Info);
    }
}
