// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Block until a termination signal arrives.

use log::info;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

pub fn wait_for_signal() {
    let mut signals = Signals::new(TERM_SIGNALS).expect("Failed to register signal handlers");
    for signal in signals.forever() {
        if TERM_SIGNALS.contains(&signal) {
            info!("Received signal {signal}, stopping server...");
            break;
        }
    }
}
