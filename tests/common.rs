#![allow(dead_code)]

use rust_evloop::{Loop, LoopConfig};
use std::sync::Once;

static INIT: Once = Once::new();

/// Sets up the tracing subscriber for tests, ensuring it's only initialized once.
pub fn setup_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}

/// A loop that never touches process-wide signal state.
pub fn quiet_loop() -> Loop {
    setup_tracing();
    Loop::with_config(LoopConfig::new().signals(false)).expect("create loop")
}
