//! Cross-module scenarios.
//!
//! These drive the manager, stores and control channel together with full
//! access to crate internals.

use std::sync::Once;

use crate::{config::LoggingConfig, logging::init_logging};

mod scenarios;

static INIT: Once = Once::new();

pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        init_logging(&LoggingConfig {
            level: "warn".to_string(),
            json: false,
        });
    });
}
