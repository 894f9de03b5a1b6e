//! Process-wide tracing setup.
//!
//! `RUST_LOG` takes precedence. Otherwise `LOG_LEVEL` picks the level, and a
//! truthy `DEBUG` forces debug output.

use once_cell::sync::OnceCell;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

const TRUTHY: [&str; 5] = ["true", "yes", "y", "on", "1"];

pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(fallback_directive(
                env::var("LOG_LEVEL").ok().as_deref(),
                env::var("DEBUG").ok().as_deref(),
            ))
        });
        fmt().with_env_filter(filter).with_target(false).init();
    });
}

fn fallback_directive(log_level: Option<&str>, debug: Option<&str>) -> String {
    let debug = debug
        .map(|value| TRUTHY.contains(&value.trim().to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if debug {
        return "debug".to_string();
    }
    log_level
        .map(|level| level.trim().to_ascii_lowercase())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}
