//! Tracing setup for the keel daemon.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. The `--log-level` flag sets the level
/// for the keel crates; `RUST_LOG` can still raise or lower anything else.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("keel={log_level}").parse()?)
        .add_directive(format!("keel_session={log_level}").parse()?)
        .add_directive(format!("keel_wire={log_level}").parse()?)
        .add_directive(format!("keel_buffer={log_level}").parse()?)
        .add_directive(format!("keeld={log_level}").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
