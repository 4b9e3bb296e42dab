// src/utils/mod.rs
use log::{info, LevelFilter};

/// Installs the global fern logger. `level` is a `log` level name; unknown
/// names fall back to `info`.
pub fn setup_logging(level: &str) -> Result<(), fern::InitError> {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("redis", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized at {}.", level);
    Ok(())
}
