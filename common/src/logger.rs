use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install the process-wide fern logger. Called once from each binary's
/// main before anything else logs.
pub fn init(level: LevelFilter) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .debug(Color::Green)
        .info(Color::Cyan)
        .warn(Color::Yellow)
        .error(Color::Red);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{:>5}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        // actix access logging is noisy at debug; keep it at info
        .level_for("actix_server", LevelFilter::Info)
        .level_for("actix_http", LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
