use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global fmt subscriber. `verbose` lowers the level to debug and
/// prints module targets.
pub fn init(verbose: bool) -> Result<(), String> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(verbose)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}
