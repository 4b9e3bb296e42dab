pub mod settings;

pub use settings::Config;

use crate::error::GatewayError;
use std::sync::Arc;

/// Loads `.env` if present, reads the environment and validates the result.
pub fn load_config() -> Result<Arc<settings::Config>, GatewayError> {
    dotenv::dotenv().ok();

    let config = settings::Config::from_env();
    let problems = config.problems();
    if !problems.is_empty() {
        return Err(GatewayError::Config(problems.join("; ")));
    }

    config.validate_and_log();
    Ok(Arc::new(config))
}
