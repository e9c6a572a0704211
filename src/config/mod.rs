mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    FlowSettings, LoggingSettings, RouterSettings, ServerSettings, SessionSettings, Settings,
};

/// Loads the configuration.
///
/// Sources, later ones winning: built-in defaults, the optional
/// `config/default.*` file, then `POPMSG__SECTION__KEY` environment variables
/// (for example `POPMSG__SESSION__URL`).
pub fn load_config() -> Result<Settings, ConfigError> {
    let defaults = Config::try_from(&Settings::default())?;

    let builder = Config::builder()
        .add_source(defaults)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPMSG")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
