//! `hearth config`: print configuration.

use hearth_config::AppConfig;

pub fn show(config: &AppConfig, default: bool) -> Result<(), Box<dyn std::error::Error>> {
    if default {
        println!("{}", AppConfig::default_toml());
    } else {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
