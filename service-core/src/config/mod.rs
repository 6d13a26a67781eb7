use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        load_layered("APP", &[])
    }
}

/// Load a settings struct from an optional `configuration` file overlaid with
/// `<PREFIX>__SECTION__KEY` environment variables.
///
/// Keys listed in `list_keys` are parsed from comma separated env values.
pub fn load_layered<T: DeserializeOwned>(prefix: &str, list_keys: &[&str]) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let mut env = Environment::with_prefix(prefix)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true);

    if !list_keys.is_empty() {
        env = env.list_separator(",");
        for key in list_keys {
            env = env.with_list_parse_key(key);
        }
    }

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(env)
        .build()?;

    Ok(config.try_deserialize()?)
}
