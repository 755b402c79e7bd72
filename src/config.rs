use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub struct Config {
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn build(path: &str) -> Result<Config> {
        let file_contents =
            std::fs::read_to_string(path).with_context(|| format!("could not read {path}"))?;
        let config: Config =
            toml::from_str(&file_contents).with_context(|| format!("could not parse {path}"))?;

        Ok(config)
    }
}

#[derive(Deserialize, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "TwitchConfig::default_irc_host")]
    pub irc_host: String,
    #[serde(default = "TwitchConfig::default_irc_port")]
    pub irc_port: u16,
    /// Login of the bot account.
    pub account: String,
    /// Channel to join; also the login of the streamer account.
    pub channel: String,
    /// First-run tokens per role; ignored once a record exists in storage.
    pub bot_seed: SeedTokens,
    pub streamer_seed: SeedTokens,
}

impl TwitchConfig {
    fn default_irc_host() -> String {
        "irc.chat.twitch.tv".to_string()
    }

    fn default_irc_port() -> u16 {
        6667
    }
}

#[derive(Deserialize, Clone)]
pub struct SeedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Deserialize, Clone)]
pub struct OverlayConfig {
    #[serde(default = "OverlayConfig::default_port")]
    pub port: u16,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            port: Self::default_port(),
        }
    }
}

impl OverlayConfig {
    fn default_port() -> u16 {
        8765
    }
}

#[derive(Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: Self::default_database_path(),
        }
    }
}

impl StorageConfig {
    fn default_database_path() -> String {
        "mutiny.db".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_fill_in_defaults() {
        let toml_src = r#"
[twitch]
client_id = "abc"
client_secret = "def"
account = "mutinybot"
channel = "somestreamer"

[twitch.bot_seed]
access_token = "seed-a"
refresh_token = "seed-r"

[twitch.streamer_seed]
access_token = "seed-a2"
refresh_token = "seed-r2"
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.twitch.irc_host, "irc.chat.twitch.tv");
        assert_eq!(config.twitch.irc_port, 6667);
        assert_eq!(config.overlay.port, 8765);
        assert_eq!(config.storage.database_path, "mutiny.db");
        assert_eq!(config.twitch.bot_seed.access_token, "seed-a");
    }

    #[test]
    fn explicit_sections_override_defaults() {
        let toml_src = r#"
[twitch]
client_id = "abc"
client_secret = "def"
irc_host = "localhost"
irc_port = 16667
account = "mutinybot"
channel = "somestreamer"

[twitch.bot_seed]
access_token = "a"
refresh_token = "r"

[twitch.streamer_seed]
access_token = "a"
refresh_token = "r"

[overlay]
port = 9000

[storage]
database_path = "/tmp/test.db"
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.twitch.irc_host, "localhost");
        assert_eq!(config.overlay.port, 9000);
        assert_eq!(config.storage.database_path, "/tmp/test.db");
    }
}
