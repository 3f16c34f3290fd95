//! JSON configuration loading.

use serde::Deserialize;
use std::fs;

fn default_bind() -> String {
    String::new()
}

fn default_loglevel() -> String {
    "notice".to_string()
}

fn default_logfile() -> String {
    String::new()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default = "default_logfile")]
    pub logfile: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("can't open config file '{}': {}", path, e))?;
        serde_json::from_str(&contents).map_err(|e| format!("invalid config file '{}': {}", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_defaults() {
        let json = r#"{"port": 6379}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.bind, "");
        assert_eq!(cfg.loglevel, "notice");
    }

    #[test]
    fn unknown_fields_ignored() {
        let json = r#"{"port": 7000, "totallyunknown": true}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 7000);
    }

    #[test]
    fn full_config() {
        let json = r#"{"port": 7000, "bind": "127.0.0.1", "loglevel": "debug", "logfile": "/tmp/r.log"}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.loglevel, "debug");
        assert_eq!(cfg.logfile, "/tmp/r.log");
    }
}
