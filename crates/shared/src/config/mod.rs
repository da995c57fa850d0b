// Configuration module
// Reads INI-style configuration files with environment variable overrides

use configparser::ini::Ini;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Global configuration singleton
static CONFIG: once_cell::sync::Lazy<Mutex<Config>> =
    once_cell::sync::Lazy::new(|| Mutex::new(Config::new()));

/// Get a reference to the global config instance
pub fn get_config() -> &'static Mutex<Config> {
    &CONFIG
}

/// Configuration file parser
/// Section headers are accepted but flattened: keys are looked up without a section.
pub struct Config {
    values: HashMap<String, String>,
    filename: String,
    env_prefix: String,
}

impl Config {
    pub fn new() -> Self {
        Config {
            values: HashMap::new(),
            filename: String::new(),
            env_prefix: String::new(),
        }
    }

    /// Load configuration from a file
    /// env_prefix is used to check environment variables (e.g., "Vmap_")
    pub fn set_source(&mut self, filename: &str, env_prefix: &str) -> bool {
        self.filename = filename.to_string();
        self.env_prefix = env_prefix.to_string();
        self.reload()
    }

    /// Use only environment variables (no file), e.g. when no config file is shipped
    pub fn set_env_only(&mut self, env_prefix: &str) {
        self.filename.clear();
        self.env_prefix = env_prefix.to_string();
        self.values.clear();
    }

    /// Reload the configuration file
    pub fn reload(&mut self) -> bool {
        self.values.clear();

        if !Path::new(&self.filename).is_file() {
            return false;
        }

        let mut ini = Ini::new_cs();
        let sections = match ini.load(&self.filename) {
            Ok(sections) => sections,
            Err(e) => {
                tracing::error!("Could not parse configuration file {}: {}", self.filename, e);
                return false;
            }
        };

        self.absorb(sections);
        true
    }

    /// Parse configuration from an in-memory string
    pub fn load_from_str(&mut self, content: &str) -> bool {
        self.values.clear();

        let mut ini = Ini::new_cs();
        match ini.read(content.to_string()) {
            Ok(sections) => {
                self.absorb(sections);
                true
            }
            Err(e) => {
                tracing::error!("Could not parse configuration: {}", e);
                false
            }
        }
    }

    fn absorb(&mut self, sections: HashMap<String, HashMap<String, Option<String>>>) {
        for (_, entries) in sections {
            for (key, value) in entries {
                let mut value = value.unwrap_or_default();

                // Strip quotes
                if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                    value = value[1..value.len() - 1].to_string();
                }

                self.values.insert(key, value);
            }
        }
    }

    /// Check if a key is set
    pub fn is_set(&self, key: &str) -> bool {
        self.get_env_or_config(key).is_some()
    }

    /// Get a string value with a default
    pub fn get_string_default(&self, key: &str, default: &str) -> String {
        self.get_env_or_config(key)
            .unwrap_or_else(|| default.to_string())
    }

    /// Get a string value (empty string default)
    pub fn get_string(&self, key: &str) -> String {
        self.get_string_default(key, "")
    }

    /// Get a boolean value with a default
    pub fn get_bool_default(&self, key: &str, default: bool) -> bool {
        match self.get_env_or_config(key) {
            Some(val) => {
                let lower = val.to_lowercase();
                matches!(lower.as_str(), "1" | "true" | "yes")
            }
            None => default,
        }
    }

    /// Get an integer value with a default
    pub fn get_int_default(&self, key: &str, default: i32) -> i32 {
        match self.get_env_or_config(key) {
            Some(val) => val.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Get a float value with a default
    pub fn get_float_default(&self, key: &str, default: f32) -> f32 {
        match self.get_env_or_config(key) {
            Some(val) => val.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Try environment variable first, then config file
    fn get_env_or_config(&self, key: &str) -> Option<String> {
        // Convert key to env var name: replace '.' with '_', add prefix
        if !self.env_prefix.is_empty() {
            let env_key = format!("{}{}", self.env_prefix, key.replace('.', "_"));
            if let Ok(val) = std::env::var(&env_key) {
                return Some(val);
            }
        }

        self.values.get(key).cloned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.get_int_default("nonexistent", 42), 42);
        assert_eq!(config.get_string_default("nonexistent", "hello"), "hello");
        assert!(config.get_bool_default("nonexistent", true));
    }

    #[test]
    fn test_sections_are_flattened() {
        let mut config = Config::new();
        assert!(config.load_from_str(
            "[VmapConf]\nDataDir = \"/srv/data\"\nvmap.enableLOS = 0\nvmap.enableHeight = 1\n"
        ));
        assert_eq!(config.get_string("DataDir"), "/srv/data");
        assert!(!config.get_bool_default("vmap.enableLOS", true));
        assert!(config.get_bool_default("vmap.enableHeight", false));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vmap.conf");
        std::fs::write(&path, "# comment\nMaxRange = 12.5\nLogLevel = 3\n").unwrap();

        let mut config = Config::new();
        assert!(config.set_source(path.to_str().unwrap(), ""));
        assert_eq!(config.get_float_default("MaxRange", 0.0), 12.5);
        assert_eq!(config.get_int_default("LogLevel", 0), 3);
    }

    #[test]
    fn test_missing_file() {
        let mut config = Config::new();
        assert!(!config.set_source("/nonexistent/vmap.conf", ""));
        assert!(!config.is_set("DataDir"));
    }
}
