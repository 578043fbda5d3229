use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Config file picked up from the working directory when no path is given.
const DEFAULT_CONFIG_FILE: &str = "linegem.toml";

/// Placeholder in the fallback template replaced with the generation error.
const ERROR_PLACEHOLDER: &str = "{error}";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineConfig {
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default)]
    pub channel_secret: String,
    #[serde(default = "default_line_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on events from one webhook request handled at the same time.
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyConfig {
    /// Sent to the user when generation fails; `{error}` is replaced with the failure detail.
    #[serde(default = "default_fallback_template")]
    pub fallback_template: String,
}

fn default_line_api_base_url() -> String {
    "https://api.line.me".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_concurrent_events() -> usize {
    16
}

fn default_fallback_template() -> String {
    "抱歉，Gemini 處理您的請求時發生錯誤: {error}".to_string()
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_access_token: String::new(),
            channel_secret: String::new(),
            api_base_url: default_line_api_base_url(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_events: default_max_concurrent_events(),
        }
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            fallback_template: default_fallback_template(),
        }
    }
}

impl ReplyConfig {
    /// Render the fallback reply for a failed generation.
    pub fn fallback_message(&self, error: &str) -> String {
        if self.fallback_template.contains(ERROR_PLACEHOLDER) {
            self.fallback_template.replace(ERROR_PLACEHOLDER, error)
        } else {
            format!("{}: {}", self.fallback_template, error)
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply the process environment.
    ///
    /// Missing secrets are not an error here: they stay empty and the LINE and
    /// Gemini APIs reject the requests that use them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Override fields from environment variables, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LINE_CHANNEL_ACCESS_TOKEN") {
            self.line.channel_access_token = v;
        }
        if let Some(v) = lookup("LINE_CHANNEL_SECRET") {
            self.line.channel_secret = v;
        }
        if let Some(v) = lookup("LINE_API_BASE_URL") {
            self.line.api_base_url = v;
        }
        if let Some(v) = lookup("GEMINI_API_KEY") {
            self.gemini.api_key = v;
        }
        if let Some(v) = lookup("GEMINI_MODEL") {
            self.gemini.model = v;
        }
        if let Some(v) = lookup("GEMINI_BASE_URL") {
            self.gemini.base_url = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {v}"))?;
        }
        if let Some(v) = lookup("MAX_CONCURRENT_EVENTS") {
            self.server.max_concurrent_events = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid MAX_CONCURRENT_EVENTS value: {v}"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.max_concurrent_events == 0 {
            anyhow::bail!("max_concurrent_events must be at least 1");
        }
        Ok(())
    }
}
