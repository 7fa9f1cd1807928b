//! Configuration for the mock server.
//!
//! Defines the listen port, the mock sources (glob patterns and inline
//! mocks), watch behavior, and upstream proxy templates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Error;

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen port; 0 picks a free port.
    #[serde(default)]
    pub port: u16,

    /// Mock sources: glob patterns discovered on disk, or inline mocks
    /// registered directly at a path.
    #[serde(default = "default_mocks")]
    pub mocks: Vec<MockSource>,

    /// Whether to watch the glob roots for changes after the initial scan.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Upstream templates, keyed by URL prefix, consulted when no mock
    /// handles a request.
    #[serde(default, rename = "proxyAPIs", alias = "proxyApis")]
    pub proxy_apis: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_mocks() -> Vec<MockSource> {
    vec![
        MockSource::Glob("./mocks/**/*".to_string()),
        MockSource::Glob("./test/mocks/**/*".to_string()),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            mocks: default_mocks(),
            watch: true,
            proxy_apis: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        for source in &self.mocks {
            match source {
                MockSource::Glob(pattern) => {
                    let body = pattern.strip_prefix('!').unwrap_or(pattern);
                    globset::Glob::new(body).map_err(|source| Error::Glob {
                        pattern: pattern.clone(),
                        source,
                    })?;
                }
                MockSource::Inline(inline) => {
                    if !inline.path.starts_with('/') {
                        return Err(Error::Config(format!(
                            "inline mock path must start with '/': {}",
                            inline.path
                        )));
                    }
                }
            }
        }

        for prefix in self.proxy_apis.keys() {
            if !prefix.starts_with('/') {
                continue;
            }
            regex::Regex::new(&format!("^{prefix}")).map_err(|source| Error::ProxyPattern {
                pattern: prefix.clone(),
                source,
            })?;
        }

        Ok(())
    }
}

/// One configured mock source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MockSource {
    /// A glob pattern; matching files are loaded and watched. A leading `!`
    /// excludes matches from preceding patterns.
    Glob(String),
    /// A mock registered directly at a path, taking precedence over every
    /// file-system mock.
    Inline(InlineMock),
}

/// An inline mock declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineMock {
    /// The URL path to register at.
    pub path: String,
    /// Mock content, interpreted like loaded file content.
    pub mock: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_watch_the_conventional_directories() {
        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.port, 0);
        assert!(config.watch);
        assert_eq!(config.mocks.len(), 2);
        assert!(matches!(&config.mocks[0], MockSource::Glob(g) if g == "./mocks/**/*"));
    }

    #[test]
    fn parses_globs_and_inline_mocks() {
        let yaml = r#"
port: 8080
watch: false
mocks:
  - "./fixtures/**/*.json"
  - path: /health
    mock:
      response:
        statusCode: 204
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 8080);
        assert!(!config.watch);
        assert_eq!(config.mocks.len(), 2);
        match &config.mocks[1] {
            MockSource::Inline(inline) => {
                assert_eq!(inline.path, "/health");
                assert_eq!(inline.mock["response"]["statusCode"], json!(204));
            }
            other => panic!("expected inline mock, got {other:?}"),
        }
    }

    #[test]
    fn parses_proxy_templates() {
        let yaml = r#"
proxyAPIs:
  /api: "https://real.example.com/api"
  /auth: "https://auth.example.com"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxy_apis.len(), 2);
        assert_eq!(
            config.proxy_apis.get("/api").unwrap(),
            "https://real.example.com/api"
        );
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "port: 1\nbogus: true\n";
        assert!(serde_yaml::from_str::<ServerConfig>(yaml).is_err());
    }

    #[test]
    fn invalid_glob_fails_validation() {
        let yaml = "mocks:\n  - \"./mocks/[\"\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Glob { .. })));
    }

    #[test]
    fn inline_path_must_be_absolute() {
        let yaml = "mocks:\n  - path: health\n    mock: {}\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn exclusion_globs_validate_without_their_bang() {
        let yaml = "mocks:\n  - \"./mocks/**/*\"\n  - \"!./mocks/**/*.bak\"\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
    }
}
