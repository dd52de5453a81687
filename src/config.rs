//! Startup configuration, read from JSON.
//!
//! ```json
//! {
//!   "log_filter": "info",
//!   "leak_tracking": true,
//!   "allocator": { "kind": "debug_page", "max_delayed_free_count": 1024 },
//!   "exception": { "enabled": true, "report_path": "default", "response": "terminate" }
//! }
//! ```
//!
//! Every field is optional.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    alloc::page::DEFAULT_MAX_DELAYED_FREE_COUNT, error::Result, exception::ExceptionResponse,
};

/// Names a config file to load in [`Config::from_env`]
pub const CONFIG_ENV: &str = "KDIAG_CONFIG";

/// Overrides [`Config::leak_tracking`]: `1`/`true`/`on` or `0`/`false`/`off`
pub const LEAK_TRACKING_ENV: &str = "KDIAG_LEAK_TRACKING";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `env_logger` filter, overridden by `KDIAG_LOG`
    pub log_filter: String,
    pub leak_tracking: bool,
    pub allocator: AllocatorConfig,
    pub exception: ExceptionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
            leak_tracking: false,
            allocator: AllocatorConfig::default(),
            exception: ExceptionConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    #[default]
    Default,
    DebugPage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    pub kind: AllocatorKind,
    /// Debug page allocator only
    pub overrun_detection: bool,
    pub guard_bytes: bool,
    pub max_delayed_free_count: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            kind: AllocatorKind::Default,
            overrun_detection: true,
            guard_bytes: cfg!(debug_assertions),
            max_delayed_free_count: DEFAULT_MAX_DELAYED_FREE_COUNT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExceptionConfig {
    pub enabled: bool,
    pub report_privacy: bool,
    /// `"default"`, a path (optionally with `%s` for the time), or `null`
    pub report_path: Option<String>,
    pub minidump_path: Option<String>,
    pub response: ExceptionResponse,
    pub app_description: String,
    pub code_base_paths: Vec<String>,
    pub terminate_return_value: i32,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_privacy: true,
            report_path: Some(crate::exception::report::DEFAULT_PATH.to_owned()),
            minidump_path: None,
            response: ExceptionResponse::Default,
            app_description: String::new(),
            code_base_paths: Vec::new(),
            terminate_return_value: crate::exception::DEFAULT_TERMINATE_RETURN_VALUE,
        }
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// The file named by `KDIAG_CONFIG` (or the defaults), with
    /// `KDIAG_LEAK_TRACKING` applied on top
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(v) = std::env::var(LEAK_TRACKING_ENV).ok().and_then(|v| parse_flag(&v)) {
            config.leak_tracking = v;
        }
        Ok(config)
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn empty_object_is_the_default() {
        assert_eq!(Config::from_json_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn nested_fields_parse() {
        let c = Config::from_json_str(
            r#"{
                "leak_tracking": true,
                "allocator": { "kind": "debug_page", "max_delayed_free_count": 8 },
                "exception": { "enabled": true, "report_path": null, "response": "rethrow",
                               "code_base_paths": ["/src"] }
            }"#,
        )
        .unwrap();
        assert!(c.leak_tracking);
        assert_eq!(c.allocator.kind, AllocatorKind::DebugPage);
        assert_eq!(c.allocator.max_delayed_free_count, 8);
        assert!(c.allocator.overrun_detection);
        assert_eq!(c.exception.report_path, None);
        assert_eq!(c.exception.response, ExceptionResponse::Rethrow);
        assert!(c.exception.report_privacy);
        assert_eq!(c.exception.code_base_paths, ["/src"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{ "leak_trackin": true }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn flags() {
        assert_eq!(parse_flag(" ON "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn reads_from_file() {
        let path = std::env::temp_dir().join(format!("kdiag-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "log_filter": "debug" }"#).unwrap();
        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.log_filter, "debug");
        fs::remove_file(&path).unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::Io(_))));
    }
}
