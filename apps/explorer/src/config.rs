use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::{HttpServiceOptions, DEFAULT_PAGE_SIZE};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "explorer.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub dataset_id: Option<i64>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            auth_token: None,
            dataset_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn service_options(&self) -> HttpServiceOptions {
        HttpServiceOptions {
            auth_token: self.auth_token.clone(),
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        }
    }
}

/// Defaults, then `path` (if present), then the process environment.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub(crate) fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: HashMap<String, toml::Value> = toml::from_str(raw)?;

    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("auth_token").and_then(toml::Value::as_str) {
        settings.auth_token = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("dataset_id").and_then(toml::Value::as_integer) {
        settings.dataset_id = Some(v);
    }
    if let Some(v) = file_cfg.get("page_size").and_then(toml::Value::as_integer) {
        settings.page_size = u32::try_from(v).context("page_size out of range")?;
    }
    if let Some(v) = file_cfg
        .get("request_timeout_secs")
        .and_then(toml::Value::as_integer)
    {
        settings.request_timeout_secs =
            u64::try_from(v).context("request_timeout_secs out of range")?;
    }
    Ok(())
}

/// `APP__*` wins over `EXPLORER_*`. Unparseable numbers are ignored.
pub(crate) fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| {
        lookup(&format!("APP__{name}")).or_else(|| lookup(&format!("EXPLORER_{name}")))
    };

    if let Some(v) = var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("AUTH_TOKEN") {
        settings.auth_token = (!v.is_empty()).then_some(v);
    }
    if let Some(v) = var("DATASET_ID").and_then(|v| v.parse().ok()) {
        settings.dataset_id = Some(v);
    }
    if let Some(v) = var("PAGE_SIZE").and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = var("REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.request_timeout_secs = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
