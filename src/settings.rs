//! Persisted lab settings in a human-editable `.env`-style file.
//!
//! `save` is not internally serialized; callers go through the controller,
//! which holds the global exclusive lock around it.

use crate::error::{ControllerError, Result};
use crate::model::{OllamaMode, Provider, Settings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const KEY_PROVIDER: &str = "LLM_PROVIDER";
const KEY_STRICT: &str = "STRICT_MODE";
const KEY_BYPASS: &str = "BYPASS_TOKEN";
const KEY_MODEL: &str = "OLLAMA_MODEL";
const KEY_MODE: &str = "OLLAMA_MODE";

/// Fields supplied by a save request; absent fields keep their persisted value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub provider: Option<Provider>,
    pub strict_mode: Option<bool>,
    pub bypass_token: Option<String>,
    pub ollama_model: Option<String>,
    pub ollama_mode: Option<OllamaMode>,
}

impl SettingsPatch {
    pub fn strict_mode(strict: bool) -> Self {
        Self {
            strict_mode: Some(strict),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("bypassToken", self.bypass_token.as_deref()),
            ("ollamaModel", self.ollama_model.as_deref()),
        ] {
            if let Some(v) = value {
                if v.trim().is_empty() {
                    return Err(ControllerError::invalid_setting(field, "must not be empty"));
                }
                if v.contains(['\n', '\r']) {
                    return Err(ControllerError::invalid_setting(field, "must be a single line"));
                }
            }
        }
        Ok(())
    }

    fn updates(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(p) = self.provider {
            out.push((KEY_PROVIDER, p.as_str().to_string()));
        }
        if let Some(s) = self.strict_mode {
            out.push((KEY_STRICT, s.to_string()));
        }
        if let Some(t) = &self.bypass_token {
            out.push((KEY_BYPASS, t.trim().to_string()));
        }
        if let Some(m) = &self.ollama_model {
            out.push((KEY_MODEL, m.trim().to_string()));
        }
        if let Some(m) = self.ollama_mode {
            out.push((KEY_MODE, m.as_str().to_string()));
        }
        out
    }
}

/// Parse `KEY=VALUE` lines, skipping blanks and comments.
fn parse_pairs(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ControllerError::Config(format!("{key}={raw} is not a boolean"))),
    }
}

fn settings_from_pairs(pairs: &BTreeMap<String, String>) -> Result<Settings> {
    let mut s = Settings::default();
    if let Some(raw) = pairs.get(KEY_PROVIDER) {
        s.provider = match raw.to_ascii_lowercase().as_str() {
            "mock" => Provider::Mock,
            "ollama" => Provider::Ollama,
            _ => {
                return Err(ControllerError::Config(format!(
                    "{KEY_PROVIDER}={raw} (expected mock or ollama)"
                )))
            }
        };
    }
    if let Some(raw) = pairs.get(KEY_STRICT) {
        s.strict_mode = parse_bool(KEY_STRICT, raw)?;
    }
    if let Some(raw) = pairs.get(KEY_BYPASS).filter(|v| !v.is_empty()) {
        s.bypass_token = raw.clone();
    }
    if let Some(raw) = pairs.get(KEY_MODEL).filter(|v| !v.is_empty()) {
        s.ollama_model = raw.clone();
    }
    if let Some(raw) = pairs.get(KEY_MODE) {
        s.ollama_mode = match raw.to_ascii_lowercase().as_str() {
            "docker" => OllamaMode::Docker,
            "local" => OllamaMode::Local,
            _ => {
                return Err(ControllerError::Config(format!(
                    "{KEY_MODE}={raw} (expected docker or local)"
                )))
            }
        };
    }
    Ok(s)
}

/// Rewrite `text` with `updates` applied in place, preserving every other
/// line, and append keys that were not present.
fn merge_lines(text: &str, updates: &[(&'static str, String)]) -> String {
    let mut seen = Vec::new();
    let mut out: Vec<String> = text
        .lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return line.to_string();
            }
            let Some((key, _)) = line.split_once('=') else {
                return line.to_string();
            };
            let key = key.trim();
            match updates.iter().find(|(k, _)| *k == key) {
                Some((k, v)) => {
                    seen.push(*k);
                    format!("{k}={v}")
                }
                None => line.to_string(),
            }
        })
        .collect();
    for (k, v) in updates {
        if !seen.contains(k) {
            out.push(format!("{k}={v}"));
        }
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

// Write to a sibling temp file and rename over the target.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| ControllerError::io(format!("create {}", dir.display()), e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ControllerError::io("create temporary settings file", e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| ControllerError::io("write temporary settings file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ControllerError::io("sync temporary settings file", e))?;
    tmp.persist(path)
        .map_err(|e| ControllerError::io(format!("replace {}", path.display()), e.error))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_text(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ControllerError::io(
                format!("read {}", self.path.display()),
                e,
            )),
        }
    }

    /// Raw key/value pairs, or `None` when the file has never been created.
    pub async fn load_raw(&self) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.read_text().await?.as_deref().map(parse_pairs))
    }

    /// Current settings; defaults when the file is absent.
    pub async fn load(&self) -> Result<Settings> {
        match self.read_text().await? {
            Some(text) => settings_from_pairs(&parse_pairs(&text)),
            None => Ok(Settings::default()),
        }
    }

    /// Merge `patch` into the persisted file and return the resulting settings.
    pub async fn save(&self, patch: &SettingsPatch) -> Result<Settings> {
        patch.validate()?;
        let existing = self.read_text().await?.unwrap_or_default();
        let merged = merge_lines(&existing, &patch.updates());
        // Refuse to persist something we could not read back.
        let settings = settings_from_pairs(&parse_pairs(&merged))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &merged))
            .await
            .map_err(|e| ControllerError::Internal(format!("settings writer panicked: {e}")))??;
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(".env"));
        (dir, store)
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let (_dir, store) = store();
        assert_eq!(store.load().await.unwrap(), Settings::default());
        assert!(store.load_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_merges_and_preserves_other_lines() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            "# lab config\nLLM_PROVIDER=mock\nOTHER=keep\nSTRICT_MODE=false\n",
        )
        .unwrap();

        let saved = store
            .save(&SettingsPatch {
                strict_mode: Some(true),
                ollama_model: Some("phi3".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(saved.strict_mode);
        assert_eq!(saved.ollama_model, "phi3");

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            text,
            "# lab config\nLLM_PROVIDER=mock\nOTHER=keep\nSTRICT_MODE=true\nOLLAMA_MODEL=phi3\n"
        );
        assert_eq!(store.load().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn save_creates_missing_file() {
        let (_dir, store) = store();
        let saved = store
            .save(&SettingsPatch {
                provider: Some(Provider::Ollama),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(saved.provider, Provider::Ollama);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn empty_fields_are_rejected() {
        let (_dir, store) = store();
        let err = store
            .save(&SettingsPatch {
                bypass_token: Some("  ".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSetting { field: "bypassToken", .. }));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn corrupt_values_are_config_errors() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "LLM_PROVIDER=gpt\n").unwrap();
        assert!(matches!(
            store.load().await,
            Err(ControllerError::Config(_))
        ));
    }

    #[test]
    fn quoted_values_are_unwrapped() {
        let pairs = parse_pairs("BYPASS_TOKEN=\"open sesame\"\n# c\nbad line\n");
        assert_eq!(pairs.get("BYPASS_TOKEN").map(String::as_str), Some("open sesame"));
        assert_eq!(pairs.len(), 1);
    }
}
