use crate::UrlctlError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const CONFIG_DOCUMENT: &str = "config.json";

pub(crate) struct YamlDocument {
    pub(crate) relative_path: &'static str,
    pub(crate) template: &'static str,
}

pub(crate) const YAML_DOCUMENTS: &[YamlDocument] = &[
    YamlDocument {
        relative_path: "config.yaml",
        template: include_str!("../templates/config.yaml"),
    },
    YamlDocument {
        relative_path: "config/config.yaml",
        template: include_str!("../templates/main.yaml"),
    },
    YamlDocument {
        relative_path: "config/settings.yaml",
        template: include_str!("../templates/settings.yaml"),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ConfigFormat {
    Json,
    Env,
    Yaml,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub(crate) enum ConfigFileState {
    Valid(String),
    Missing,
    Invalid(String),
}

/// Syntactic check only; keys are never inspected.
pub(crate) fn validate_config_file(path: &Path, format: ConfigFormat) -> ConfigFileState {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return ConfigFileState::Missing,
        Err(err) => return ConfigFileState::Invalid(format!("failed to read: {err}")),
    };
    match format {
        ConfigFormat::Json => match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => {
                ConfigFileState::Valid(format!("valid JSON ({} top-level keys)", map.len()))
            }
            Ok(_) => ConfigFileState::Valid("valid JSON".to_string()),
            Err(err) => ConfigFileState::Invalid(err.to_string()),
        },
        ConfigFormat::Env => {
            ConfigFileState::Valid(format!("{} lines read", content.lines().count()))
        }
        ConfigFormat::Yaml => match serde_yaml::from_str::<serde_yaml::Value>(&content) {
            Ok(serde_yaml::Value::Mapping(map)) => {
                let keys: Vec<String> = map
                    .keys()
                    .filter_map(|key| key.as_str().map(str::to_string))
                    .collect();
                ConfigFileState::Valid(format!("valid YAML (keys: {})", keys.join(", ")))
            }
            Ok(serde_yaml::Value::Null) => ConfigFileState::Valid("empty YAML document".to_string()),
            Ok(_) => ConfigFileState::Valid("valid YAML".to_string()),
            Err(err) => ConfigFileState::Invalid(err.to_string()),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct YamlCheck {
    pub(crate) path: String,
    #[serde(flatten)]
    pub(crate) state: ConfigFileState,
}

impl YamlCheck {
    pub(crate) fn describe(&self) -> String {
        match &self.state {
            ConfigFileState::Valid(detail) => format!("[ok] {} - {}", self.path, detail),
            ConfigFileState::Missing => format!("[missing] {}", self.path),
            ConfigFileState::Invalid(err) => format!("[error] {} - {}", self.path, err),
        }
    }
}

pub(crate) fn write_yaml_documents(root: &Path) -> Vec<(PathBuf, Result<(), UrlctlError>)> {
    YAML_DOCUMENTS
        .iter()
        .map(|doc| {
            let path = root.join(doc.relative_path);
            let result = write_atomic_text_file(&path, doc.template, None);
            match &result {
                Ok(()) => tracing::info!(path = %path.display(), "wrote YAML document"),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "YAML write failed"),
            }
            (path, result)
        })
        .collect()
}

pub(crate) fn validate_yaml_documents(root: &Path) -> Vec<YamlCheck> {
    YAML_DOCUMENTS
        .iter()
        .map(|doc| YamlCheck {
            path: doc.relative_path.to_string(),
            state: validate_config_file(&root.join(doc.relative_path), ConfigFormat::Yaml),
        })
        .collect()
}

/// Loads the JSON configuration document; a missing file is a hard error.
pub(crate) fn load_document(path: &Path) -> Result<Value, UrlctlError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UrlctlError::Config(format!(
                "{} not found; run the initial install first",
                path.display()
            )));
        }
        Err(err) => return Err(UrlctlError::Io(err)),
    };
    let doc: Value = serde_json::from_str(&content).map_err(|err| {
        UrlctlError::Config(format!("{} is not valid JSON: {err}", path.display()))
    })?;
    if !doc.is_object() {
        return Err(UrlctlError::Config(format!(
            "{} must contain a JSON object",
            path.display()
        )));
    }
    Ok(doc)
}

pub(crate) fn save_document(path: &Path, doc: &Value) -> Result<(), UrlctlError> {
    let mut text = serde_json::to_string_pretty(doc)?;
    text.push('\n');
    write_atomic_text_file_preserving_mode(path, &text, 0o644)?;
    tracing::debug!(path = %path.display(), "saved configuration document");
    Ok(())
}

/// Sets `dotted` (e.g. `notifications.email.enabled`), creating missing
/// intermediate objects. Refuses to replace a non-object intermediate.
pub(crate) fn set_slot(doc: &mut Value, dotted: &str, value: Value) -> Result<(), UrlctlError> {
    let mut parts: Vec<&str> = dotted.split('.').collect();
    let leaf = parts
        .pop()
        .filter(|leaf| !leaf.is_empty())
        .ok_or_else(|| UrlctlError::Config(format!("invalid config slot '{dotted}'")))?;
    let mut current = doc;
    let mut walked = String::new();
    for part in parts {
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(part);
        let map = current.as_object_mut().ok_or_else(|| {
            UrlctlError::Config(format!("config slot '{walked}' is not an object"))
        })?;
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = current
        .as_object_mut()
        .ok_or_else(|| UrlctlError::Config(format!("config slot '{walked}' is not an object")))?;
    map.insert(leaf.to_string(), value);
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), UrlctlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub(crate) fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), UrlctlError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "urlctl".to_string()),
        pid,
        ts
    ));

    if let Err(err) = stage_and_rename(&tmp_path, path, content, mode) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

fn stage_and_rename(
    tmp_path: &Path,
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> io::Result<()> {
    fs::write(tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(tmp_path, path)
}

fn write_atomic_text_file_preserving_mode(
    path: &Path,
    content: &str,
    default_mode: u32,
) -> Result<(), UrlctlError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(default_mode);
        write_atomic_text_file(path, content, Some(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = default_mode;
        write_atomic_text_file(path, content, None)
    }
}
