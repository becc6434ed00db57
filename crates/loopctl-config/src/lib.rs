//! Session configuration (spec.md §6): a single TOML file loaded once at
//! startup. The core reads `[recording]` and each worker's routine list;
//! the `[camera]`/`[display]`/`[io]`/`[gui]` sections are collaborator
//! territory and are kept as opaque [`toml::Value`]s so a backend's schema
//! can evolve without this crate's knowledge — the same forward-tolerance
//! the teacher's `ConfigFile` gives unknown fields.
//!
//! `discover()`/`load_from()` follow `core-config`'s pattern: prefer a
//! local `loopctl.toml` in the working directory, then fall back to the
//! platform config directory, and tolerate a missing or unparseable file
//! by falling back to defaults rather than failing startup outright — a
//! session can always run with no configured recording/routines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecordingConfig {
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Per-worker routine list: the only thing the core reads from a worker's
/// section (`camera.routines`, `display.routines`, ...). Everything else in
/// the section is preserved in `extra` as an opaque TOML table.
#[derive(Debug, Clone, Default)]
pub struct WorkerSection {
    pub routines: Vec<String>,
    pub extra: toml::value::Table,
}

impl<'de> Deserialize<'de> for WorkerSection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut table = toml::value::Table::deserialize(deserializer)?;
        let routines = match table.remove("routines") {
            Some(toml::Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Ok(WorkerSection { routines, extra: table })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub camera: WorkerSection,
    #[serde(default)]
    pub display: WorkerSection,
    #[serde(default)]
    pub io: WorkerSection,
    #[serde(default)]
    pub gui: WorkerSection,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub raw: Option<String>,
    pub file: ConfigFile,
}

impl Config {
    pub fn routines_for(&self, worker: &str) -> &[String] {
        match worker {
            "camera" => &self.file.camera.routines,
            "display" => &self.file.display.routines,
            "io" => &self.file.io.routines,
            "gui" => &self.file.gui.routines,
            _ => &[],
        }
    }
}

/// Best-effort config path: a local `loopctl.toml` takes priority, then the
/// platform config directory (`~/.config/loopctl/loopctl.toml` on Linux).
pub fn discover() -> PathBuf {
    let local = PathBuf::from("loopctl.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("loopctl").join("loopctl.toml");
    }
    PathBuf::from("loopctl.toml")
}

/// Loads and parses the config at `path` (or the discovered default). A
/// missing file yields `Config::default()` (no recording, no routines); a
/// present-but-unparseable file is a hard error, since a typo'd session
/// config should surface at startup rather than silently run with defaults.
pub fn load_from(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(discover);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    let file = toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
    Ok(Config { raw: Some(content), file })
}

/// A minimal device-requirement assertion, grounded on the registration
/// check `mappapp`'s controller performs before starting a protocol: every
/// attribute a protocol's routines or collaborator sections declare must
/// already be known to the attribute registry, or the protocol is refused
/// rather than left to fail mid-run.
pub fn assert_device_requirements(
    required: &[String],
    available: &BTreeMap<String, ()>,
) -> Result<(), Vec<String>> {
    let missing: Vec<String> =
        required.iter().filter(|name| !available.contains_key(*name)).cloned().collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopctl.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_from(Some(PathBuf::from("__does_not_exist__.toml"))).unwrap();
        assert!(cfg.file.recording.attributes.is_empty());
        assert!(cfg.file.recording.output_folder.is_none());
    }

    #[test]
    fn parses_recording_section() {
        let (_dir, path) = write_temp(
            "[recording]\noutput_folder = \"/data/session1\"\nattributes = [\"camera/frame\", \"io/pin0\"]\n",
        );
        let cfg = load_from(Some(path)).unwrap();
        assert_eq!(cfg.file.recording.output_folder, Some(PathBuf::from("/data/session1")));
        assert_eq!(cfg.file.recording.attributes, vec!["camera/frame", "io/pin0"]);
    }

    #[test]
    fn parses_worker_routine_lists_and_keeps_extra_fields_opaque() {
        let (_dir, path) = write_temp(
            "[camera]\nroutines = [\"tracking\", \"io_save\"]\nmodel = \"fliptest-cam\"\nexposure_us = 2000\n",
        );
        let cfg = load_from(Some(path)).unwrap();
        assert_eq!(cfg.routines_for("camera"), &["tracking".to_string(), "io_save".to_string()]);
        assert_eq!(cfg.file.camera.extra.get("model").and_then(|v| v.as_str()), Some("fliptest-cam"));
        assert_eq!(cfg.file.camera.extra.get("exposure_us").and_then(|v| v.as_integer()), Some(2000));
    }

    #[test]
    fn unparseable_file_is_a_hard_error() {
        let (_dir, path) = write_temp("not = [valid toml");
        let err = load_from(Some(path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn routines_for_unknown_worker_is_empty() {
        let cfg = Config::default();
        assert!(cfg.routines_for("nonexistent").is_empty());
    }

    #[test]
    fn device_requirements_reports_missing_attributes() {
        let mut available = BTreeMap::new();
        available.insert("camera/frame".to_string(), ());
        let missing =
            assert_device_requirements(&["camera/frame".to_string(), "io/pin0".to_string()], &available)
                .unwrap_err();
        assert_eq!(missing, vec!["io/pin0".to_string()]);
    }

    #[test]
    fn device_requirements_passes_when_all_available() {
        let mut available = BTreeMap::new();
        available.insert("camera/frame".to_string(), ());
        assert_device_requirements(&["camera/frame".to_string()], &available).unwrap();
    }
}
