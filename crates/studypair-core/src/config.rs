use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use time::macros::format_description;
use time::OffsetDateTime;

/// Filesystem layout for pipeline inputs and outputs. Relative entries are
/// resolved against the config base directory at load time.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub prompts_dir: Option<PathBuf>,
    pub sql_dir: Option<PathBuf>,
    pub run_dir_template: Option<String>,
}

/// Warehouse connection identifiers. `credentials` points at a file whose
/// contents are a bearer access token; credential exchange happens outside
/// this pipeline.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BigQueryConfig {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
    pub credentials: Option<PathBuf>,
}

/// Term lists and bounds driving the candidate pair query.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    pub pet_report_terms: Vec<String>,
    pub ct_chest_terms: Vec<String>,
    pub ct_noncontrast_terms: Vec<String>,
    pub ct_with_contrast_terms: Vec<String>,
    pub ct_exclude_terms: Vec<String>,
    pub max_days: u32,
    pub sample_limit: Option<usize>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            pet_report_terms: Vec::new(),
            ct_chest_terms: Vec::new(),
            ct_noncontrast_terms: Vec::new(),
            ct_with_contrast_terms: Vec::new(),
            ct_exclude_terms: Vec::new(),
            max_days: 60,
            sample_limit: None,
        }
    }
}

/// Parameters for the LLM extraction calls.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub retries: u32,
    pub concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-5.2".to_string(),
            endpoint: None,
            temperature: 0.2,
            max_output_tokens: 2000,
            retries: 3,
            concurrency: 6,
        }
    }
}

/// Top-level pipeline configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub bigquery: BigQueryConfig,
    pub selection: SelectionConfig,
    pub llm: LlmConfig,
}

const BQ_PROJECT_ENV: &str = "BQ_PROJECT";
const BQ_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Load configuration from a YAML file, apply environment overrides, and
/// resolve relative paths against `base_dir` (defaults to the config file's
/// parent directory).
pub fn load_config(path: &Path, base_dir: Option<&Path>) -> Result<Config> {
    let base = base_dir
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let mut cfg: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("config file at {} must be a YAML mapping", path.display()))?;

    apply_env_overrides(&mut cfg, &env::vars().collect::<Vec<_>>());
    resolve_paths(&mut cfg.paths, &base);
    if let Some(credentials) = cfg.bigquery.credentials.take() {
        cfg.bigquery.credentials = Some(resolve_path(credentials, &base));
    }
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config, vars: &[(String, String)]) {
    for (key, value) in vars {
        if value.trim().is_empty() {
            continue;
        }
        match key.as_str() {
            BQ_PROJECT_ENV => cfg.bigquery.project = Some(value.clone()),
            BQ_CREDENTIALS_ENV => cfg.bigquery.credentials = Some(PathBuf::from(value)),
            OPENAI_API_KEY_ENV => cfg.llm.api_key = Some(value.clone()),
            _ => {}
        }
    }
}

fn resolve_paths(paths: &mut PathsConfig, base: &Path) {
    for entry in [
        &mut paths.output_dir,
        &mut paths.logs_dir,
        &mut paths.prompts_dir,
        &mut paths.sql_dir,
    ] {
        if let Some(path) = entry.take() {
            *entry = Some(resolve_path(path, base));
        }
    }
}

fn resolve_path(path: PathBuf, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Create (or reuse) a run directory under `paths.output_dir`, named either
/// explicitly or from `run_dir_template` with `{date}` replaced by a UTC
/// timestamp. Each pipeline invocation gets its own directory so artifacts
/// from different runs never collide.
pub fn create_run_dir(cfg: &Config, run_name: Option<&str>) -> Result<PathBuf> {
    let output_dir = cfg
        .paths
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("outputs"));
    let name = match run_name {
        Some(name) => name.to_string(),
        None => {
            let template = cfg
                .paths
                .run_dir_template
                .clone()
                .unwrap_or_else(|| "run_{date}".to_string());
            let stamp = OffsetDateTime::now_utc()
                .format(&format_description!(
                    "[year][month][day]_[hour][minute][second]"
                ))
                .context("failed to format run timestamp")?;
            template.replace("{date}", &stamp)
        }
    };
    let run_dir = output_dir.join(name);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn with_env_lock<F: FnOnce()>(func: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var(BQ_PROJECT_ENV);
        env::remove_var(BQ_CREDENTIALS_ENV);
        env::remove_var(OPENAI_API_KEY_ENV);
        func();
        env::remove_var(BQ_PROJECT_ENV);
        env::remove_var(BQ_CREDENTIALS_ENV);
        env::remove_var(OPENAI_API_KEY_ENV);
    }

    const SAMPLE: &str = r#"
paths:
  output_dir: outputs
  prompts_dir: prompts
bigquery:
  project: proj
  dataset: imaging
  table: studies
selection:
  ct_chest_terms: ["CHEST"]
  max_days: 30
llm:
  model: gpt-5.2
  concurrency: 4
"#;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("selection.yaml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_typed_sections_with_defaults() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(dir.path(), SAMPLE);
            let cfg = load_config(&path, None).unwrap();
            assert_eq!(cfg.bigquery.dataset.as_deref(), Some("imaging"));
            assert_eq!(cfg.selection.max_days, 30);
            assert_eq!(cfg.selection.sample_limit, None);
            assert_eq!(cfg.llm.concurrency, 4);
            assert_eq!(cfg.llm.retries, 3);
            assert!((cfg.llm.temperature - 0.2).abs() < f32::EPSILON);
        });
    }

    #[test]
    fn resolves_relative_paths_against_base_dir() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(dir.path(), SAMPLE);
            let cfg = load_config(&path, None).unwrap();
            assert_eq!(
                cfg.paths.output_dir.as_deref(),
                Some(dir.path().join("outputs").as_path())
            );
            assert_eq!(
                cfg.paths.prompts_dir.as_deref(),
                Some(dir.path().join("prompts").as_path())
            );
        });
    }

    #[test]
    fn env_vars_override_config_values() {
        with_env_lock(|| {
            env::set_var(BQ_PROJECT_ENV, "env-proj");
            env::set_var(OPENAI_API_KEY_ENV, "env-key");
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(dir.path(), SAMPLE);
            let cfg = load_config(&path, None).unwrap();
            assert_eq!(cfg.bigquery.project.as_deref(), Some("env-proj"));
            assert_eq!(cfg.llm.api_key.as_deref(), Some("env-key"));
        });
    }

    #[test]
    fn blank_env_vars_are_ignored() {
        with_env_lock(|| {
            env::set_var(BQ_PROJECT_ENV, "  ");
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(dir.path(), SAMPLE);
            let cfg = load_config(&path, None).unwrap();
            assert_eq!(cfg.bigquery.project.as_deref(), Some("proj"));
        });
    }

    #[test]
    fn rejects_non_mapping_yaml() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(dir.path(), "- just\n- a\n- list\n");
            let err = load_config(&path, None).unwrap_err();
            assert!(err.to_string().contains("YAML mapping"));
        });
    }

    #[test]
    fn run_dir_uses_explicit_name_or_template() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = Config::default();
            cfg.paths.output_dir = Some(dir.path().to_path_buf());
            cfg.paths.run_dir_template = Some("batch_{date}".to_string());

            let named = create_run_dir(&cfg, Some("pinned")).unwrap();
            assert_eq!(named, dir.path().join("pinned"));
            assert!(named.is_dir());

            let stamped = create_run_dir(&cfg, None).unwrap();
            let name = stamped.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("batch_"), "got {name}");
            assert!(stamped.is_dir());
        });
    }
}
