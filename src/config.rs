//! Case library loading and environment settings.

use crate::model::{Case, VariableMap};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Every case known to a run, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CaseLibrary {
    cases: IndexMap<String, Case>,
    base_dir: Option<PathBuf>,
}

/// A case file holds either a `cases:` list or a single case.
#[derive(Deserialize)]
#[serde(untagged)]
enum CaseFile {
    Many { cases: Vec<Case> },
    One(Case),
}

impl CaseLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that relative parameter file paths are resolved
    /// against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Add a case, deriving its id from the name when it has none.
    pub fn insert(&mut self, mut case: Case) -> Result<()> {
        if case.id.trim().is_empty() {
            case.id = slugify(&case.name);
        }
        if case.id.is_empty() {
            bail!("case '{}' has no usable id", case.name);
        }
        if self.cases.contains_key(&case.id) {
            bail!("duplicate case id '{}'", case.id);
        }
        self.cases.insert(case.id.clone(), case);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Case> {
        self.cases.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.cases.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Load one case file.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        info!("Loading cases from {}", path.display());
        let content = fs::read_to_string(path)
            .context(format!("Failed to read case file: {}", path.display()))?;
        let cases = match serde_yaml::from_str::<CaseFile>(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))?
        {
            CaseFile::Many { cases } => cases,
            CaseFile::One(case) => vec![case],
        };
        let count = cases.len();
        for case in cases {
            self.insert(case)
                .context(format!("Invalid case in {}", path.display()))?;
        }
        debug!("Loaded {count} cases from {}", path.display());
        Ok(count)
    }

    /// Load every `.yaml`/`.yml` file of `dir`, in file name order.
    /// Files that fail to parse are logged and skipped.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        info!("Loading cases from directory: {}", dir.display());
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_case_file(path))
            .collect();
        paths.sort();

        let mut total = 0;
        for path in paths {
            match self.load_file(&path) {
                Ok(count) => total += count,
                Err(err) => warn!("Skipping {}: {err:#}", path.display()),
            }
        }
        info!("Loaded {total} cases from {}", dir.display());
        Ok(total)
    }

    /// Load files and directories. The first directory given (or the
    /// parent of the first file) becomes the base directory.
    pub fn load_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut library = Self::new();
        for path in paths {
            let path = path.as_ref();
            if library.base_dir.is_none() {
                let base = if path.is_dir() { Some(path) } else { path.parent() };
                library.base_dir = base.map(Path::to_path_buf);
            }
            if path.is_dir() {
                library.load_dir(path)?;
            } else {
                library.load_file(path)?;
            }
        }
        info!("Loaded {} cases in total", library.len());
        Ok(library)
    }
}

/// Lowercase ASCII slug of `name`, with runs of separators collapsed to `_`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if (ch.is_whitespace() || matches!(ch, '-' | '_')) && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn is_case_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Per-environment settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentSettings>,
    /// Default HTTP timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Lowest-precedence variables of every case run.
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub webdriver: Option<WebDriverSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDriverSettings {
    pub url: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub screenshots: bool,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read settings: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse settings from {}", path.display()))
    }

    /// Settings of environment `code`. An unknown code is only an
    /// error when environments are configured at all.
    pub fn environment(&self, code: &str) -> Result<EnvironmentSettings> {
        match self.environments.get(code) {
            Some(env) => Ok(env.clone()),
            None if self.environments.is_empty() => Ok(EnvironmentSettings::default()),
            None => bail!(
                "unknown environment '{code}' (known: {})",
                self.environments.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }
}
