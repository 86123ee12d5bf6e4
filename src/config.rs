//! `bibtex-render.toml`: where entries and templates come from and how the
//! bibliography is built.
//!
//! ```toml
//! sources = ["$ROOT/bib/*.bib", "# disabled: /old/refs.bib"]
//! templates = "templates"
//! style = "alpha"
//! timeout_secs = 60
//!
//! [[directives]]
//! name = "ref"
//! template = "short"
//! delimiter = ", "
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bbl::{BblBuilder, LatexToolchain, DEFAULT_STYLE};
use crate::directives::Directive;
use crate::error::{Error, Result};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "bibtex-render.toml";

/// Replaced by the directory of the configuration file in source patterns.
pub const ROOT_VARIABLE: &str = "$ROOT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Glob patterns of `.bib` files. Entries starting with `#` are ignored.
    pub sources: Vec<String>,
    /// Directory of `*.tera` templates.
    pub templates: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub style: String,
    pub latex: String,
    pub bibtex: String,
    pub timeout_secs: u64,
    /// Build the bibliography right after loading the sources.
    pub build_on_load: bool,
    /// Replaces the default directive set.
    pub directives: Option<Vec<Directive>>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let toolchain = LatexToolchain::default();
        Self {
            sources: Vec::new(),
            templates: None,
            scratch_dir: std::env::temp_dir().join("bibtex-render"),
            style: DEFAULT_STYLE.to_string(),
            latex: toolchain.latex,
            bibtex: toolchain.bibtex,
            timeout_secs: toolchain.timeout.as_secs(),
            build_on_load: false,
            directives: None,
            root: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Reads a configuration file after checking its permissions.
    pub fn load(path: &Path) -> Result<Self> {
        check_permissions(path)?;
        let text = fs::read_to_string(path)?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let config = Self::from_toml(&text, root)?;
        info!(path = %path.display(), sources = config.sources.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(text: &str, root: &Path) -> Result<Self> {
        let mut config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.root = root.to_path_buf();
        Ok(config)
    }

    /// Source patterns with comments dropped and `$ROOT` expanded.
    pub fn source_patterns(&self) -> Vec<String> {
        let root = self.root.to_string_lossy();
        self.sources
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.replace(ROOT_VARIABLE, &root))
            .collect()
    }

    /// Files matching the source patterns, in pattern order.
    pub fn source_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for pattern in self.source_patterns() {
            let pattern = self.resolve(Path::new(&pattern));
            let paths = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::Config(format!("bad source pattern '{}': {}", pattern.display(), e)))?;
            let before = files.len();
            files.extend(paths.flatten());
            if files.len() == before {
                warn!(pattern = %pattern.display(), "source pattern matches no files");
            }
        }
        Ok(files)
    }

    pub fn templates_dir(&self) -> Option<PathBuf> {
        self.templates.as_deref().map(|dir| self.resolve(dir))
    }

    pub fn toolchain(&self) -> LatexToolchain {
        LatexToolchain {
            latex: self.latex.clone(),
            bibtex: self.bibtex.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn builder(&self) -> BblBuilder {
        BblBuilder::new(self.resolve(&self.scratch_dir), self.toolchain()).with_style(&self.style)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Fails for files that are group-writable or accessible by others.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o037 != 0 {
        warn!(path = %path.display(), mode = %format!("{:o}", mode & 0o777), "insecure permissions");
        return Err(Error::Permission(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<()> {
    fs::metadata(path)?;
    Ok(())
}
