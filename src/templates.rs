//! Named rendering templates.
//!
//! Templates are written in the [Tera](https://keats.github.io/tera/)
//! language and loaded from `*.tera` files; the file stem is the template
//! name. A template may start with a `{# ... #}` comment describing it,
//! which [`TemplateSet::description`] reports in template listings.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tera::{Context, Tera, Value};
use tracing::{info, warn};

use crate::config::check_permissions;
use crate::error::{Error, Result};
use crate::latex::{latex_to_html, latex_to_text};

/// Used for entries listings without a `list` template and in place of
/// template files that fail the permission check.
pub const DEFAULT_TEMPLATE: &str = "{# authors, title and the rest of the bibliography item #}\
{{ bbl_authors }}<br>
<em>{{ bbl_title }}</em><br>
{{ bbl_remainder | join(sep=\"<br>\") }}<br>
";

/// Extension of template files.
pub const TEMPLATE_EXTENSION: &str = "tera";

static DESCRIPTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\A\s*\{#([^#]*)#\}").unwrap());

/// Templates by name, compiled into one Tera instance.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    tera: Tera,
    sources: BTreeMap<String, String>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateSet {
    /// Creates an empty set with the `latex2html` and `latex2txt` filters.
    pub fn new() -> Self {
        let mut tera = Tera::default();
        // output is markup, nothing gets escaped
        tera.autoescape_on(vec![]);
        tera.register_filter("latex2html", latex2html);
        tera.register_filter("latex2txt", latex2txt);
        Self {
            tera,
            sources: BTreeMap::new(),
        }
    }

    /// Adds or replaces a template.
    ///
    /// # Errors
    ///
    /// Returns `Error::Template` if the text does not parse.
    pub fn insert(&mut self, name: &str, text: &str) -> Result<()> {
        self.tera.add_raw_template(name, text)?;
        self.sources.insert(name.to_string(), text.to_string());
        Ok(())
    }

    /// Builder-style [`TemplateSet::insert`].
    pub fn with(mut self, name: &str, text: &str) -> Result<Self> {
        self.insert(name, text)?;
        Ok(self)
    }

    /// Loads every `*.tera` file in `dir`.
    ///
    /// Problems with single files do not stop the load; they are logged and
    /// returned. A file with unsafe permissions is replaced by
    /// [`DEFAULT_TEMPLATE`].
    pub fn load_dir(&mut self, dir: &Path) -> Vec<Error> {
        let mut errors = Vec::new();
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            TEMPLATE_EXTENSION
        );
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => return vec![Error::Config(e.to_string())],
        };

        for path in paths.flatten() {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };

            if let Err(e) = check_permissions(&path) {
                warn!(path = %path.display(), "ignoring template, using the default template");
                errors.push(e);
                if let Err(e) = self.insert(&name, DEFAULT_TEMPLATE) {
                    errors.push(e);
                }
                continue;
            }

            let loaded = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| self.insert(&name, &text));
            match loaded {
                Ok(()) => info!(%name, "defined template"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load template");
                    errors.push(e);
                }
            }
        }
        errors
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.sources.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Template names in alphabetical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The text of a leading `{# ... #}` comment, or an empty string.
    pub fn description(&self, name: &str) -> String {
        self.get(name)
            .and_then(|text| DESCRIPTION_RE.captures(text))
            .map(|cap| cap[1].trim().to_string())
            .unwrap_or_default()
    }

    /// Renders a template.
    ///
    /// # Errors
    ///
    /// `MissingTemplate` for unknown names, `Template` for evaluation errors.
    pub fn render(&self, name: &str, context: &Context) -> Result<String> {
        if !self.contains(name) {
            return Err(Error::MissingTemplate(name.to_string()));
        }
        Ok(self.tera.render(name, context)?)
    }
}

fn latex2html(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("latex2html filter expects a string"))?;
    Ok(Value::String(latex_to_html(s)))
}

fn latex2txt(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("latex2txt filter expects a string"))?;
    Ok(Value::String(latex_to_text(s)))
}
