//! The engine ties the store, templates, bibliography builder, directives
//! and citation collector together.
//!
//! Readers work on a snapshot of the store; [`Engine::reload`] reads the
//! sources into a new store and swaps it in.

use std::fs;
use std::sync::{Arc, Mutex, RwLock};

use tera::Context;
use tracing::{error, info, warn};

use crate::bbl::BblBuilder;
use crate::cite::CitationCollector;
use crate::config::Config;
use crate::directives::{default_directives, DirectiveSet};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::latex::latex_to_html;
use crate::query::{disable_predicates, parse_query};
use crate::render::Renderer;
use crate::store::Store;
use crate::templates::{TemplateSet, DEFAULT_TEMPLATE};

/// Template of [`Engine::list_entries`].
pub const LIST_TEMPLATE: &str = "list";

/// Template of [`Engine::list_authors`].
pub const AUTHORS_TEMPLATE: &str = "authors";

#[derive(Debug)]
pub struct Engine {
    store: RwLock<Arc<Store>>,
    templates: TemplateSet,
    builder: BblBuilder,
    directives: DirectiveSet,
    collector: CitationCollector,
    config: Option<Config>,
    load_errors: Mutex<Vec<String>>,
}

impl Engine {
    /// Assembles an engine from ready parts.
    ///
    /// Predicate queries are disabled from here on: entries are now reachable
    /// from document text.
    pub fn new(store: Store, templates: TemplateSet, builder: BblBuilder, directives: DirectiveSet) -> Self {
        disable_predicates();
        Self {
            store: RwLock::new(Arc::new(store)),
            templates,
            builder,
            directives,
            collector: CitationCollector::new(),
            config: None,
            load_errors: Mutex::new(Vec::new()),
        }
    }

    /// Loads sources and templates as configured.
    ///
    /// Broken source or template files are logged and recorded in
    /// [`Engine::load_errors`] instead of failing the load.
    ///
    /// # Errors
    ///
    /// `Config` for bad source patterns or directive names.
    pub fn load(config: &Config) -> Result<Self> {
        let directives = DirectiveSet::new(config.directives.clone().unwrap_or_else(default_directives))?;

        let mut errors = Vec::new();
        let mut templates = TemplateSet::new();
        if let Some(dir) = config.templates_dir() {
            info!(dir = %dir.display(), "reading templates");
            errors.extend(templates.load_dir(&dir).into_iter().map(|e| e.to_string()));
        }

        let (store, source_errors) = read_sources(config)?;
        errors.extend(source_errors);

        let mut engine = Self::new(store, templates, config.builder(), directives);
        engine.config = Some(config.clone());
        if config.build_on_load {
            if let Err(e) = engine.snapshot().ensure_bbl(&engine.builder) {
                error!(error = %e, "bibliography build failed");
                errors.push(e.to_string());
            }
        }
        engine.load_errors = Mutex::new(errors);
        Ok(engine)
    }

    /// Reads the configured sources again and replaces the store.
    ///
    /// Returns the per-file errors of the new load.
    pub fn reload(&self) -> Result<Vec<String>> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::Config("engine was not loaded from a configuration".to_string()))?;

        let (store, mut errors) = read_sources(config)?;
        if config.build_on_load {
            if let Err(e) = store.ensure_bbl(&self.builder) {
                error!(error = %e, "bibliography build failed");
                errors.push(e.to_string());
            }
        }

        *self.store.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(store);
        *self.load_errors.lock().unwrap_or_else(|p| p.into_inner()) = errors.clone();
        info!(errors = errors.len(), "reloaded sources");
        Ok(errors)
    }

    /// The current store.
    pub fn snapshot(&self) -> Arc<Store> {
        Arc::clone(&self.store.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    pub fn builder(&self) -> &BblBuilder {
        &self.builder
    }

    pub fn collector(&self) -> &CitationCollector {
        &self.collector
    }

    /// Errors recorded by the last load or reload.
    pub fn load_errors(&self) -> Vec<String> {
        self.load_errors.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replaces the directives in `text`; citations are collected under
    /// `context`.
    pub fn process(&self, text: &str, context: &str) -> String {
        let store = self.snapshot();
        let renderer = Renderer::new(&store, &self.templates, &self.builder);
        self.directives.apply(text, &renderer, &self.collector, context)
    }

    pub fn entry(&self, id: &str) -> Result<Entry> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownEntry(id.to_string()))
    }

    /// Entries matching a query expression such as `year=>/^199/`.
    pub fn query_expr(&self, expr: &str) -> Result<Vec<Entry>> {
        let query = parse_query(expr)?;
        let store = self.snapshot();
        let found = store.query(&query)?;
        Ok(found.into_iter().cloned().collect())
    }

    /// Every entry, ordered by the raw `author` field, each followed by
    /// `<p>`.
    ///
    /// Without a `list` template the entries are rendered with
    /// [`DEFAULT_TEMPLATE`].
    pub fn list_entries(&self) -> Result<String> {
        let store = self.snapshot();
        let mut entries: Vec<&Entry> = store.iter().collect();
        // entries without author come first
        entries.sort_by(|a, b| a.fields.get("author").cmp(&b.fields.get("author")));

        let fallback;
        let templates = if self.templates.contains(LIST_TEMPLATE) {
            &self.templates
        } else {
            fallback = self.templates.clone().with(LIST_TEMPLATE, DEFAULT_TEMPLATE)?;
            &fallback
        };

        let renderer = Renderer::new(&store, templates, &self.builder);
        let mut result = String::new();
        for entry in entries {
            result.push_str(&renderer.render_entry(entry, LIST_TEMPLATE)?);
            result.push_str("<p>");
        }
        Ok(result)
    }

    /// Every author through the `authors` template.
    ///
    /// The template sees `name`, `firstname` and `lastname` as HTML,
    /// `author` as LaTeX and `is_last` for the final author.
    pub fn list_authors(&self) -> Result<String> {
        if !self.templates.contains(AUTHORS_TEMPLATE) {
            return Err(Error::MissingTemplate(AUTHORS_TEMPLATE.to_string()));
        }

        let authors = self.snapshot().authors();
        let mut result = String::new();
        for (i, author) in authors.iter().enumerate() {
            let name = latex_to_html(author);
            let words: Vec<&str> = name.split_whitespace().collect();
            let (lastname, firstnames) = words.split_last().map_or(("", &[][..]), |(l, f)| (*l, f));

            let mut context = Context::new();
            context.insert("name", &name);
            context.insert("firstname", &firstnames.join(" "));
            context.insert("lastname", lastname);
            context.insert("author", author);
            context.insert("is_last", &(i + 1 == authors.len()));
            result.push_str(&self.templates.render(AUTHORS_TEMPLATE, &context)?);
        }
        Ok(result)
    }

    /// `<b>name</b> <em>description</em><br>` for every template.
    pub fn list_templates(&self) -> String {
        self.templates
            .names()
            .map(|name| format!("<b>{}</b> <em>{}</em><br>", name, self.templates.description(name)))
            .collect()
    }
}

/// Scans every configured source file into a new store.
///
/// Unreadable or malformed files are skipped and reported.
fn read_sources(config: &Config) -> Result<(Store, Vec<String>)> {
    let mut store = Store::new();
    let mut errors = Vec::new();
    for path in config.source_files()? {
        info!(path = %path.display(), "reading and parsing");
        let scanned = fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|text| store.scan(&text));
        if let Err(e) = scanned {
            warn!(path = %path.display(), error = %e, "failed to read source");
            errors.push(format!("{}: {}", path.display(), e));
        }
    }
    info!(entries = store.len(), "sources read");
    Ok((store, errors))
}
