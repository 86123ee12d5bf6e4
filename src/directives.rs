//! Inline directives such as `!bibitem{knuth84}` or `!cite{a,b}`.
//!
//! Each directive is a name and an action. Its argument is
//! `[<template>#]<selector>`, where the selector is either a comma
//! separated list of entry ids or a query expression
//! (`year=>/^199\d$/, 'author'=>/Knuth/`). A failing directive is replaced
//! by an error marker; the rest of the text is still processed.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::cite::{cite_markup, CitationCollector, EMPTY_BIBLIOGRAPHY};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::query::parse_query;
use crate::render::{Delimiter, Renderer};
use crate::store::Store;

/// Delimiter between the entries of list-rendering directives.
pub const PARAGRAPH: &str = "<p>";

/// What a directive does with its argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Render the selected entries in place.
    #[default]
    Entries,
    /// Collect the entries and insert numbered links.
    Cite,
    /// Render everything collected by `Cite` since the last `Putbib`.
    Putbib,
}

/// One directive, as configured under `[[directives]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub name: String,
    #[serde(default)]
    pub action: Action,
    /// Defaults to the directive name.
    #[serde(default)]
    pub template: Option<String>,
    /// Joins the rendered entries; without it the template renders all
    /// entries at once.
    #[serde(default)]
    pub delimiter: Option<String>,
}

impl Directive {
    pub fn entries(name: &str, delimiter: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Entries,
            template: None,
            delimiter: delimiter.map(str::to_string),
        }
    }

    pub fn cite(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Cite,
            template: None,
            delimiter: None,
        }
    }

    pub fn putbib(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Putbib,
            template: None,
            delimiter: Some(PARAGRAPH.to_string()),
        }
    }

    pub fn template_name(&self) -> &str {
        self.template.as_deref().unwrap_or(&self.name)
    }

    pub fn list_delimiter(&self) -> Delimiter {
        match &self.delimiter {
            Some(separator) => Delimiter::Join(separator.clone()),
            None => Delimiter::SingleTemplate,
        }
    }
}

/// `bibitem`, `shortbibitem`, `bibtex`, `cite`, `putbib` and
/// `bibliography`, in the order they are applied.
pub fn default_directives() -> Vec<Directive> {
    vec![
        Directive::entries("bibitem", Some(PARAGRAPH)),
        Directive::entries("shortbibitem", Some(PARAGRAPH)),
        Directive::entries("bibtex", Some(PARAGRAPH)),
        Directive::cite("cite"),
        Directive::putbib("putbib"),
        Directive::entries("bibliography", None),
    ]
}

/// Directives with their compiled patterns.
#[derive(Debug, Clone)]
pub struct DirectiveSet {
    directives: Vec<(Directive, Regex)>,
}

impl DirectiveSet {
    /// # Errors
    ///
    /// `Config` for names that are not plain words.
    pub fn new(directives: Vec<Directive>) -> Result<Self> {
        static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

        let directives = directives
            .into_iter()
            .map(|directive| {
                if !NAME.is_match(&directive.name) {
                    return Err(Error::Config(format!("invalid directive name '{}'", directive.name)));
                }
                // putbib may come without argument
                let argument = match directive.action {
                    Action::Putbib => "[^}]*",
                    _ => "[^}]+",
                };
                let pattern = format!(r"!{}\{{({})\}}", directive.name, argument);
                let regex = Regex::new(&pattern).map_err(|e| Error::Config(e.to_string()))?;
                Ok((directive, regex))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { directives })
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.directives.iter().map(|(directive, _)| directive)
    }

    /// Replaces every directive in `text`, one directive name after the
    /// other. Citations are collected under `context`.
    pub fn apply(
        &self,
        text: &str,
        renderer: &Renderer<'_>,
        collector: &CitationCollector,
        context: &str,
    ) -> String {
        self.directives
            .iter()
            .fold(text.to_string(), |text, (directive, regex)| {
                regex
                    .replace_all(&text, |caps: &Captures| {
                        let argument = &caps[1];
                        expand(directive, argument, renderer, collector, context).unwrap_or_else(|e| {
                            warn!(directive = %directive.name, %argument, error = %e, "directive failed");
                            error_marker(&e, argument)
                        })
                    })
                    .into_owned()
            })
    }
}

impl Default for DirectiveSet {
    fn default() -> Self {
        Self::new(default_directives()).unwrap_or_else(|e| {
            error!(error = %e, "default directives rejected, no directive will be replaced");
            Self {
                directives: Vec::new(),
            }
        })
    }
}

/// Replacement text for a directive that failed.
pub fn error_marker(error: &Error, near: &str) -> String {
    format!("<div class=\"flash error\"><b>{}</b> near {}</div>", error, near)
}

fn expand(
    directive: &Directive,
    argument: &str,
    renderer: &Renderer<'_>,
    collector: &CitationCollector,
    context: &str,
) -> Result<String> {
    match directive.action {
        Action::Entries => {
            let (template, selector) = split_template(argument, directive.template_name());
            if !renderer.templates().contains(template) {
                return Err(Error::MissingTemplate(template.to_string()));
            }
            let entries = select(renderer.store(), selector)?;
            renderer.render_list(template, &entries, &directive.list_delimiter())
        }
        Action::Cite => {
            let entries = resolve_ids(renderer.store(), argument)?;
            let numbers = collector.cite(context, entries.iter().map(|&e| e.clone()).collect());
            Ok(cite_markup(&entries, &numbers))
        }
        Action::Putbib => {
            let template = match argument.trim() {
                "" => directive.template_name(),
                name => name,
            };
            if !collector.is_collecting(context) {
                return Ok(EMPTY_BIBLIOGRAPHY.to_string());
            }
            // a missing template keeps the citations for a later putbib
            if !renderer.templates().contains(template) {
                return Err(Error::MissingTemplate(template.to_string()));
            }
            let Some(cited) = collector.take(context) else {
                return Ok(EMPTY_BIBLIOGRAPHY.to_string());
            };
            let entries: Vec<&Entry> = cited.iter().collect();
            renderer.render_list(template, &entries, &directive.list_delimiter())
        }
    }
}

/// Splits `tpl#selector` at the last `#`.
fn split_template<'a>(argument: &'a str, default: &'a str) -> (&'a str, &'a str) {
    match argument.rfind('#') {
        Some(at) => (argument[..at].trim(), &argument[at + 1..]),
        None => (default, argument),
    }
}

fn select<'s>(store: &'s Store, selector: &str) -> Result<Vec<&'s Entry>> {
    if selector.contains("=>") {
        store.query(&parse_query(selector)?)
    } else {
        resolve_ids(store, selector)
    }
}

fn resolve_ids<'s>(store: &'s Store, ids: &str) -> Result<Vec<&'s Entry>> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| store.get(id).ok_or_else(|| Error::UnknownEntry(id.to_string())))
        .collect()
}
