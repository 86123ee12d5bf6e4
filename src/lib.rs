//! bibtex-render: BibTeX entries as HTML snippets.
//!
//! This library provides functionality to:
//! - Parse BibTeX sources into an in-memory store and query it
//! - Format entries with `latex` and `bibtex` (see [`bbl`])
//! - Render entries through Tera templates
//! - Replace inline directives like `!bibitem{id}` or `!cite{a,b}` in text

pub mod bbl;
pub mod cite;
pub mod config;
pub mod directives;
pub mod engine;
pub mod entry;
pub mod error;
pub mod latex;
pub mod lexer;
pub mod parser;
pub mod query;
pub mod render;
pub mod store;
pub mod templates;

pub use bbl::{BblBuilder, LatexToolchain, Stage, ToolOutput, Toolchain};
pub use cite::CitationCollector;
pub use config::Config;
pub use directives::{Action, Directive, DirectiveSet};
pub use engine::Engine;
pub use entry::{Entry, SourceSpan};
pub use error::{Error, Result};
pub use latex::{latex_to_html, latex_to_text};
pub use parser::parse_str;
pub use query::{disable_predicates, parse_query, Matcher, Query};
pub use render::{Delimiter, Renderer};
pub use store::Store;
pub use templates::TemplateSet;
