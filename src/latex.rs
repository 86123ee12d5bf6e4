//! Conversion of the LaTeX found in `bibtex` output into HTML or plain text.
//!
//! Both conversions are an ordered list of regex substitutions. Order
//! matters: accents written inside braces (`{\"o}`) must be rewritten before
//! the generic brace cleanup strips the braces away.

use once_cell::sync::Lazy;
use regex::Regex;

type Rules = Vec<(Regex, &'static str)>;

fn compile(rules: &[(&str, &'static str)]) -> Rules {
    rules
        .iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), *replacement))
        .collect()
}

static HTML_RULES: Lazy<Rules> = Lazy::new(|| {
    compile(&[
        (r"\{([aeiouAEIOU])\}", "$1"),
        (r#"\{\\"([aouAOU])\}"#, "&${1}uml;"),
        (r#"\\?"([aouAOU])"#, "&${1}uml;"),
        (r#"\{((\\"s)|(\\3))\}"#, "&szlig;"),
        (r#"("s|\\3|\\"s)"#, "&szlig;"),
        (r"\{\\'([aeiouAEIOU])\}", "&${1}acute;"),
        (r"\\?'([aeiouAEIOU])", "&${1}acute;"),
        (r"\{\\\^([aeiouAEIOU])\}", "&${1}circ;"),
        (r"\\?\^([aeiouAEIOU])", "&${1}circ;"),
        (r"\{([^{}]*?)\\em\s+((?:[^{}]|\{[^{}]*\})*)\}", "$1<em>$2</em>"),
        (r"([^\\])\{", "$1"),
        (r"([^\\])\}", "$1"),
        (r"~", " "),
    ])
});

static TEXT_RULES: Lazy<Rules> = Lazy::new(|| {
    compile(&[
        (r"\{([aeiouAEIOU])\}", "$1"),
        (r#"\{\\"([aouAOU])\}"#, "${1}e"),
        (r#"\\?"([aouAOU])"#, "${1}e"),
        (r#"\{((\\"s)|(\\3))\}"#, "ss"),
        (r#"("s|\\3|\\"s)"#, "ss"),
        (r"\{\\'([aeiouAEIOU])\}", "$1"),
        (r"\\?'([aeiouAEIOU])", "$1"),
        (r"\{\\\^([aeiouAEIOU])\}", "$1"),
        (r"\\?\^([aeiouAEIOU])", "$1"),
        (r"\{([^{}]*?)\\em\s+((?:[^{}]|\{[^{}]*\})*)\}", "$1$2"),
        (r"([^\\])\{", "$1"),
        (r"([^\\])\}", "$1"),
        (r"~", " "),
    ])
});

fn apply(rules: &Rules, text: &str) -> String {
    rules.iter().fold(text.to_string(), |acc, (regex, replacement)| {
        regex.replace_all(&acc, *replacement).into_owned()
    })
}

/// Converts accents, `\em` and braces to HTML.
///
/// # Examples
///
/// ```
/// use bibtex_render::latex::latex_to_html;
///
/// assert_eq!(latex_to_html(r#"M{\"u}ller, {\em Title}"#), "M&uuml;ller, <em>Title</em>");
/// ```
pub fn latex_to_html(text: &str) -> String {
    apply(&HTML_RULES, text)
}

/// Converts accents and braces to plain ASCII (`{\"u}` becomes `ue`).
pub fn latex_to_text(text: &str) -> String {
    apply(&TEXT_RULES, text)
}
