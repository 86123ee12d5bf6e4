//! BibTeX entries.

use indexmap::IndexMap;
use serde::Serialize;

/// Location and verbatim text of an entry in the document it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSpan {
    pub offset: usize,
    pub length: usize,
    pub text: String,
}

/// One bibliographic record.
///
/// Field names are stored lower-cased. Metadata that is not a BibTeX field
/// (id, type, source span) lives beside the fields and is reachable through
/// the `$`-prefixed names accepted by [`Entry::get`]. The formatted
/// bibliography text produced by `bibtex` is kept by the owning
/// [`Store`](crate::Store), see [`Store::bbl`](crate::Store::bbl); store
/// queries see it as `$bbl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub fields: IndexMap<String, String>,
    pub source: Option<SourceSpan>,
}

impl Entry {
    /// Creates an entry without fields. The type is lower-cased.
    pub fn new(id: impl Into<String>, entry_type: &str) -> Self {
        Self {
            id: id.into(),
            entry_type: entry_type.trim_start_matches('@').to_lowercase(),
            fields: IndexMap::new(),
            source: None,
        }
    }

    /// Sets a field, lower-casing its name.
    pub fn add_field(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(name.to_lowercase(), value.into());
    }

    /// Builder-style [`Entry::add_field`].
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.add_field(name, value);
        self
    }

    /// Looks up a field or a reserved `$` name.
    ///
    /// Reserved names: `$id`, `$type`, `$source`, `$source_offset` and
    /// `$source_length`.
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            "$id" => Some(self.id.clone()),
            "$type" => Some(self.entry_type.clone()),
            "$source" => self.source.as_ref().map(|s| s.text.clone()),
            "$source_offset" => self.source.as_ref().map(|s| s.offset.to_string()),
            "$source_length" => self.source.as_ref().map(|s| s.length.to_string()),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Returns the author names as "firstname lastname".
    ///
    /// The `author` field is split on `" and "`; a name written as
    /// `"Last, First"` is turned around.
    ///
    /// # Examples
    ///
    /// ```
    /// use bibtex_render::Entry;
    ///
    /// let entry = Entry::new("k", "article").with_field("author", "Knuth, Donald E. and Leslie Lamport");
    /// assert_eq!(entry.authors(), vec!["Donald E. Knuth", "Leslie Lamport"]);
    /// ```
    pub fn authors(&self) -> Vec<String> {
        let Some(author) = self.fields.get("author") else {
            return Vec::new();
        };
        author
            .split(" and ")
            .map(|name| {
                let parts: Vec<&str> = name.split(',').map(str::trim).collect();
                parts
                    .iter()
                    .rev()
                    .copied()
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Restores BibTeX syntax from the fields.
    pub fn to_bib(&self) -> String {
        let mut bib = format!("@{}{{{},\n", self.entry_type, self.id);
        for (key, value) in &self.fields {
            bib.push_str(&format!(" {}={{{}}},\n", key, value));
        }
        bib.push_str("}\n");
        bib
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lowercases_type() {
        let entry = Entry::new("x", "@InProceedings");
        assert_eq!(entry.entry_type, "inproceedings");
    }

    #[test]
    fn test_get_reserved_names() {
        // Given: an entry with a source span
        let mut entry = Entry::new("doe99", "book").with_field("Title", "A Book");
        entry.source = Some(SourceSpan {
            offset: 4,
            length: 10,
            text: "@book{...}".to_string(),
        });

        // Then: reserved names resolve next to ordinary fields
        assert_eq!(entry.get("$id").as_deref(), Some("doe99"));
        assert_eq!(entry.get("$type").as_deref(), Some("book"));
        assert_eq!(entry.get("$source_offset").as_deref(), Some("4"));
        assert_eq!(entry.get("$source_length").as_deref(), Some("10"));
        assert_eq!(entry.get("title").as_deref(), Some("A Book"));
        assert_eq!(entry.get("year"), None);
    }

    #[test]
    fn test_authors_reverses_last_first() {
        let entry = Entry::new("k", "article")
            .with_field("author", "Doe, John and Jane Roe and  Smith , Ann ");

        assert_eq!(entry.authors(), vec!["John Doe", "Jane Roe", "Ann Smith"]);
    }

    #[test]
    fn test_authors_without_author_field() {
        assert!(Entry::new("k", "misc").authors().is_empty());
    }

    #[test]
    fn test_to_bib_skips_reserved_metadata() {
        let mut entry = Entry::new("k", "misc")
            .with_field("title", "On {TeX}")
            .with_field("year", "1984");
        entry.source = Some(SourceSpan {
            offset: 0,
            length: 3,
            text: "@x{".to_string(),
        });

        assert_eq!(
            entry.to_bib(),
            "@misc{k,\n title={On {TeX}},\n year={1984},\n}\n"
        );
    }
}
