//! Shared test constants and helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bibtex_render::{
    parse_str, BblBuilder, DirectiveSet, Engine, Result, Stage, Store, TemplateSet, ToolOutput,
    Toolchain,
};

/// Four entries across two decades, one without author.
pub const SAMPLE_BIB: &str = r#"
% sample library
@book{knuth84,
  author    = {Knuth, Donald E.},
  title     = {The {\TeX}book},
  publisher = {Addison-Wesley},
  year      = 1984
}

@article{lamport94,
  author  = "Leslie Lamport",
  title   = "{\LaTeX}: A Document Preparation System",
  journal = {Software},
  year    = {1994},
}

@inproceedings{goedel95,
  author    = {G{\"o}del, Kurt and Turing, Alan},
  title     = {On Formally Undecidable Things},
  booktitle = {Proc. Logic},
  year      = {1995}
}

@misc{anon99,
  title = {Notes},
  year  = {1999}
}
"#;

/// Stands in for `latex` + `bibtex`: reads the generated `.bib` back and
/// writes one `\bibitem` per entry with author, title and year blocks.
pub struct FakeBibtex {
    pub runs: Arc<AtomicUsize>,
}

impl FakeBibtex {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                runs: Arc::clone(&runs),
            },
            runs,
        )
    }
}

impl Toolchain for FakeBibtex {
    fn run(&self, stage: Stage, workdir: &Path, stem: &str) -> Result<ToolOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if stage == Stage::Bibliography {
            let bib = fs::read_to_string(workdir.join(format!("{stem}.bib")))?;
            let mut bbl = String::from("\\begin{thebibliography}{9}\n\n");
            for entry in parse_str(&bib)? {
                bbl.push_str(&format!(
                    "\\bibitem{{{}}}\n{}.\n\\newblock {{\\em {}}}.\n\\newblock {}.\n\n",
                    entry.id,
                    entry.authors().join(" and "),
                    entry.get("title").unwrap_or_default(),
                    entry.get("year").unwrap_or_default(),
                ));
            }
            bbl.push_str("\\end{thebibliography}\n");
            fs::write(workdir.join(format!("{stem}.bbl")), bbl)?;
        }
        Ok(ToolOutput {
            status: Some(0),
            ..Default::default()
        })
    }
}

/// An engine over `bib` with the given templates and a [`FakeBibtex`].
pub fn engine(
    bib: &str,
    templates: &[(&str, &str)],
) -> (Engine, Arc<AtomicUsize>, tempfile::TempDir) {
    let mut store = Store::new();
    store.scan(bib).unwrap();

    let mut set = TemplateSet::new();
    for (name, text) in templates {
        set.insert(name, text).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let (toolchain, runs) = FakeBibtex::new();
    let engine = Engine::new(
        store,
        set,
        BblBuilder::new(dir.path(), toolchain),
        DirectiveSet::default(),
    );
    (engine, runs, dir)
}

/// Writes `text` to `path` readable by the owner only.
pub fn write_private(path: &Path, text: &str) {
    fs::write(path, text).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }
}
