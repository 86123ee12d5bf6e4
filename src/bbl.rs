//! Bibliography builds through `latex` and `bibtex`.
//!
//! The store is written out as a `.bib` file next to a minimal LaTeX
//! document that `\nocite{*}`s everything; `latex` and then `bibtex` run in a
//! scratch directory and the resulting `.bbl` is split into one
//! `\bibitem{id}` block per entry.
//!
//! All builds in the process share one lock: the scratch files use a fixed
//! stem and concurrent runs would overwrite each other's artifacts.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{BblState, Store};

/// File stem of every scratch artifact.
pub const STEM: &str = "bibtexdata";

/// Style passed to `\bibliographystyle` unless configured otherwise.
pub const DEFAULT_STYLE: &str = "plain";

static BUILD_LOCK: Mutex<()> = Mutex::new(());

static BIBITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\\bibitem(?:\[[^\]\n]*\])?\{([^}\n]+)\}[ \t]*\n((?:.+\n)+)").unwrap()
});

/// The two external passes of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `latex` over the wrapper document.
    Typeset,
    /// `bibtex` over the `.aux` file.
    Bibliography,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Typeset => f.write_str("latex"),
            Stage::Bibliography => f.write_str("bibtex"),
        }
    }
}

/// Exit status and captured output of one external command.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs the external programs of a build.
pub trait Toolchain: Send + Sync {
    /// Runs `stage` in `workdir` against the files named `stem.*`.
    fn run(&self, stage: Stage, workdir: &Path, stem: &str) -> Result<ToolOutput>;
}

/// [`Toolchain`] calling `latex` and `bibtex` from `PATH`.
#[derive(Debug, Clone)]
pub struct LatexToolchain {
    pub latex: String,
    pub bibtex: String,
    pub timeout: Duration,
}

impl Default for LatexToolchain {
    fn default() -> Self {
        Self {
            latex: "latex".to_string(),
            bibtex: "bibtex".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Toolchain for LatexToolchain {
    fn run(&self, stage: Stage, workdir: &Path, stem: &str) -> Result<ToolOutput> {
        let (program, args) = match stage {
            Stage::Typeset => (
                self.latex.as_str(),
                vec!["-interaction=nonstopmode", "-halt-on-error", stem],
            ),
            Stage::Bibliography => (self.bibtex.as_str(), vec![stem]),
        };
        let failed = |output: String| Error::Build {
            stage: stage.to_string(),
            output,
        };

        let path = which::which(program)
            .map_err(|e| failed(format!("'{}' not available: {}", program, e)))?;
        info!(program = %path.display(), ?args, workdir = %workdir.display(), "executing");

        let mut command = Command::new(&path);
        command.args(&args).current_dir(workdir);
        let output = run_with_timeout(&mut command, self.timeout)
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed(format!("timed out after {}s", self.timeout.as_secs())))?;

        info!(status = ?output.status, "{} finished", stage);
        debug!(stdout = %output.stdout, stderr = %output.stderr, "{} output", stage);
        Ok(output)
    }
}

/// Spawns `command` with piped output and waits at most `timeout`.
///
/// Returns `None` if the process had to be killed.
fn run_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<Option<ToolOutput>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // drain both pipes while waiting so a chatty process cannot block
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(?timeout, "external command timed out, killing it");
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    };

    let collect = |handle: Option<thread::JoinHandle<String>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };

    Ok(Some(ToolOutput {
        status: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    }))
}

fn drain(mut pipe: impl Read + Send + 'static) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Produces the formatted bibliography items of a [`Store`].
pub struct BblBuilder {
    scratch_dir: PathBuf,
    style: String,
    toolchain: Box<dyn Toolchain>,
}

impl fmt::Debug for BblBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BblBuilder")
            .field("scratch_dir", &self.scratch_dir)
            .field("style", &self.style)
            .finish_non_exhaustive()
    }
}

impl BblBuilder {
    /// Creates a builder running `toolchain` in `scratch_dir` with the
    /// `plain` style.
    pub fn new(scratch_dir: impl Into<PathBuf>, toolchain: impl Toolchain + 'static) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            style: DEFAULT_STYLE.to_string(),
            toolchain: Box::new(toolchain),
        }
    }

    /// Sets the BibTeX style, e.g. `alpha` or `abbrv`.
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn style(&self) -> &str {
        &self.style
    }

    /// Runs a full build for `store` and records the result in `state`.
    ///
    /// `state.built_at` is only advanced when every step succeeded.
    pub(crate) fn build(&self, store: &Store, state: &mut BblState) -> Result<()> {
        let _guard = BUILD_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(entries = store.len(), style = %self.style, "building bibliography");

        fs::create_dir_all(&self.scratch_dir)?;
        self.clear()?;

        let root = self.scratch_dir.join(STEM);
        let bib: String = store.iter().map(|entry| entry.to_bib()).collect();
        fs::write(root.with_extension("bib"), bib)?;
        fs::write(root.with_extension("tex"), wrapper_document(&self.style))?;

        for stage in [Stage::Typeset, Stage::Bibliography] {
            let output = self.toolchain.run(stage, &self.scratch_dir, STEM)?;
            if !output.success() {
                warn!(%stage, status = ?output.status, stderr = %output.stderr, "build stage failed");
                return Err(Error::Build {
                    stage: stage.to_string(),
                    output: output.stdout,
                });
            }
        }

        let bbl = fs::read_to_string(root.with_extension("bbl"))?;
        for (id, text) in parse_bbl(&bbl) {
            if store.get(&id).is_some() {
                state.items.insert(id, text);
            } else {
                warn!(%id, "bibtex produced an item for an unknown entry");
            }
        }

        self.clear()?;
        state.built_at = Some(store.mutations());
        info!(items = state.items.len(), "bibliography is up to date");
        Ok(())
    }

    /// Removes every `bibtexdata.*` file from the scratch directory.
    fn clear(&self) -> Result<()> {
        let pattern = format!(
            "{}/{}.*",
            glob::Pattern::escape(&self.scratch_dir.to_string_lossy()),
            STEM
        );
        let paths = glob::glob(&pattern).map_err(|e| Error::Config(e.to_string()))?;
        for path in paths.flatten() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// The LaTeX document citing every entry of [`STEM`]`.bib`.
fn wrapper_document(style: &str) -> String {
    format!(
        "\\documentclass{{article}}\n\
         \\begin{{document}}\n\
         \\nocite{{*}}\n\
         \\bibliographystyle{{{style}}}\n\
         \\bibliography{{{STEM}}}\n\
         \\end{{document}}\n"
    )
}

/// Splits `.bbl` text into `(id, "\bibitem{id}\n<body>")` pairs.
pub fn parse_bbl(bbl: &str) -> Vec<(String, String)> {
    BIBITEM_RE
        .captures_iter(bbl)
        .map(|cap| {
            let id = cap[1].to_string();
            let text = format!("\\bibitem{{{}}}\n{}", id, &cap[2]);
            (id, text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const BBL: &str = "\\begin{thebibliography}{1}

\\bibitem{doe99}
John Doe.
\\newblock {\\em A Title}.
\\newblock Bogus Press, 1999.

\\bibitem[Roe(2001)]{roe01}
Jane Roe.
\\newblock Another.

\\end{thebibliography}
";

    /// Writes a canned `.bbl` and counts how often each stage runs.
    struct FakeToolchain {
        calls: Arc<AtomicUsize>,
        fail_stage: Option<Stage>,
    }

    impl Toolchain for FakeToolchain {
        fn run(&self, stage: Stage, workdir: &Path, stem: &str) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_stage == Some(stage) {
                return Ok(ToolOutput {
                    status: Some(1),
                    stdout: "! LaTeX Error: boom".to_string(),
                    stderr: String::new(),
                });
            }
            if stage == Stage::Bibliography {
                assert!(workdir.join(format!("{stem}.bib")).exists());
                assert!(workdir.join(format!("{stem}.tex")).exists());
                fs::write(workdir.join(format!("{stem}.bbl")), BBL)?;
            }
            Ok(ToolOutput {
                status: Some(0),
                ..Default::default()
            })
        }
    }

    fn store() -> Store {
        let mut store = Store::new();
        store
            .scan("@book{doe99, author={Doe, John}, title={A Title}}\n@misc{roe01, author={Roe, Jane}}")
            .unwrap();
        store
    }

    fn builder(dir: &Path, fail_stage: Option<Stage>) -> (BblBuilder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let toolchain = FakeToolchain {
            calls: Arc::clone(&calls),
            fail_stage,
        };
        (BblBuilder::new(dir, toolchain), calls)
    }

    // ============================================
    // Tests for parse_bbl
    // ============================================

    #[test]
    fn test_parse_bbl_items() {
        let items = parse_bbl(BBL);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "doe99");
        assert_eq!(
            items[0].1,
            "\\bibitem{doe99}\nJohn Doe.\n\\newblock {\\em A Title}.\n\\newblock Bogus Press, 1999.\n"
        );
        // labels from alpha-like styles are dropped
        assert_eq!(items[1].0, "roe01");
        assert!(items[1].1.starts_with("\\bibitem{roe01}\n"));
    }

    #[test]
    fn test_wrapper_document_uses_style() {
        let tex = wrapper_document("alpha");
        assert!(tex.contains("\\bibliographystyle{alpha}"));
        assert!(tex.contains("\\bibliography{bibtexdata}"));
        assert!(tex.contains("\\nocite{*}"));
    }

    // ============================================
    // Tests for freshness
    // ============================================

    #[test]
    fn test_ensure_bbl_runs_toolchain_once() {
        // Given: a fresh scratch directory and a stale store
        let dir = tempfile::tempdir().unwrap();
        let (builder, calls) = builder(dir.path(), None);
        let store = store();
        assert!(!store.is_fresh());

        // When: we ensure the bibliography twice
        store.ensure_bbl(&builder).unwrap();
        store.ensure_bbl(&builder).unwrap();

        // Then: latex and bibtex ran once each
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.is_fresh());
        assert!(store.bbl("doe99").unwrap().contains("Bogus Press"));
    }

    #[test]
    fn test_build_clears_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bibtexdata.log"), "stale").unwrap();
        fs::write(dir.path().join("keep.txt"), "mine").unwrap();
        let (builder, _) = builder(dir.path(), None);

        store().ensure_bbl(&builder).unwrap();

        assert!(!dir.path().join("bibtexdata.log").exists());
        assert!(!dir.path().join("bibtexdata.bbl").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_scan_makes_store_stale_again() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, calls) = builder(dir.path(), None);
        let mut store = store();

        store.ensure_bbl(&builder).unwrap();
        store.scan("@misc{new1, title={New}}").unwrap();
        assert!(!store.is_fresh());

        store.ensure_bbl(&builder).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_query_on_bbl_text() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, _) = builder(dir.path(), None);
        let store = store();
        let query = crate::query::Query::new().field(crate::query::BBL_FIELD, "Bogus Press");

        // before a build there is no text and the test passes vacuously
        assert_eq!(store.query(&query).unwrap().len(), 2);

        store.ensure_bbl(&builder).unwrap();
        let ids: Vec<&str> = store.query(&query).unwrap().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["doe99"]);
    }

    #[test]
    fn test_failed_stage_leaves_store_stale() {
        // Given: a toolchain whose latex pass fails
        let dir = tempfile::tempdir().unwrap();
        let (builder, calls) = builder(dir.path(), Some(Stage::Typeset));
        let store = store();

        // When: we build
        let err = store.ensure_bbl(&builder).unwrap_err();

        // Then: the error carries the stage and stdout, and the next call retries
        match &err {
            Error::Build { stage, output } => {
                assert_eq!(stage, "latex");
                assert!(output.contains("LaTeX Error"));
            }
            other => panic!("Expected build error, got {:?}", other),
        }
        assert!(!store.is_fresh());
        let _ = store.ensure_bbl(&builder);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // ============================================
    // Tests for the external programs
    // ============================================

    /// Writes an executable shell script and returns its path.
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn toolchain(latex: String, bibtex: String, timeout: Duration) -> LatexToolchain {
        LatexToolchain {
            latex,
            bibtex,
            timeout,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_latex_toolchain_builds_from_scripts() {
        // Given: a latex that does nothing and a bibtex writing one item
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let latex = script(bin.path(), "latex", "exit 0");
        let bibtex = script(
            bin.path(),
            "bibtex",
            r#"cat > "$1.bbl" <<'EOF'
\bibitem{doe99}
John Doe.
\newblock A Title.

EOF"#,
        );
        let builder = BblBuilder::new(scratch.path(), toolchain(latex, bibtex, Duration::from_secs(10)));
        let store = store();

        // When: we build
        store.ensure_bbl(&builder).unwrap();

        // Then: the item written in the scratch directory was picked up
        assert!(store.is_fresh());
        assert_eq!(
            store.bbl("doe99").as_deref(),
            Some("\\bibitem{doe99}\nJohn Doe.\n\\newblock A Title.\n")
        );
        assert!(store.bbl("roe01").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_latex_toolchain_captures_failure_output() {
        let bin = tempfile::tempdir().unwrap();
        let latex = script(bin.path(), "latex", "echo '! LaTeX Error: x'\necho oops >&2\nexit 1");
        let toolchain = toolchain(latex, "bibtex".to_string(), Duration::from_secs(10));

        let output = toolchain.run(Stage::Typeset, bin.path(), STEM).unwrap();

        assert_eq!(output.status, Some(1));
        assert!(!output.success());
        assert_eq!(output.stdout, "! LaTeX Error: x\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_latex_script_is_build_error() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let latex = script(bin.path(), "latex", "echo '! LaTeX Error: x'\nexit 1");
        let builder = BblBuilder::new(
            scratch.path(),
            toolchain(latex, "bibtex".to_string(), Duration::from_secs(10)),
        );
        let store = store();

        match store.ensure_bbl(&builder) {
            Err(Error::Build { stage, output }) => {
                assert_eq!(stage, "latex");
                assert!(output.contains("! LaTeX Error: x"), "{}", output);
            }
            other => panic!("Expected build error, got {:?}", other),
        }
        assert!(!store.is_fresh());
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_stage_is_killed() {
        // Given: a latex that outlives the timeout
        let bin = tempfile::tempdir().unwrap();
        let latex = script(bin.path(), "latex", "exec sleep 5");
        let toolchain = toolchain(latex, "bibtex".to_string(), Duration::from_secs(1));

        // When: it runs
        let started = Instant::now();
        let result = toolchain.run(Stage::Typeset, bin.path(), STEM);

        // Then: it is reported as a failed stage well before it would finish
        match result {
            Err(Error::Build { stage, output }) => {
                assert_eq!(stage, "latex");
                assert_eq!(output, "timed out after 1s");
            }
            other => panic!("Expected build error, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_program_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = LatexToolchain {
            bibtex: dir.path().join("no-such-bibtex").to_string_lossy().into_owned(),
            ..LatexToolchain::default()
        };

        match toolchain.run(Stage::Bibliography, dir.path(), STEM) {
            Err(Error::Build { stage, output }) => {
                assert_eq!(stage, "bibtex");
                assert!(output.contains("not available"), "{}", output);
            }
            other => panic!("Expected build error, got {:?}", other),
        }
    }
}
