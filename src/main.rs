//! CLI for bibtex-render - Render BibTeX entries into text with inline directives.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bibtex_render::{config::CONFIG_FILE, Config, Engine, Entry, Error};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Render BibTeX entries into text with inline directives
#[derive(Parser)]
#[command(name = "bibtex-render")]
#[command(version)]
#[command(after_help = "\
Examples:
  bibtex-render render page.txt --bib refs.bib --templates templates/
  bibtex-render --config site/bibtex-render.toml render page.txt -o page.html
  echo '!cite{knuth84} !putbib{}' | bibtex-render render - -b refs.bib -t templates/
  bibtex-render query 'year=>/^199/' -b refs.bib

Logging goes to stderr and is controlled by RUST_LOG (default: bibtex_render=info).")]
struct Cli {
    /// Configuration file (default: ./bibtex-render.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Additional BibTeX source (glob pattern, repeatable)
    #[arg(short, long = "bib", global = true)]
    bib: Vec<String>,

    /// Template directory, overrides the configuration
    #[arg(short, long, global = true)]
    templates: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace directives in a text file
    #[command(after_help = "\
Directives: !bibitem{ids}, !shortbibitem{ids}, !bibtex{ids}, !bibliography{query},
            !cite{ids}, !putbib{}
Arguments may name a template and use a query: !bibitem{short#year=>/^199/}")]
    Render {
        /// Input file (use '-' for stdin)
        input: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Context id citations are collected under
        #[arg(long, default_value = "cli")]
        context: String,
    },

    /// List every entry with the 'list' template
    Entries,

    /// List every author with the 'authors' template
    Authors,

    /// List the templates with their descriptions
    Templates,

    /// Print the entries matching a query expression
    Query {
        /// Expression such as "year=>/^199/, 'author'=>/Knuth/"
        expr: String,

        #[arg(short, long, value_enum, default_value_t = Format::Bib)]
        format: Format,
    },

    /// Print one entry
    Show {
        id: String,

        #[arg(short, long, value_enum, default_value_t = Format::Bib)]
        format: Format,
    },

    /// Load everything and report problems
    Check {
        /// Also run latex and bibtex
        #[arg(long)]
        build: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Bib,
    Json,
}

// ---------------------------------------------------------------------------
// AppError: semantic exit codes
// ---------------------------------------------------------------------------

enum AppError {
    /// Exit 10: input file not found / unreadable
    InputFile(String),
    /// Exit 11: configuration or BibTeX sources invalid
    Config(String),
    /// Exit 12: template missing or failing
    Template(String),
    /// Exit 13: entry id not found
    UnknownEntry(String),
    /// Exit 14: latex / bibtex failed
    Build(String),
    /// Exit 15: cannot write output
    OutputFile(String),
    /// Exit 16: invalid query expression
    Query(String),
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::InputFile(_) => 10,
            AppError::Config(_) => 11,
            AppError::Template(_) => 12,
            AppError::UnknownEntry(_) => 13,
            AppError::Build(_) => 14,
            AppError::OutputFile(_) => 15,
            AppError::Query(_) => 16,
        }
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let msg = e.to_string();
        match e {
            Error::UnknownEntry(_) => AppError::UnknownEntry(msg),
            Error::MissingTemplate(_) | Error::Template(_) => AppError::Template(msg),
            Error::Build { .. } => AppError::Build(msg),
            Error::Query(_) | Error::OperationDisabled(_) => AppError::Query(msg),
            Error::Syntax { .. }
            | Error::Permission(_)
            | Error::Io(_)
            | Error::Config(_) => AppError::Config(msg),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InputFile(msg) => {
                write!(f, "{}\n  hint: verify the file path is correct", msg)
            }
            AppError::Config(msg) => {
                write!(
                    f,
                    "{}\n  hint: configuration and template files must not be group-writable or readable by others",
                    msg
                )
            }
            AppError::Template(msg) => {
                write!(
                    f,
                    "{}\n  hint: templates are the *.tera files of the template directory (see 'templates' command)",
                    msg
                )
            }
            AppError::UnknownEntry(msg) => {
                write!(f, "{}\n  hint: check that this id exists in your BibTeX sources", msg)
            }
            AppError::Build(msg) => {
                write!(
                    f,
                    "{}\n  hint: check that latex and bibtex are installed and the style exists",
                    msg
                )
            }
            AppError::OutputFile(msg) => {
                write!(
                    f,
                    "{}\n  hint: check that the output directory exists and is writable",
                    msg
                )
            }
            AppError::Query(msg) => {
                write!(f, "{}\n  hint: queries look like key=>/regex/, 'key2'=>/regex/", msg)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bibtex_render=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let engine = Engine::load(&config)?;

    match cli.command {
        Commands::Render {
            input,
            output,
            context,
        } => render_command(&engine, &input, output.as_deref(), &context)?,
        Commands::Entries => write_stdout(&engine.list_entries()?)?,
        Commands::Authors => write_stdout(&engine.list_authors()?)?,
        Commands::Templates => write_stdout(&engine.list_templates())?,
        Commands::Query { expr, format } => {
            let entries = engine.query_expr(&expr)?;
            write_stdout(&format_entries(&entries, format)?)?;
        }
        Commands::Show { id, format } => {
            let entry = engine.entry(&id)?;
            write_stdout(&format_entries(&[entry], format)?)?;
        }
        Commands::Check { build } => check_command(&engine, build)?,
    }

    Ok(())
}

/// Reads the configuration and applies the command line overrides.
fn load_config(cli: &Cli) -> Result<Config, AppError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .map_err(|e| AppError::Config(format!("'{}': {}", path.display(), e)))?,
        None if Path::new(CONFIG_FILE).exists() => Config::load(Path::new(CONFIG_FILE))
            .map_err(|e| AppError::Config(format!("'{}': {}", CONFIG_FILE, e)))?,
        None => Config::default(),
    };
    config.sources.extend(cli.bib.iter().cloned());
    if let Some(dir) = &cli.templates {
        config.templates = Some(dir.clone());
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Replace directives in a text file.
fn render_command(engine: &Engine, input: &Path, output: Option<&Path>, context: &str) -> Result<(), AppError> {
    let text = if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| AppError::InputFile(format!("failed to read from stdin: {}", e)))?;
        buf
    } else {
        fs::read_to_string(input)
            .map_err(|e| AppError::InputFile(format!("'{}': {}", input.display(), e)))?
    };

    let result = engine.process(&text, context);
    // citations without a putbib are not kept across runs
    engine.collector().clear(context);

    if let Some(output_path) = output {
        fs::write(output_path, &result)
            .map_err(|e| AppError::OutputFile(format!("'{}': {}", output_path.display(), e)))?;
        eprintln!("wrote {}", output_path.display());
        Ok(())
    } else {
        write_stdout(&result)
    }
}

/// Load everything and report problems.
fn check_command(engine: &Engine, build: bool) -> Result<(), AppError> {
    let store = engine.snapshot();
    eprintln!(
        "{} entries, {} templates",
        store.len(),
        engine.templates().len()
    );

    let errors = engine.load_errors();
    for error in &errors {
        eprintln!("  {}", error);
    }
    if !errors.is_empty() {
        return Err(AppError::Config(format!("{} problem(s) while loading", errors.len())));
    }

    if build {
        store.ensure_bbl(engine.builder())?;
        eprintln!("bibliography built in {}", engine.builder().scratch_dir().display());
    }
    Ok(())
}

fn format_entries(entries: &[Entry], format: Format) -> Result<String, AppError> {
    match format {
        Format::Bib => Ok(entries.iter().map(Entry::to_bib).collect::<Vec<_>>().join("\n")),
        Format::Json => serde_json::to_string_pretty(entries)
            .map(|json| json + "\n")
            .map_err(|e| AppError::OutputFile(format!("failed to serialize entries: {}", e))),
    }
}

fn write_stdout(text: &str) -> Result<(), AppError> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write!(handle, "{}", text).map_err(|e| AppError::OutputFile(format!("stdout: {}", e)))
}
