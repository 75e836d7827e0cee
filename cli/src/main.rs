mod data;
mod logging;
mod test_runner;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use codespan_reporting::diagnostic::{Diagnostic, Label, Severity};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};

use renderer::{
    CacheStore, DiagnosticError, FileStore, LoadError, MemoryStore, RenderStats, Renderer, TemplateRegistry,
};

#[derive(Parser)]
#[command(name = "sst", version, about = "Template renderer with partial caching")]
struct Cli {
    /// Disable colored error output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log filter used when RUST_LOG is not set (e.g. "debug", "renderer=debug")
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a template
    Render(RenderArgs),

    /// Run .test.ss fixture files
    Test(TestArgs),
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Template file to render
    file: PathBuf,

    /// TOML file with the render data
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// TOML render configuration (defaults to ./sstemplate.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep cached regions in this directory instead of in memory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Drop compiled templates and clear the cache store before rendering
    #[arg(long)]
    flush: bool,

    /// Compile only, don't render (exit 0 if valid)
    #[arg(long)]
    check: bool,

    /// Print the flattened region sequence
    #[arg(long)]
    regions: bool,

    /// Dump the parsed node tree
    #[arg(long)]
    ast: bool,

    /// Print cache and evaluation counters to stderr after each pass
    #[arg(long)]
    stats: bool,

    /// Render this many times against the same store
    #[arg(long, default_value_t = 1)]
    passes: usize,
}

#[derive(clap::Args)]
struct TestArgs {
    /// Path to a .test.ss file or directory containing them
    path: PathBuf,

    /// Run only tests in these categories (subfolder names). Repeatable.
    #[arg(short, long)]
    category: Vec<String>,

    /// List available categories and exit
    #[arg(long)]
    list_categories: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    match cli.command {
        Command::Render(args) => do_render(args, cli.no_color),
        Command::Test(args) => {
            if args.list_categories {
                test_runner::list_categories(&args.path);
                return;
            }
            let exit_code = test_runner::run_tests(&args.path, cli.no_color, &args.category);
            process::exit(exit_code);
        }
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

fn do_render(args: RenderArgs, no_color: bool) {
    let color_choice = if no_color {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    };
    let writer = StandardStream::stderr(color_choice);
    let term_config = term::Config::default();

    let config = data::load_config(args.config.as_deref()).unwrap_or_else(|e| fail(e));
    let root = match &args.data {
        Some(path) => data::load_data(path).unwrap_or_else(|e| fail(e)),
        None => toml::Table::new(),
    };

    let store: Arc<dyn CacheStore> = match &args.cache_dir {
        Some(dir) => Arc::new(FileStore::open(dir).unwrap_or_else(|e| fail(e))),
        None => Arc::new(MemoryStore::new()),
    };

    let base_dir = args
        .file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_else(|| fail(format!("invalid template path '{}'", args.file.display())));
    let registry = TemplateRegistry::new(base_dir);

    if args.flush {
        if let Err(e) = registry.flush(store.as_ref()) {
            fail(e);
        }
    }

    let mut files = SimpleFiles::new();
    let template = match registry.get(name) {
        Ok(template) => template,
        Err(LoadError::Compile {
            source_text, errors, ..
        }) => {
            files.add(args.file.display().to_string(), source_text);
            for error in &errors {
                let diagnostic = error.to_diagnostic();
                let _ = term::emit_to_write_style(&mut writer.lock(), &term_config, &files, &diagnostic);
            }
            process::exit(1);
        }
        Err(e) => fail(e),
    };
    let source = std::fs::read_to_string(registry.resolve(name)).unwrap_or_default();
    files.add(args.file.display().to_string(), source);

    if args.check {
        eprintln!(
            "ok: {} compiled to {} region(s)",
            args.file.display(),
            template.regions.len()
        );
        return;
    }

    if args.ast {
        println!("{:#?}", template.nodes);
        return;
    }

    if args.regions {
        for (i, region) in template.regions.iter().enumerate() {
            println!("{:>3}  {}", i, region);
        }
        return;
    }

    let renderer = Renderer::new(config, store).unwrap_or_else(|e| fail(e));
    let data = data::table_to_runtime(&root);

    for pass in 1..=args.passes.max(1) {
        match renderer.render(&template, data.clone()) {
            Ok(output) => {
                emit_diagnostics(&writer, &term_config, &files, &output.warnings);
                print!("{}", output.text);
                if args.stats {
                    print_stats(pass, &output.stats);
                }
            }
            Err(error) => {
                emit_diagnostic_error(&writer, &term_config, &files, &error);
                process::exit(1);
            }
        }
    }
}

fn print_stats(pass: usize, stats: &RenderStats) {
    eprintln!(
        "pass {}: {} hit(s), {} miss(es), {} skipped, {} get(s), {} set(s), {} store failure(s)",
        pass,
        stats.cache_hits,
        stats.cache_misses,
        stats.skipped_regions,
        stats.store_gets,
        stats.store_sets,
        stats.store_failures
    );
    eprintln!(
        "        {} evaluation(s), {} memo hit(s)",
        stats.evaluations, stats.memo_hits
    );
    for (expr, count) in &stats.evaluated {
        eprintln!("          {:>3}  {}", count, expr);
    }
}

fn emit_diagnostic_error(
    writer: &StandardStream,
    config: &term::Config,
    files: &SimpleFiles<String, String>,
    error: &DiagnosticError,
) {
    if let Some(span) = &error.span {
        let severity = if error.is_warning {
            Severity::Warning
        } else {
            Severity::Error
        };
        let diagnostic = Diagnostic::new(severity)
            .with_message(error.to_string())
            .with_labels(vec![Label::primary(error.source_id, span.clone())]);
        let _ = term::emit_to_write_style(&mut writer.lock(), config, files, &diagnostic);
    } else {
        let prefix = if error.is_warning {
            "warning"
        } else {
            "render error"
        };
        eprintln!("{}: {}", prefix, error);
    }
}

fn emit_diagnostics(
    writer: &StandardStream,
    config: &term::Config,
    files: &SimpleFiles<String, String>,
    diagnostics: &[DiagnosticError],
) {
    for diag in diagnostics {
        emit_diagnostic_error(writer, config, files, diag);
    }
}
