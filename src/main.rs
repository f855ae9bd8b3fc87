use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{config::Config as EditorConfig, Editor, Helper};
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

mod lang;
mod packages;
mod repl;

use lang::eval::Eval;
use lang::parse::BlockMode;
use lang::runtime::{EvalResult, Runtime};
use packages::PackageManager;
use repl::ReplHelper;

const HISTORY_FILE: &str = ".dox_history";
const PROMPT: &str = "dox> ";

#[derive(Clone, Copy, ValueEnum)]
enum Blocks {
    /// Every line is its own statement, `end` is a no-op
    Flat,
    /// `end` closes the nearest open block
    Nested,
}

impl From<Blocks> for BlockMode {
    fn from(blocks: Blocks) -> Self {
        match blocks {
            Blocks::Flat => BlockMode::Flat,
            Blocks::Nested => BlockMode::Nested,
        }
    }
}

#[derive(Parser)]
#[command(version, about)]
struct Opt {
    /// Script to run. Starts the REPL when omitted
    file: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long)]
    debug: bool,

    /// How block openers (`if`, `loop`, `function`, `class`) and `end` are read
    #[arg(long, value_enum, default_value_t = Blocks::Flat)]
    blocks: Blocks,

    /// Where imported packages are installed [default: ./dox_packages]
    #[arg(long)]
    packages_dir: Option<PathBuf>,

    /// Simulated download time per package
    #[arg(long, default_value_t = 500)]
    install_delay_ms: u64,
}

fn init_logging(debug: bool) -> Result<()> {
    let filter = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Error
    };

    match SimpleLogger::init(filter, LogConfig::default()) {
        Ok(_) => Ok(()),
        Err(e) => bail!("Failed to init logger: {}", e),
    }
}

fn init_packages(opts: &Opt) -> Result<PackageManager> {
    let dir = match &opts.packages_dir {
        Some(dir) => dir.clone(),
        None => PackageManager::default_dir()?,
    };
    let packages = PackageManager::new(dir, Duration::from_millis(opts.install_delay_ms))?;
    info!("Using package directory {}", packages.dir().display());

    Ok(packages)
}

fn init_editor(mode: BlockMode) -> Result<Editor<ReplHelper, DefaultHistory>> {
    let config = EditorConfig::builder().auto_add_history(true).build();
    let mut editor = Editor::with_config(config)?;
    editor.set_helper(Some(ReplHelper::new(mode)));

    Ok(editor)
}

fn init_history<H: Helper>(editor: &mut Editor<H, DefaultHistory>) {
    let _ = editor.load_history(HISTORY_FILE);
}

fn save_history<H: Helper>(editor: &mut Editor<H, DefaultHistory>) -> Result<()> {
    match editor.save_history(HISTORY_FILE) {
        Ok(_) => Ok(()),
        Err(e) => bail!("Failed to save history: {}", e),
    }
}

fn welcome(mode: BlockMode) {
    println!("DoxRain v{}", env!("CARGO_PKG_VERSION"));
    if mode == BlockMode::Nested {
        println!("Blocks are nested: close every `if`, `loop`, `function` and `class` with `end`");
    }
    println!("Type 'help' for help");
    println!();
}

fn log_session(eval: &Eval) {
    let modules: Vec<&str> = eval.modules().iter().map(String::as_str).collect();
    info!("Imported modules: [{}]", modules.join(", "));
    if let Some(port) = eval.web_server() {
        info!("Web server on port {} stops with the interpreter", port);
    }
    debug!("Last input: {:?}", eval.last_input());
}

fn run_file(runtime: &mut Runtime, path: &Path) -> Result<()> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut failures = 0;
    let parsed = runtime.run_source(&source, |f| {
        failures += 1;
        eprintln!("{}", f);
    });
    info!(
        "Ran {} statements from {}, {} failed",
        parsed,
        path.display(),
        failures
    );
    log_session(runtime.env());

    Ok(())
}

fn run_repl(runtime: &mut Runtime) -> Result<()> {
    let mut editor = init_editor(runtime.mode())?;
    if let Some(helper) = editor.helper_mut() {
        helper.refresh(runtime.env());
    }
    init_history(&mut editor);
    welcome(runtime.mode());

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                info!("read: {}", &line);

                match runtime.eval(&line) {
                    EvalResult::Ok => {
                        if let Some(helper) = editor.helper_mut() {
                            helper.refresh(runtime.env());
                        }
                    }
                    EvalResult::Quit => break,
                    EvalResult::Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                eprintln!("Press Ctrl-D or type 'quit' to quit");
            }
            Err(ReadlineError::Eof) => {
                println!("quit");
                break;
            }
            Err(e) => {
                error!("Unexpected error: {}", e);
                println!("quit");
                break;
            }
        }
    }

    save_history(&mut editor)?;
    log_session(runtime.env());

    Ok(())
}

fn main() -> Result<()> {
    let opts = Opt::parse();
    init_logging(opts.debug)?;

    let packages = init_packages(&opts)?;
    let mut sink = io::stdout();
    let mut input = io::stdin().lock();
    let eval = Eval::new(&mut sink, &mut input, Box::new(packages));
    let mut runtime = Runtime::new(eval, opts.blocks.into());

    match &opts.file {
        Some(path) => run_file(&mut runtime, path),
        None => run_repl(&mut runtime),
    }
}
