//! tarn - interactive host for the Tarn engine
//!
//! Three ways in:
//! - `tarn` starts the line-edited REPL;
//! - `tarn script.tarn` runs a file and exits with the script's status;
//! - `tarn --eval "1 + 2"` evaluates one string.
//!
//! Ctrl-C raises the engine's escape signal: a long-running evaluation is
//! halted at its next signal checkpoint instead of killing the process.

use anyhow::Context;
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::process::ExitCode;
use tarn_core::{Config, Engine, Kind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tarn", version, about = "The Tarn language")]
struct Cli {
    /// Script file to run instead of starting the REPL
    script: Option<PathBuf>,

    /// Evaluate one expression and print its value
    #[arg(long, short = 'e', value_name = "CODE", conflicts_with = "script")]
    eval: Option<String>,

    /// Suppress result echoing in the REPL
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Evaluation cycle limit (halts runaway scripts)
    #[arg(long, value_name = "CYCLES")]
    cycle_limit: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::new();
    if let Some(limit) = cli.cycle_limit {
        config = config.with_cycle_limit(limit);
    }
    let mut engine = Engine::new(config);
    install_interrupt(&engine);

    let status = if let Some(code) = cli.eval {
        run_source(&mut engine, &code, !cli.quiet)
    } else if let Some(path) = cli.script.clone() {
        match std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))
        {
            Ok(source) => run_source(&mut engine, &source, false),
            Err(err) => {
                eprintln!("{err:#}");
                1
            }
        }
    } else {
        repl(&mut engine, cli.quiet)
    };
    engine.shutdown();
    ExitCode::from(status.clamp(0, 255) as u8)
}

/// Route SIGINT to the engine's escape bit. The handler only flips an
/// atomic, which is all a signal context is allowed to do.
fn install_interrupt(engine: &Engine) {
    #[cfg(unix)]
    {
        let signals = engine.signal_handle();
        let result = unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                signals.raise(tarn_core::SIG_ESCAPE);
            })
        };
        if let Err(err) = result {
            tracing::warn!(%err, "could not install SIGINT handler");
        }
    }
    #[cfg(not(unix))]
    let _ = engine;
}

/// Evaluate one source unit, printing results or the error report.
/// Returns the process exit status.
fn run_source(engine: &mut Engine, source: &str, echo: bool) -> i32 {
    match engine.eval_str(source) {
        Ok(value) => {
            if let Some(quit) = engine.take_quit() {
                return engine.exit_status(&quit);
            }
            if echo && value.kind() != Kind::Unset {
                println!("== {}", engine.mold_value(&value));
            }
            0
        }
        Err(err) => {
            eprintln!("{}", engine.form_error(&err));
            1
        }
    }
}

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".tarn-history"))
}

fn repl(engine: &mut Engine, quiet: bool) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot start line editor: {err}");
            return 1;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    println!("Tarn {} - quit to exit", env!("CARGO_PKG_VERSION"));
    let status = loop {
        match editor.readline(">> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match engine.eval_str(line) {
                    Ok(value) => {
                        if let Some(quit) = engine.take_quit() {
                            break engine.exit_status(&quit);
                        }
                        if !quiet && value.kind() != Kind::Unset {
                            println!("== {}", engine.mold_value(&value));
                        }
                    }
                    Err(err) => eprintln!("{}", engine.form_error(&err)),
                }
            }
            // Ctrl-C at the prompt just clears the line.
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break 0,
            Err(err) => {
                eprintln!("input error: {err}");
                break 1;
            }
        }
    };
    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(Config::default())
    }

    #[test]
    fn test_run_source_success_status() {
        let mut e = engine();
        assert_eq!(run_source(&mut e, "1 + 2", false), 0);
    }

    #[test]
    fn test_run_source_error_status() {
        let mut e = engine();
        assert_eq!(run_source(&mut e, "1 +", false), 1);
        assert_eq!(run_source(&mut e, "undefined-word-zzz", false), 1);
    }

    #[test]
    fn test_quit_maps_to_exit_status() {
        let mut e = engine();
        assert_eq!(run_source(&mut e, "quit/return 3", false), 3);
        let mut e = engine();
        assert_eq!(run_source(&mut e, "quit", false), 0);
    }

    #[test]
    fn test_script_file_runs() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "x: 40  quit/return x + 2").expect("write");
        let source = std::fs::read_to_string(file.path()).expect("read");
        let mut e = engine();
        assert_eq!(run_source(&mut e, &source, false), 42);
    }
}
