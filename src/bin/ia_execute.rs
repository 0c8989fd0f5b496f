//! Executor tool: streams inputs against a Eudoxus image and prints the
//! outputs it fires.

use std::error::Error;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fs_err as fs;

use ironautomata::eudoxus::{Command, Engine, EngineError};
use ironautomata::options::TraceLevel;

#[derive(Debug, Parser)]
#[command(
    name = "ia-execute",
    version,
    about = "Execute a Eudoxus image against a list of inputs"
)]
struct CliOptions {
    /// The Eudoxus image to execute.
    #[arg(short = 'a', long = "automaton", value_name = "FILE")]
    automaton: PathBuf,
    /// Print the image metadata before executing.
    #[arg(short = 'm', long = "metadata")]
    show_metadata: bool,
    /// The trace level to use for instantiating the logging framework.
    #[arg(
        short = 't',
        long = "trace",
        value_name = "LEVEL",
        value_enum,
        default_value_t
    )]
    trace_level: TraceLevel,
    /// Inputs to stream: a literal string, `@FILE` for a file's bytes, or
    /// `-` for stdin.
    #[arg(value_name = "INPUT")]
    inputs: Vec<String>,
}

fn main() -> ExitCode {
    let options = match CliOptions::try_parse() {
        Ok(options) => options,
        Err(error) => {
            if error.use_stderr() {
                let _ = write!(io::stderr(), "{}", error);
                return ExitCode::from(1);
            }
            let _ = write!(io::stdout(), "{}", error);
            return ExitCode::SUCCESS;
        }
    };
    if let Err(error) = execute_main(&options) {
        // discard result as we cannot further propagate a write error
        let _ = writeln!(io::stderr(), "Error: {}", error);
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

fn initialize_logging(level: TraceLevel) -> io::Result<()> {
    env_logger::builder()
        .filter(None, level.into())
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))
}

/// Renders content with non-printable bytes hex-escaped.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut escaped = String::with_capacity(bytes.len());
    for &byte in bytes {
        if (0x20..0x7f).contains(&byte) && byte != b'\\' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("\\x{:02x}", byte));
        }
    }
    escaped
}

fn input_bytes(spec: &str) -> io::Result<Vec<u8>> {
    if spec == "-" {
        let mut bytes = Vec::new();
        io::stdin().lock().read_to_end(&mut bytes)?;
        Ok(bytes)
    } else if let Some(path) = spec.strip_prefix('@') {
        fs::read(path)
    } else {
        Ok(spec.as_bytes().to_vec())
    }
}

/// Main function that loads the image and streams each input against it,
/// printing one `location: content` line per fired output and a status line
/// per input.
///
/// # Errors
///
/// Returns an error on I/O failure and on a malformed image.
fn execute_main(options: &CliOptions) -> Result<(), Box<dyn Error>> {
    initialize_logging(options.trace_level)?;

    let image = fs::read(&options.automaton)?;
    let engine = Engine::load(image)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if options.show_metadata {
        for (key, value) in engine.metadata()? {
            writeln!(out, "{}: {}", escape_bytes(key), escape_bytes(value))?;
        }
    }

    for spec in &options.inputs {
        let bytes = input_bytes(spec)?;
        writeln!(out, "-- input {}", escape_bytes(spec.as_bytes()))?;
        let mut write_error = None;
        let result = {
            let mut state = engine.create_state(|content, location| {
                match writeln!(out, "{}: {}", location, escape_bytes(content)) {
                    Ok(()) => Command::Continue,
                    Err(error) => {
                        write_error = Some(error);
                        Command::Error
                    }
                }
            })?;
            state.execute(Some(&bytes))
        };
        match result {
            Ok(status) => writeln!(out, "-- status {}", status)?,
            Err(EngineError::Callback) if write_error.is_some() => {
                return Err(write_error.unwrap().into());
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}
