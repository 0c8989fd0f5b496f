//! Compiler tool: reads an intermediate automaton stream and writes a
//! Eudoxus image.

use std::error::Error;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fs_err as fs;
use log::info;

use ironautomata::envelope;
use ironautomata::eudoxus;
use ironautomata::options::{CompileOptions, TraceLevel};

#[derive(Debug, Parser)]
#[command(
    name = "ia-compile",
    version,
    about = "Compile an intermediate automaton stream into a Eudoxus image"
)]
struct CliOptions {
    /// Read the intermediate stream from the given file instead of stdin.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: Option<PathBuf>,
    /// Write the image to the given file instead of stdout.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,
    #[command(flatten)]
    compile: CompileOptions,
    /// The trace level to use for instantiating the logging framework.
    #[arg(
        short = 't',
        long = "trace",
        value_name = "LEVEL",
        value_enum,
        default_value_t
    )]
    trace_level: TraceLevel,
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
    if let Err(error) = compile_main(&options) {
        // discard result as we cannot further propagate a write error
        let _ = writeln!(io::stderr(), "Error: {}", error);
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

/// Initialize the logging framework with the given trace level.
///
/// # Errors
///
/// Returns an error if the logging framework has already been initialized.
fn initialize_logging(level: TraceLevel) -> io::Result<()> {
    env_logger::builder()
        .filter(None, level.into())
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))
}

/// Main function that reads the intermediate stream, compiles it and writes
/// the resulting image.
///
/// # Errors
///
/// Returns an error on I/O failure, on a malformed intermediate stream, and
/// on a failed compilation.
fn compile_main(options: &CliOptions) -> Result<(), Box<dyn Error>> {
    initialize_logging(options.trace_level)?;

    let stream = if let Some(input) = &options.input {
        fs::read(input)?
    } else {
        let mut stream = Vec::new();
        io::stdin().lock().read_to_end(&mut stream)?;
        stream
    };
    let read = envelope::read_automaton(&mut stream.as_slice())?;
    if !read.clean {
        info!("Intermediate stream read with warnings");
    }

    let result = eudoxus::compile(&read.automaton, &options.compile)?;
    info!(
        "Image: {} bytes at id width {} ({})",
        result.image.len(),
        result.id_width.bytes(),
        result.stats
    );

    if let Some(output) = &options.output {
        fs::write(output, &result.image)?;
    } else {
        io::stdout().lock().write_all(&result.image)?;
    }
    Ok(())
}
