//! Options for the compiler and the command-line tools.

use clap::{Args, ValueEnum};

/// Implement [`Display`](std::fmt::Display) with the information in
/// [`clap::ValueEnum`].
///
/// This ensures consistent names for parsing of the default argument.
macro_rules! clap_display {
    ($t:ty) => {
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                use clap::ValueEnum as _;
                let value = self.to_possible_value().expect("skipped variant");
                write!(f, "{}", value.get_name())
            }
        }
    };
}

/// The trace level / verbosity for the logging framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TraceLevel {
    /// Turn logging off.
    Off,
    /// Only print errors.
    #[default]
    Error,
    /// Print errors and warnings.
    Warn,
    /// Print errors, warnings and useful information.
    Info,
    /// Print errors, warnings, useful and debug information.
    Debug,
    /// Print all information, including very verbose output.
    Trace,
}

clap_display!(TraceLevel);

impl From<TraceLevel> for log::LevelFilter {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Off => Self::Off,
            TraceLevel::Error => Self::Error,
            TraceLevel::Warn => Self::Warn,
            TraceLevel::Info => Self::Info,
            TraceLevel::Debug => Self::Debug,
            TraceLevel::Trace => Self::Trace,
        }
    }
}

/// Options controlling image generation.
///
/// Usable directly as a library configuration through [`Default`], and
/// flattened into the argument structure of the compiler tool.
///
/// # Examples
///
/// ```
/// use ironautomata::options::CompileOptions;
/// let options = CompileOptions {
///     align_to: 8,
///     ..CompileOptions::default()
/// };
/// ```
#[derive(Debug, Clone, Args)]
pub struct CompileOptions {
    /// Width in bytes of every internal id (1, 2, 4 or 8); 0 selects the
    /// smallest width whose offsets do not overflow.
    #[arg(
        long = "id-width",
        value_name = "BYTES",
        default_value_t = 0,
        help = "Id width in bytes (1, 2, 4, 8), or 0 to minimize"
    )]
    pub id_width: u8,
    /// Byte alignment of node objects; padding between nodes is filled
    /// with 0xAA.
    #[arg(
        long = "align-to",
        value_name = "BYTES",
        default_value_t = 1,
        help = "Align nodes to this byte boundary"
    )]
    pub align_to: usize,
    /// Bias toward the low-degree representation: a high-degree node is
    /// chosen only if its cost times this weight does not exceed the
    /// low-degree cost.
    #[arg(
        long = "high-node-weight",
        value_name = "WEIGHT",
        default_value_t = 1.0,
        help = "Weight against choosing high-degree nodes (at least 1.0)"
    )]
    pub high_node_weight: f64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            id_width: 0,
            align_to: 1,
            high_node_weight: 1.0,
        }
    }
}
