//! IronAutomata library crate for building, optimizing, compiling and
//! executing finite-state automata over byte streams.
//!
//! The toolchain is layered: the [`intermediate`] module holds the mutable
//! graph model produced by generators, the [`optimize`] module rewrites it
//! in place, and the [`eudoxus`] module compiles it into a compact binary
//! image and executes that image as a streaming matcher. The [`envelope`]
//! module moves intermediate automata in and out of the process.

pub mod envelope;
pub mod eudoxus;
pub mod intermediate;
pub mod optimize;
pub mod options;

pub use eudoxus::{compile, CompileError, CompileResult, Engine, EngineError};
pub use intermediate::Automaton;
pub use options::CompileOptions;
