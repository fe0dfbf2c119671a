//! Tarn Core: the interpreter engine for the Tarn scripting language
//!
//! Tarn is dynamically typed and homoiconic: source text scans into nested
//! series of tagged value cells, and evaluation walks those series against
//! bindable name environments. This crate is the whole core - the host
//! binary in `tarn-repl` is a thin shell over [`Engine`].
//!
//! Key design principles:
//! - `Cell`: a fixed 32-byte `Copy` value; assignment is a bit copy
//! - `Series`: typed, resizable, head-biased arrays addressed by stable
//!   ids; the unit of garbage collection
//! - Frames: parallel word/value series forming every named environment
//! - Evaluation: an explicit stepper with infix lookahead; errors are
//!   `Result`s and control-flow escapes are thrown-flagged cells
//!
//! # Modules
//!
//! - `pool`: segregated-size buffer pools, ballast accounting
//! - `series`: the series heap, manual/managed lifecycles
//! - `gc`: mark-sweep collection over series ids
//! - `symbol`: interning with canonical forms and alias chains
//! - `value`: cells, kinds, typesets, flags
//! - `frame` / `bind`: environments, variable resolution, binding passes
//! - `eval` / `path`: the evaluator, call frames, path dispatch, traps
//! - `loops`: iteration natives and the loop-control protocol
//! - `natives`: the native function table
//! - `scan` / `mold`: text to values and back
//! - `boot`: the embedded boot block and library context assembly
//! - `engine`: the engine handle and embedding API

pub mod bind;
pub mod boot;
pub mod engine;
pub mod error;
pub mod eval;
pub mod frame;
pub mod gc;
pub mod loops;
pub mod mold;
pub mod natives;
pub mod path;
pub mod pool;
pub mod scan;
pub mod series;
pub mod signals;
pub mod symbol;
pub mod value;

// The embedding surface.
pub use engine::{BootLevel, Config, Engine, PolicyOp, Slot};
pub use error::{ErrKind, Eval, Raise, error_kind, is_halt};
pub use series::{SeriesClass, SeriesFlags, SeriesId};
pub use signals::{SIG_ESCAPE, SIG_RECYCLE, SignalFlags};
pub use symbol::Sym;
pub use value::{Cell, CellFlags, Kind, Typeset, Value, Word};

// Scanning and molding, for hosts that stage their own evaluation.
pub use mold::{form_cell, mold_cell};
pub use scan::{ScanError, scan_source};
