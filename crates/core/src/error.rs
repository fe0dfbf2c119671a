//! Error values and the raise path
//!
//! Errors are ordinary values: an `error!` cell referencing a frame whose
//! slots carry the machine-readable kind plus up to three arguments and a
//! "near" context. Raising one produces a [`Raise`] carried through every
//! evaluator signature as the `Err` arm of [`Eval`]; there are no hidden
//! non-local exits. Traps (see `eval`) convert a `Raise` back into a value.
//!
//! Two errors are special enough to be minted once at boot and reused: the
//! halt raised by the escape signal and the stack-overflow guard. Both must
//! be deliverable without allocating.
//!
//! During bootstrap nothing may raise: an error before the engine is whole
//! is a fatal panic, which the host maps to its failure exit status.

use crate::engine::Engine;
use crate::frame::{append_frame, make_frame, set_frame_spec};
use crate::pool::MemError;
use crate::series::SeriesError;
use crate::value::{Cell, CellFlags, ParamClass, Typeset, TypedWord, Value, Word};

/// Every failure the core can signal, language-neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrKind {
    OutOfMemory,
    NoMemory,
    StackOverflow,
    Locked,
    Protected,
    LockedWord,
    NotDefined,
    NoRelative,
    SelfProtected,
    NeedValue,
    NoArg,
    NoRefine,
    ExpectArg,
    NoOpArg,
    BadPath,
    BadSetPath,
    BadRange,
    BadSetType,
    TypeLimit,
    Range,
    Halt,
    ThrowUncaught,
    DupVars,
    NotDone,
    PastEnd,
    Internal,
    Syntax,
    TooMany,
    User,
}

impl ErrKind {
    /// Error category word, mirrored into the frame's `type` slot.
    pub fn category(self) -> &'static str {
        use ErrKind::*;
        match self {
            OutOfMemory | NoMemory => "memory",
            StackOverflow | Internal | NotDone => "internal",
            TypeLimit | Range => "math",
            Locked | Protected | LockedWord | SelfProtected => "access",
            Halt | ThrowUncaught => "throw",
            Syntax => "syntax",
            User => "user",
            _ => "script",
        }
    }

    /// Stable id spelling, mirrored into the frame's `id` slot.
    pub fn id(self) -> &'static str {
        use ErrKind::*;
        match self {
            OutOfMemory => "out-of-memory",
            NoMemory => "no-memory",
            StackOverflow => "stack-overflow",
            Locked => "locked",
            Protected => "protected",
            LockedWord => "locked-word",
            NotDefined => "not-defined",
            NoRelative => "not-in-context",
            SelfProtected => "self-protected",
            NeedValue => "need-value",
            NoArg => "no-arg",
            NoRefine => "no-refine",
            ExpectArg => "expect-arg",
            NoOpArg => "no-op-arg",
            BadPath => "invalid-path",
            BadSetPath => "bad-path-set",
            BadRange => "out-of-range",
            BadSetType => "bad-path-type",
            TypeLimit => "type-limit",
            Range => "overflow",
            Halt => "halt",
            ThrowUncaught => "no-catch",
            DupVars => "dup-vars",
            NotDone => "not-done",
            PastEnd => "past-end",
            Internal => "internal",
            Syntax => "invalid",
            TooMany => "too-many-args",
            User => "message",
        }
    }

    /// Human template; `$1`..`$3` are substituted with formed arguments.
    pub fn template(self) -> &'static str {
        use ErrKind::*;
        match self {
            OutOfMemory => "not enough memory",
            NoMemory => "memory request too large",
            StackOverflow => "stack overflow",
            Locked => "series is locked: $1",
            Protected => "protected from modification: $1",
            LockedWord => "word is locked: $1",
            NotDefined => "$1 has no value",
            NoRelative => "$1 is not in the active context",
            SelfProtected => "cannot set self",
            NeedValue => "$1 needs a value",
            NoArg => "$1 is missing its $2 argument",
            NoRefine => "$1 has no refinement called $2",
            ExpectArg => "$1 does not allow $3 for its $2 argument",
            NoOpArg => "infix $1 has no left argument",
            BadPath => "cannot use $2 on $1 value in path",
            BadSetPath => "cannot set $1 in path",
            BadRange => "value out of range: $1",
            BadSetType => "bad path set target: $1",
            TypeLimit => "value exceeds its type limit: $1",
            Range => "math or number overflow",
            Halt => "halted by user or script",
            ThrowUncaught => "no catch for throw: $1",
            DupVars => "duplicate variable specified: $1",
            NotDone => "reserved for future use: $1",
            PastEnd => "out of range or past end",
            Internal => "internal engine defect: $1",
            Syntax => "invalid syntax: $1 near line $2",
            TooMany => "too many arguments for $1",
            User => "$1",
        }
    }

    fn from_code(code: i64) -> Option<ErrKind> {
        use ErrKind::*;
        const ALL: [ErrKind; 29] = [
            OutOfMemory,
            NoMemory,
            StackOverflow,
            Locked,
            Protected,
            LockedWord,
            NotDefined,
            NoRelative,
            SelfProtected,
            NeedValue,
            NoArg,
            NoRefine,
            ExpectArg,
            NoOpArg,
            BadPath,
            BadSetPath,
            BadRange,
            BadSetType,
            TypeLimit,
            Range,
            Halt,
            ThrowUncaught,
            DupVars,
            NotDone,
            PastEnd,
            Internal,
            Syntax,
            TooMany,
            User,
        ];
        ALL.iter().find(|k| **k as i64 == code).copied()
    }
}

/// A raised (hard) error travelling up the evaluator. The payload is
/// always an `error!` cell.
#[derive(Debug, Clone, Copy)]
pub struct Raise(pub Cell);

/// Evaluator result: a value or an unwinding error.
pub type Eval<T> = Result<T, Raise>;

/// Error frame slot layout, after the descriptor.
const SLOT_CODE: usize = 1;
const SLOT_ID: usize = 3;
const SLOT_ARG1: usize = 4;
const SLOT_NEAR: usize = 7;

const ERROR_FIELDS: [&str; 8] = ["code", "type", "id", "arg1", "arg2", "arg3", "near", "where"];

/// Build an error frame as a plain value, without raising it.
pub fn make_error(engine: &mut Engine, kind: ErrKind, args: &[Cell]) -> Result<Cell, MemError> {
    let frame = make_frame(&mut engine.arena, &mut engine.symbols, ERROR_FIELDS.len(), false)?;
    for name in ERROR_FIELDS {
        let sym = engine.symbols.intern(name);
        append_frame(
            &mut engine.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )?;
    }
    let store = |engine: &mut Engine, slot: usize, cell: Cell| {
        engine
            .arena
            .set_cell(frame, slot, cell)
            .expect("fresh error frame is writable");
    };
    store(engine, SLOT_CODE, Cell::new(Value::Integer(kind as i64)));
    let type_sym = engine.symbols.intern(kind.category());
    store(engine, SLOT_CODE + 1, Cell::new(Value::Word(Word::unbound(type_sym))));
    let id_sym = engine.symbols.intern(kind.id());
    store(engine, SLOT_ID, Cell::new(Value::Word(Word::unbound(id_sym))));
    for (i, arg) in args.iter().take(3).enumerate() {
        store(engine, SLOT_ARG1 + i, arg.stored());
    }
    set_frame_spec(&mut engine.arena, frame, None);
    engine.arena.manage_deep(frame);
    let words = crate::frame::frame_words(&engine.arena, frame);
    engine.arena.manage(words);
    Ok(Cell::new(Value::ErrorVal(frame)))
}

/// Raise an error. During bootstrap this is fatal by design.
pub fn raise(engine: &mut Engine, kind: ErrKind, args: &[Cell]) -> Raise {
    if engine.booting {
        panic!("error during bootstrap: {} ({:?})", kind.template(), kind);
    }
    match kind {
        // Pre-made, allocation-free deliveries.
        ErrKind::Halt => Raise(engine.halt_error),
        ErrKind::StackOverflow => Raise(engine.stack_error),
        _ => match make_error(engine, kind, args) {
            Ok(cell) => Raise(cell),
            // Allocation refused while building the error: fall back to the
            // pre-made out-of-memory value.
            Err(_) => Raise(engine.oom_error),
        },
    }
}

/// Convert a low-level series failure into a raised error.
pub fn raise_series(engine: &mut Engine, err: SeriesError) -> Raise {
    match err {
        SeriesError::Mem(MemError::OutOfMemory) => Raise(engine.oom_error),
        SeriesError::Mem(MemError::NoMemory) => raise(engine, ErrKind::NoMemory, &[]),
        SeriesError::Locked => raise(engine, ErrKind::Locked, &[]),
        SeriesError::Protected => raise(engine, ErrKind::Protected, &[]),
    }
}

pub fn raise_mem(engine: &mut Engine, err: MemError) -> Raise {
    raise_series(engine, SeriesError::Mem(err))
}

/// Read the kind back out of an error value.
pub fn error_kind(engine: &Engine, cell: &Cell) -> Option<ErrKind> {
    let Value::ErrorVal(frame) = cell.value else {
        return None;
    };
    match engine.arena.cell_at(frame, SLOT_CODE).value {
        Value::Integer(code) => ErrKind::from_code(code),
        _ => None,
    }
}

/// The formed argument cells of an error value.
pub fn error_args(engine: &Engine, cell: &Cell) -> [Cell; 3] {
    let Value::ErrorVal(frame) = cell.value else {
        return [Cell::NONE; 3];
    };
    [
        engine.arena.cell_at(frame, SLOT_ARG1),
        engine.arena.cell_at(frame, SLOT_ARG1 + 1),
        engine.arena.cell_at(frame, SLOT_ARG1 + 2),
    ]
}

/// Attach the "near" context (the block position being evaluated).
pub fn set_error_near(engine: &mut Engine, cell: &Cell, near: Cell) {
    if let Value::ErrorVal(frame) = cell.value {
        // Only the first raiser's position is kept.
        if engine.arena.cell_at(frame, SLOT_NEAR).value == Value::Unset {
            let _ = engine.arena.set_cell(frame, SLOT_NEAR, near);
        }
    }
}

pub fn error_near(engine: &Engine, cell: &Cell) -> Option<Cell> {
    if let Value::ErrorVal(frame) = cell.value {
        let near = engine.arena.cell_at(frame, SLOT_NEAR);
        if near.value != Value::Unset {
            return Some(near);
        }
    }
    None
}

/// True for the one error only halt-aware traps may catch.
pub fn is_halt(engine: &Engine, cell: &Cell) -> bool {
    error_kind(engine, cell) == Some(ErrKind::Halt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;

    #[test]
    fn test_error_roundtrips_its_kind() {
        let mut e = Engine::new(Config::default());
        let cell = make_error(&mut e, ErrKind::NotDefined, &[Cell::TRUE]).unwrap();
        assert_eq!(error_kind(&e, &cell), Some(ErrKind::NotDefined));
        assert_eq!(error_args(&e, &cell)[0], Cell::TRUE);
        assert!(!is_halt(&e, &cell));
    }

    #[test]
    fn test_halt_is_premade_and_allocation_free() {
        let mut e = Engine::new(Config::default());
        let live_before = e.arena.live_count();
        let raised = raise(&mut e, ErrKind::Halt, &[]);
        assert_eq!(e.arena.live_count(), live_before, "halt must not allocate");
        assert!(is_halt(&e, &raised.0));
    }

    #[test]
    fn test_near_is_write_once() {
        let mut e = Engine::new(Config::default());
        let cell = make_error(&mut e, ErrKind::Range, &[]).unwrap();
        set_error_near(&mut e, &cell, Cell::new(Value::Integer(1)));
        set_error_near(&mut e, &cell, Cell::new(Value::Integer(2)));
        assert_eq!(error_near(&e, &cell), Some(Cell::new(Value::Integer(1))));
    }

    #[test]
    fn test_every_kind_has_metadata() {
        for code in 0..29 {
            let kind = ErrKind::from_code(code).expect("dense error codes");
            assert!(!kind.id().is_empty());
            assert!(!kind.category().is_empty());
            assert!(!kind.template().is_empty());
            assert_eq!(ErrKind::from_code(kind as i64), Some(kind));
        }
    }
}
