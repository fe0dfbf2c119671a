//! Frames: named environments
//!
//! A frame is a pair of parallel cell-array series: a **word series** of
//! typed words naming each slot and a **value series** holding the current
//! values. The value series *is* the frame (objects and errors carry its
//! id); its slot 0 holds a `FrameHead` descriptor pointing back at the word
//! series, and the word series slot 0 carries the `self` sentinel (or the
//! no-name marker when self-reference is suppressed).
//!
//! Two frame kinds exist and are distinguished by the sign of a word's slot
//! index: **persistent** frames (objects, the lib and user contexts) are
//! reached with positive indices straight into the value series, while
//! **stack-relative** frames (function arguments) use negative indices that
//! resolve against the live call chain at lookup time.

use crate::engine::Engine;
use crate::error::{ErrKind, Eval, raise};
use crate::pool::MemError;
use crate::series::{Arena, SeriesClass, SeriesFlags, SeriesId};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{Cell, CellFlags, ParamClass, Typeset, TypedWord, Value, Word};

/// Spelling of the slot-0 sentinel when self-reference is requested.
pub const SELF_NAME: &str = "self";
/// Spelling of the slot-0 marker when it is not.
pub const NO_NAME: &str = "-no-name-";

/// Create a frame with room for `capacity` slots. Both series are manual;
/// callers manage them when the frame becomes reachable.
pub fn make_frame(
    arena: &mut Arena,
    symbols: &mut SymbolTable,
    capacity: usize,
    with_self: bool,
) -> Result<SeriesId, MemError> {
    let words = arena.make(SeriesClass::Cells, capacity + 1)?;
    let values = arena.make(SeriesClass::Cells, capacity + 1)?;

    let sentinel = symbols.intern(if with_self { SELF_NAME } else { NO_NAME });
    let mut self_word = Cell::new(Value::TypedWord(TypedWord::new(
        sentinel,
        ParamClass::Normal,
        Typeset::any_type(),
    )));
    if !with_self {
        self_word.flags |= CellFlags::HIDE;
    }
    arena.push_cell(words, self_word).expect("fresh series cannot be protected");
    arena
        .push_cell(values, Cell::new(Value::FrameHead { words, spec: None }))
        .expect("fresh series cannot be protected");
    Ok(values)
}

/// The word series of a frame, read out of its slot-0 descriptor.
pub fn frame_words(arena: &Arena, frame: SeriesId) -> SeriesId {
    match arena.cell_at(frame, 0).value {
        Value::FrameHead { words, .. } => words,
        other => panic!("frame slot 0 holds {other:?}, not a frame head"),
    }
}

/// Attach a spec block to a frame's descriptor.
pub fn set_frame_spec(arena: &mut Arena, frame: SeriesId, spec: Option<SeriesId>) {
    let words = frame_words(arena, frame);
    arena
        .set_cell(frame, 0, Cell::new(Value::FrameHead { words, spec }))
        .expect("frame descriptor slot must stay writable");
}

/// Number of named slots (the descriptor slot does not count).
pub fn frame_len(arena: &Arena, frame: SeriesId) -> usize {
    arena.get(frame).len().saturating_sub(1)
}

/// Append a slot to a frame, returning its (positive) index.
pub fn append_frame(
    arena: &mut Arena,
    frame: SeriesId,
    word: TypedWord,
    flags: CellFlags,
) -> Result<i32, MemError> {
    let words = frame_words(arena, frame);
    let mut cell = Cell::new(Value::TypedWord(word));
    cell.flags |= flags & (CellFlags::HIDE | CellFlags::LOCK);
    push_grow(arena, words, cell)?;
    push_grow(arena, frame, Cell::UNSET)?;
    Ok((arena.get(frame).len() - 1) as i32)
}

fn push_grow(arena: &mut Arena, id: SeriesId, cell: Cell) -> Result<(), MemError> {
    arena.push_cell(id, cell).map_err(|e| match e {
        crate::series::SeriesError::Mem(m) => m,
        // Context frames are never protected while still growing.
        other => panic!("frame growth rejected: {other:?}"),
    })
}

/// Find a symbol in a frame's word list, case-insensitively. Hidden slots
/// are invisible. Returns the slot index.
pub fn find_word(
    arena: &Arena,
    symbols: &SymbolTable,
    frame: SeriesId,
    sym: Sym,
) -> Option<i32> {
    let words = frame_words(arena, frame);
    let canon = symbols.canon(sym);
    for (i, cell) in arena.cells(words).iter().enumerate().skip(1) {
        if cell.flags.contains(CellFlags::HIDE) {
            continue;
        }
        if let Value::TypedWord(tw) = cell.value {
            if symbols.canon(tw.sym) == canon {
                return Some(i as i32);
            }
        }
    }
    None
}

/// The typed-word entry backing a slot.
pub fn slot_word(arena: &Arena, frame: SeriesId, index: i32) -> Cell {
    let words = frame_words(arena, frame);
    arena.cell_at(words, index as usize)
}

/// Resolve a word to its current value.
///
/// Positive indices read the persistent frame directly; negative indices
/// walk the call chain for the youngest *ready* call whose function owns
/// the word's list; index zero fabricates the frame self-reference.
pub fn get_var(engine: &mut Engine, word: &Word) -> Eval<Cell> {
    let word_cell = Cell::new(Value::Word(*word));
    let Some(frame) = word.binding else {
        return Err(raise(engine, ErrKind::NotDefined, &[word_cell]));
    };
    if word.index > 0 {
        if (word.index as usize) >= engine.arena.get(frame).len() {
            return Err(raise(engine, ErrKind::NotDefined, &[word_cell]));
        }
        return Ok(engine.arena.cell_at(frame, word.index as usize));
    }
    if word.index == 0 {
        // Frame self-reference, fabricated on demand.
        return Ok(Cell::new(Value::Object(frame)));
    }
    // Stack-relative: `frame` here is the function's word-list series.
    let slot = (-word.index - 1) as usize;
    for call in engine.calls.iter().rev() {
        if !call.ready {
            continue;
        }
        if call.func_words() == Some(frame) {
            return Ok(engine.ds[call.args.0 + slot]);
        }
    }
    Err(raise(engine, ErrKind::NoRelative, &[word_cell]))
}

/// Store a value through a word binding, honoring slot locks.
pub fn set_var(engine: &mut Engine, word: &Word, value: Cell) -> Eval<()> {
    let word_cell = Cell::new(Value::Word(*word));
    let Some(frame) = word.binding else {
        return Err(raise(engine, ErrKind::NotDefined, &[word_cell]));
    };
    if word.index == 0 {
        return Err(raise(engine, ErrKind::SelfProtected, &[word_cell]));
    }
    if word.index > 0 {
        if (word.index as usize) >= engine.arena.get(frame).len() {
            return Err(raise(engine, ErrKind::NotDefined, &[word_cell]));
        }
        if slot_word(&engine.arena, frame, word.index).flags.contains(CellFlags::LOCK) {
            return Err(raise(engine, ErrKind::LockedWord, &[word_cell]));
        }
        if engine.arena.get(frame).flags.contains(SeriesFlags::PROTECTED) {
            return Err(raise(engine, ErrKind::Protected, &[word_cell]));
        }
        engine
            .arena
            .set_cell(frame, word.index as usize, value)
            .map_err(|_| raise(engine, ErrKind::Protected, &[word_cell]))?;
        return Ok(());
    }
    let slot = (-word.index - 1) as usize;
    for ci in (0..engine.calls.len()).rev() {
        let call = &engine.calls[ci];
        if !call.ready {
            continue;
        }
        if call.func_words() == Some(frame) {
            let at = call.args.0 + slot;
            engine.ds[at] = value.stored();
            return Ok(());
        }
    }
    Err(raise(engine, ErrKind::NoRelative, &[word_cell]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};

    fn engine() -> Engine {
        Engine::new(Config::default())
    }

    #[test]
    fn test_frame_shape() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 4, true).unwrap();
        let words = frame_words(&e.arena, frame);
        assert_eq!(frame_len(&e.arena, frame), 0);
        // Slot 0 of the word series names "self".
        match e.arena.cell_at(words, 0).value {
            Value::TypedWord(tw) => assert_eq!(e.symbols.name(tw.sym), SELF_NAME),
            other => panic!("unexpected sentinel {other:?}"),
        }
    }

    #[test]
    fn test_append_and_find() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 2, true).unwrap();
        let sym = e.symbols.intern("alpha");
        let slot = append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .unwrap();
        assert_eq!(slot, 1);
        assert_eq!(find_word(&e.arena, &e.symbols, frame, sym), Some(1));
        // Case-insensitive: a different spelling still finds the slot.
        let shouty = e.symbols.intern("ALPHA");
        assert_eq!(find_word(&e.arena, &e.symbols, frame, shouty), Some(1));
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 2, false).unwrap();
        let sym = e.symbols.intern("x");
        let slot = append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .unwrap();
        let word = Word::bound(sym, frame, slot);
        set_var(&mut e, &word, Cell::new(Value::Integer(7))).unwrap();
        assert_eq!(get_var(&mut e, &word).unwrap().value, Value::Integer(7));
    }

    #[test]
    fn test_unbound_word_is_not_defined() {
        let mut e = engine();
        let sym = e.symbols.intern("ghost");
        let err = get_var(&mut e, &Word::unbound(sym)).unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err.0), Some(ErrKind::NotDefined));
    }

    #[test]
    fn test_self_slot_reads_as_object_and_rejects_writes() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 1, true).unwrap();
        let sym = e.symbols.intern(SELF_NAME);
        let word = Word::bound(sym, frame, 0);

        let got = get_var(&mut e, &word).unwrap();
        assert_eq!(got.value, Value::Object(frame));

        let err = set_var(&mut e, &word, Cell::TRUE).unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err.0), Some(ErrKind::SelfProtected));
    }

    #[test]
    fn test_locked_slot_rejects_writes() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 1, false).unwrap();
        let sym = e.symbols.intern("constant");
        let slot = append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::LOCK,
        )
        .unwrap();
        let word = Word::bound(sym, frame, slot);
        assert_eq!(get_var(&mut e, &word).unwrap().value, Value::Unset);
        let err = set_var(&mut e, &word, Cell::TRUE).unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err.0), Some(ErrKind::LockedWord));
    }

    #[test]
    fn test_hidden_slots_are_invisible() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 1, false).unwrap();
        let sym = e.symbols.intern("secret");
        append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::HIDE,
        )
        .unwrap();
        assert_eq!(find_word(&e.arena, &e.symbols, frame, sym), None);
    }

    #[test]
    fn test_relative_word_without_live_call() {
        let mut e = engine();
        let words = e.arena.make(SeriesClass::Cells, 1).unwrap();
        let sym = e.symbols.intern("arg");
        let word = Word { sym, binding: Some(words), index: -1 };
        let err = get_var(&mut e, &word).unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err.0), Some(ErrKind::NoRelative));
    }
}
