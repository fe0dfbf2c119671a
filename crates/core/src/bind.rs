//! Binding: connecting words to frame slots
//!
//! A binding pass rewrites word cells in place so later lookups are direct
//! slot reads. The pass pivots on the engine-wide **bind table**, a
//! canonical-symbol-indexed array of slot indices that is preloaded from the
//! target frame, consulted while walking the values, and restored to
//! all-zero before the pass returns - on every path, including failures.
//! The garbage collector refuses to run while the table holds entries.
//!
//! Positive table entries bind to persistent frame slots; negative entries
//! are relative indices into a function's argument list, resolved against
//! the live call chain at lookup time. Zero means "not visible here".

use crate::engine::Engine;
use crate::error::{ErrKind, Eval, raise, raise_mem};
use crate::frame::{append_frame, frame_words};
use crate::series::{SeriesClass, SeriesId};
use crate::symbol::Sym;
use crate::value::{
    Cell, CellFlags, ParamClass, Typeset, TypedWord, Value, Word,
};

/// The transient symbol -> slot map. All-zero outside binding passes.
pub struct BindTable {
    slots: Vec<i32>,
    depth: u32,
}

impl Default for BindTable {
    fn default() -> Self {
        BindTable::new()
    }
}

impl BindTable {
    pub fn new() -> BindTable {
        BindTable { slots: Vec::new(), depth: 0 }
    }

    /// True while a binding pass is active (the GC gate).
    pub fn in_use(&self) -> bool {
        self.depth > 0
    }

    fn enter(&mut self, high: Sym) {
        self.depth += 1;
        if self.slots.len() <= high.0 as usize {
            self.slots.resize(high.0 as usize + 1, 0);
        }
    }

    fn exit(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
        debug_assert!(self.depth > 0 || self.is_clear(), "bind table left dirty");
    }

    fn get(&self, canon: Sym) -> i32 {
        self.slots.get(canon.0 as usize).copied().unwrap_or(0)
    }

    fn set(&mut self, canon: Sym, index: i32) {
        if self.slots.len() <= canon.0 as usize {
            self.slots.resize(canon.0 as usize + 1, 0);
        }
        self.slots[canon.0 as usize] = index;
    }

    /// The table invariant: every entry zero between passes.
    pub fn is_clear(&self) -> bool {
        self.slots.iter().all(|s| *s == 0)
    }
}

/// Options for a frame binding pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindOpts {
    /// Recurse into nested blocks, parens, and paths.
    pub deep: bool,
    /// Extend the frame with set-words not yet present.
    pub add_set_words: bool,
}

impl BindOpts {
    pub fn deep() -> BindOpts {
        BindOpts { deep: true, add_set_words: false }
    }

    pub fn deep_set() -> BindOpts {
        BindOpts { deep: true, add_set_words: true }
    }
}

/// Bind the words of a block into a persistent frame.
pub fn bind_block(
    engine: &mut Engine,
    frame: SeriesId,
    block: SeriesId,
    opts: BindOpts,
) -> Eval<()> {
    let words = frame_words(&engine.arena, frame);
    engine.binds.enter(engine.symbols.high_sym());

    // Preload: each visible frame word maps to its slot.
    for (i, cell) in engine.arena.cells(words).to_vec().into_iter().enumerate().skip(1) {
        if cell.flags.contains(CellFlags::HIDE) {
            continue;
        }
        if let Value::TypedWord(tw) = cell.value {
            let canon = engine.symbols.canon(tw.sym);
            engine.binds.set(canon, i as i32);
        }
    }
    let has_self = matches!(
        engine.arena.cell_at(words, 0).value,
        Value::TypedWord(tw) if engine.symbols.case_eq(tw.sym, engine.sym_self)
    );

    let result = bind_walk(engine, frame, block, opts, has_self);

    // Restore: clear every entry, including slots added during the walk.
    let words = frame_words(&engine.arena, frame);
    for cell in engine.arena.cells(words).to_vec() {
        if let Value::TypedWord(tw) = cell.value {
            let canon = engine.symbols.canon(tw.sym);
            engine.binds.set(canon, 0);
        }
    }
    engine.binds.exit();
    result
}

fn bind_walk(
    engine: &mut Engine,
    frame: SeriesId,
    block: SeriesId,
    opts: BindOpts,
    has_self: bool,
) -> Eval<()> {
    let len = engine.arena.get(block).len();
    for i in 0..len {
        let mut cell = engine.arena.cell_at(block, i);
        let kind = cell.value.kind();
        if let Some(word) = cell.value.word_mut() {
            let canon = engine.symbols.canon(word.sym);
            if has_self && engine.symbols.case_eq(word.sym, engine.sym_self) {
                word.binding = Some(frame);
                word.index = 0;
            } else {
                let n = engine.binds.get(canon);
                if n != 0 {
                    word.binding = Some(frame);
                    word.index = n;
                } else if opts.add_set_words && kind == crate::value::Kind::SetWord {
                    let slot = append_frame(
                        &mut engine.arena,
                        frame,
                        TypedWord::new(word.sym, ParamClass::Normal, Typeset::any_type()),
                        CellFlags::empty(),
                    )
                    .map_err(|e| raise_mem(engine, e))?;
                    engine.binds.set(canon, slot);
                    word.binding = Some(frame);
                    word.index = slot;
                } else {
                    continue;
                }
            }
            engine
                .arena
                .set_cell(block, i, cell)
                .map_err(|e| crate::error::raise_series(engine, e))?;
        } else if opts.deep && cell.value.is_block_like() {
            if let Some(r) = cell.value.series_ref() {
                bind_walk(engine, frame, r.series, opts, has_self)?;
            }
        }
    }
    Ok(())
}

/// Bind a function body to its word list with negated (relative) indices.
/// Parameter `i` (1-based) becomes index `-i`, resolved against the call
/// chain when the function runs.
pub fn bind_relative(engine: &mut Engine, words: SeriesId, body: SeriesId) -> Eval<()> {
    engine.binds.enter(engine.symbols.high_sym());
    for (i, cell) in engine.arena.cells(words).to_vec().into_iter().enumerate().skip(1) {
        if let Value::TypedWord(tw) = cell.value {
            let canon = engine.symbols.canon(tw.sym);
            engine.binds.set(canon, -(i as i32));
        }
    }

    let result = bind_relative_walk(engine, words, body);

    for cell in engine.arena.cells(words).to_vec() {
        if let Value::TypedWord(tw) = cell.value {
            let canon = engine.symbols.canon(tw.sym);
            engine.binds.set(canon, 0);
        }
    }
    engine.binds.exit();
    result
}

fn bind_relative_walk(engine: &mut Engine, words: SeriesId, body: SeriesId) -> Eval<()> {
    let len = engine.arena.get(body).len();
    for i in 0..len {
        let mut cell = engine.arena.cell_at(body, i);
        if let Some(word) = cell.value.word_mut() {
            let canon = engine.symbols.canon(word.sym);
            let n = engine.binds.get(canon);
            if n < 0 {
                word.binding = Some(words);
                word.index = n;
                engine
                    .arena
                    .set_cell(body, i, cell)
                    .map_err(|e| crate::error::raise_series(engine, e))?;
            }
        } else if cell.value.is_block_like() {
            if let Some(r) = cell.value.series_ref() {
                bind_relative_walk(engine, words, r.series)?;
            }
        }
    }
    Ok(())
}

/// Options for [`collect_words`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOpts {
    /// Gather only set-words (object specs) instead of every word.
    pub set_words_only: bool,
    /// Recurse into nested blocks.
    pub deep: bool,
    /// Raise DupVars when a name repeats (function specs).
    pub no_dup: bool,
    /// Put `self` at slot 0; otherwise the hidden no-name marker.
    pub with_self: bool,
}

/// Scan value sequences into a word list suitable for a frame.
///
/// Returns `prior` unchanged when nothing new appeared, otherwise a fresh
/// manual word series copied from the engine-wide scratch buffer. Exactly
/// one collection may run at a time.
pub fn collect_words(
    engine: &mut Engine,
    prior: Option<SeriesId>,
    blocks: &[SeriesId],
    opts: CollectOpts,
) -> Eval<SeriesId> {
    assert!(!engine.collecting, "word collection reentered");
    engine.collecting = true;
    engine.buf_words.clear();
    engine.binds.enter(engine.symbols.high_sym());

    // Slot 0 sentinel, mirroring frame construction.
    let sentinel_name = if opts.with_self { crate::frame::SELF_NAME } else { crate::frame::NO_NAME };
    let sentinel = engine.symbols.intern(sentinel_name);
    let mut head = Cell::new(Value::TypedWord(TypedWord::new(
        sentinel,
        ParamClass::Normal,
        Typeset::any_type(),
    )));
    if !opts.with_self {
        head.flags |= CellFlags::HIDE;
    }
    engine.buf_words.push(head);

    let prior_len = if let Some(prior) = prior {
        for cell in engine.arena.cells(prior).to_vec().into_iter().skip(1) {
            if let Value::TypedWord(tw) = cell.value {
                let canon = engine.symbols.canon(tw.sym);
                let at = engine.buf_words.len() as i32;
                engine.buf_words.push(cell);
                engine.binds.set(canon, at);
            }
        }
        engine.buf_words.len()
    } else {
        1
    };

    let mut result = Ok(());
    for block in blocks {
        result = collect_walk(engine, *block, opts);
        if result.is_err() {
            break;
        }
    }

    // Restore the table from the scratch buffer before anything else.
    for i in 1..engine.buf_words.len() {
        if let Value::TypedWord(tw) = engine.buf_words[i].value {
            let canon = engine.symbols.canon(tw.sym);
            engine.binds.set(canon, 0);
        }
    }
    engine.binds.exit();
    engine.collecting = false;
    result?;

    if let Some(prior) = prior {
        if engine.buf_words.len() == prior_len {
            return Ok(prior);
        }
    }
    let fresh = engine
        .arena
        .make(SeriesClass::Cells, engine.buf_words.len())
        .map_err(|e| raise_mem(engine, e))?;
    for i in 0..engine.buf_words.len() {
        let cell = engine.buf_words[i];
        engine
            .arena
            .push_cell(fresh, cell)
            .map_err(|e| crate::error::raise_series(engine, e))?;
    }
    Ok(fresh)
}

fn collect_walk(engine: &mut Engine, block: SeriesId, opts: CollectOpts) -> Eval<()> {
    let len = engine.arena.get(block).len();
    for i in 0..len {
        let cell = engine.arena.cell_at(block, i);
        let wanted = match cell.value.kind() {
            crate::value::Kind::SetWord => true,
            crate::value::Kind::Word
            | crate::value::Kind::GetWord
            | crate::value::Kind::LitWord
            | crate::value::Kind::Refinement => !opts.set_words_only,
            _ => false,
        };
        if wanted {
            let sym = cell.value.word_sym().expect("word kinds carry symbols");
            let canon = engine.symbols.canon(sym);
            if engine.binds.get(canon) != 0 {
                if opts.no_dup {
                    let dup = Cell::new(Value::Word(Word::unbound(sym)));
                    return Err(raise(engine, ErrKind::DupVars, &[dup]));
                }
                continue;
            }
            let at = engine.buf_words.len() as i32;
            engine.buf_words.push(Cell::new(Value::TypedWord(TypedWord::new(
                sym,
                ParamClass::Normal,
                Typeset::any_type(),
            ))));
            engine.binds.set(canon, at);
        } else if opts.deep && cell.value.is_block_like() {
            if let Some(r) = cell.value.series_ref() {
                collect_walk(engine, r.series, opts)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};
    use crate::frame::{find_word, frame_len, make_frame};

    fn engine() -> Engine {
        Engine::new(Config::default())
    }

    /// Build a block of unbound words from spellings; set-words end in `:`.
    fn block_of(e: &mut Engine, names: &[&str]) -> SeriesId {
        let block = e.arena.make(SeriesClass::Cells, names.len()).unwrap();
        for name in names {
            let cell = if let Some(base) = name.strip_suffix(':') {
                let sym = e.symbols.intern(base);
                Cell::new(Value::SetWord(Word::unbound(sym)))
            } else {
                let sym = e.symbols.intern(name);
                Cell::new(Value::Word(Word::unbound(sym)))
            };
            e.arena.push_cell(block, cell).unwrap();
        }
        block
    }

    #[test]
    fn test_bind_rewrites_known_words() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 2, false).unwrap();
        let sym = e.symbols.intern("x");
        append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .unwrap();

        let block = block_of(&mut e, &["x", "y"]);
        bind_block(&mut e, frame, block, BindOpts::default()).unwrap();

        let x = e.arena.cell_at(block, 0);
        assert_eq!(x.value.word().unwrap().binding, Some(frame));
        assert_eq!(x.value.word().unwrap().index, 1);
        // y is not in the frame and stays unbound.
        assert_eq!(e.arena.cell_at(block, 1).value.word().unwrap().binding, None);
        assert!(e.binds.is_clear(), "bind table must be all-zero after the pass");
    }

    #[test]
    fn test_bind_set_extends_the_frame() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 2, false).unwrap();
        let block = block_of(&mut e, &["a:", "a", "b:"]);
        bind_block(&mut e, frame, block, BindOpts::deep_set()).unwrap();

        assert_eq!(frame_len(&e.arena, frame), 2);
        let a_sym = e.symbols.intern("a");
        assert_eq!(find_word(&e.arena, &e.symbols, frame, a_sym), Some(1));
        // The plain `a` after `a:` picked up the fresh slot.
        let a = e.arena.cell_at(block, 1);
        assert_eq!(a.value.word().unwrap().index, 1);
        assert!(e.binds.is_clear());
    }

    #[test]
    fn test_bind_deep_recurses() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 1, false).unwrap();
        let sym = e.symbols.intern("inner");
        append_frame(
            &mut e.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .unwrap();

        let nested = block_of(&mut e, &["inner"]);
        let outer = e.arena.make(SeriesClass::Cells, 1).unwrap();
        e.arena
            .push_cell(outer, Cell::new(Value::Block(crate::value::SeriesRef::head(nested))))
            .unwrap();

        bind_block(&mut e, frame, outer, BindOpts::default()).unwrap();
        assert_eq!(e.arena.cell_at(nested, 0).value.word().unwrap().binding, None);

        bind_block(&mut e, frame, outer, BindOpts::deep()).unwrap();
        assert_eq!(e.arena.cell_at(nested, 0).value.word().unwrap().binding, Some(frame));
        assert!(e.binds.is_clear());
    }

    #[test]
    fn test_bind_self_when_frame_has_self() {
        let mut e = engine();
        let frame = make_frame(&mut e.arena, &mut e.symbols, 1, true).unwrap();
        let block = block_of(&mut e, &["self"]);
        bind_block(&mut e, frame, block, BindOpts::default()).unwrap();
        let cell = e.arena.cell_at(block, 0);
        assert_eq!(cell.value.word().unwrap().binding, Some(frame));
        assert_eq!(cell.value.word().unwrap().index, 0);
    }

    #[test]
    fn test_bind_relative_uses_negated_indices() {
        let mut e = engine();
        let words = e.arena.make(SeriesClass::Cells, 3).unwrap();
        let no_name = e.symbols.intern(crate::frame::NO_NAME);
        e.arena
            .push_cell(
                words,
                Cell::new(Value::TypedWord(TypedWord::new(
                    no_name,
                    ParamClass::Normal,
                    Typeset::any_type(),
                ))),
            )
            .unwrap();
        for name in ["a", "b"] {
            let sym = e.symbols.intern(name);
            e.arena
                .push_cell(
                    words,
                    Cell::new(Value::TypedWord(TypedWord::new(
                        sym,
                        ParamClass::Normal,
                        Typeset::any_value(),
                    ))),
                )
                .unwrap();
        }

        let body = block_of(&mut e, &["b", "a", "c"]);
        bind_relative(&mut e, words, body).unwrap();

        let b = e.arena.cell_at(body, 0).value;
        assert_eq!(b.word().unwrap().binding, Some(words));
        assert_eq!(b.word().unwrap().index, -2);
        let a = e.arena.cell_at(body, 1).value;
        assert_eq!(a.word().unwrap().index, -1);
        assert_eq!(e.arena.cell_at(body, 2).value.word().unwrap().binding, None);
        assert!(e.binds.is_clear());
    }

    #[test]
    fn test_collect_words_set_words_only() {
        let mut e = engine();
        let block = block_of(&mut e, &["a:", "plain", "b:", "a:"]);
        let words = collect_words(
            &mut e,
            None,
            &[block],
            CollectOpts { set_words_only: true, with_self: true, ..CollectOpts::default() },
        )
        .unwrap();
        // self + a + b; the duplicate a: folds away.
        assert_eq!(e.arena.get(words).len(), 3);
        assert!(e.binds.is_clear());
        assert!(!e.collecting);
    }

    #[test]
    fn test_collect_words_duplicate_rejection() {
        let mut e = engine();
        let block = block_of(&mut e, &["x", "y", "x"]);
        let err = collect_words(
            &mut e,
            None,
            &[block],
            CollectOpts { no_dup: true, ..CollectOpts::default() },
        )
        .unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err.0), Some(ErrKind::DupVars));
        assert!(e.binds.is_clear(), "table restored on the failure path too");
        assert!(!e.collecting, "reentrancy latch released on failure");
    }

    #[test]
    fn test_collect_words_prior_unchanged_when_nothing_new() {
        let mut e = engine();
        let first = block_of(&mut e, &["a", "b"]);
        let words = collect_words(&mut e, None, &[first], CollectOpts::default()).unwrap();
        let again = block_of(&mut e, &["b", "a"]);
        let same = collect_words(&mut e, Some(words), &[again], CollectOpts::default()).unwrap();
        assert_eq!(same, words, "no new words: prior list returned unchanged");

        let extended = block_of(&mut e, &["c"]);
        let fresh = collect_words(&mut e, Some(words), &[extended], CollectOpts::default()).unwrap();
        assert_ne!(fresh, words);
        assert_eq!(e.arena.get(fresh).len(), 4);
    }
}
