//! Path traversal
//!
//! A path is a series of segments. The first segment names the anchor value
//! (through its word binding); every later segment is resolved to a
//! *selector* - words select by symbol, integers by position, get-words by
//! their value, parens by evaluation - and dispatched against the current
//! value's kind. Traversal either walks to a value, stores the set-value at
//! the final segment, or stops at a function value and hands the remaining
//! segments back as refinements for the invocation the evaluator is about
//! to make.
//!
//! Failures are specific: `BadPath` for a selector the current kind cannot
//! use, `BadSetPath` for an impossible store, `BadRange` for an index off
//! the series.

use crate::engine::Engine;
use crate::error::{ErrKind, Eval, raise, raise_series};
use crate::frame::{find_word, get_var, slot_word};
use crate::series::SeriesId;
use crate::value::{Cell, CellFlags, SeriesRef, Value, Word};

/// What the traversal is asked to do at its final segment.
#[derive(Debug, Clone, Copy)]
pub enum PathAction {
    Get,
    Set(Cell),
}

#[derive(Debug, Clone, Copy)]
pub enum PathOutcome {
    /// Traversal walked to this value.
    Value(Cell),
    /// The set-value was accepted at the final segment.
    Stored,
    /// Traversal reached a function; `refine_at` is the absolute segment
    /// index where the unconsumed (refinement) segments begin.
    Func { func: Cell, refine_at: usize },
}

/// Walk a path. `path.index` locates the first segment within its series.
pub fn traverse(engine: &mut Engine, path: SeriesRef, action: PathAction) -> Eval<PathOutcome> {
    let series = path.series;
    let len = engine.arena.get(series).len();
    let first = path.index as usize;
    let path_cell = Cell::new(Value::Path(path));
    if first >= len {
        return Err(raise(engine, ErrKind::BadPath, &[path_cell]));
    }

    // Anchor: the first segment resolves through its binding.
    let head = engine.arena.cell_at(series, first);
    let mut current = match head.value {
        Value::Word(w) | Value::GetWord(w) => get_var(engine, &w)?,
        // A literal anchor (rare, but paths can be built programmatically).
        _ => head,
    };

    let mut at = first + 1;
    while at < len {
        if current.value.is_function_like() {
            if matches!(action, PathAction::Set(_)) {
                return Err(raise(engine, ErrKind::BadSetPath, &[path_cell]));
            }
            return Ok(PathOutcome::Func { func: current, refine_at: at });
        }
        let selector = resolve_selector(engine, series, at)?;
        let is_last = at + 1 == len;
        if is_last {
            if let PathAction::Set(value) = action {
                store_segment(engine, &path_cell, &current, &selector, value)?;
                return Ok(PathOutcome::Stored);
            }
        }
        current = select_segment(engine, &current, &selector)?;
        at += 1;
    }

    if current.value.is_function_like() {
        if matches!(action, PathAction::Set(_)) {
            return Err(raise(engine, ErrKind::BadSetPath, &[path_cell]));
        }
        return Ok(PathOutcome::Func { func: current, refine_at: len });
    }
    Ok(PathOutcome::Value(current))
}

/// Turn one segment into a selector value.
fn resolve_selector(engine: &mut Engine, series: SeriesId, at: usize) -> Eval<Cell> {
    let seg = engine.arena.cell_at(series, at);
    match seg.value {
        Value::GetWord(w) => get_var(engine, &w),
        Value::Paren(r) => {
            let slot = engine.push_slot();
            let ran = crate::eval::do_block(engine, r.series, slot);
            let value = engine.slot(slot);
            engine.ds_truncate(slot.0);
            ran?;
            if value.is_thrown() {
                // Control flow has no meaning inside a selector.
                let path = Cell::new(Value::Paren(r));
                return Err(raise(engine, ErrKind::BadPath, &[path]));
            }
            Ok(value)
        }
        // Words, integers, and other literals select as themselves.
        _ => Ok(seg),
    }
}

/// Dispatch one read step on the current value's kind.
fn select_segment(engine: &mut Engine, current: &Cell, selector: &Cell) -> Eval<Cell> {
    match current.value {
        Value::Block(r) | Value::Paren(r) | Value::Path(r) | Value::SetPath(r)
        | Value::GetPath(r) | Value::LitPath(r) => match selector.value {
            Value::Integer(n) => Ok(pick_block(engine, r, n)),
            _ if selector.value.is_word_like() => {
                let sym = selector.value.word_sym().expect("word-like");
                match find_in_block(engine, r, sym) {
                    Some(found_at) => {
                        let next = engine.arena.cell_at(r.series, found_at + 1);
                        Ok(if next.is_end() { Cell::NONE } else { next })
                    }
                    None => Ok(Cell::NONE),
                }
            }
            _ => Err(bad_select(engine, current, selector)),
        },
        Value::Str(r) | Value::File(r) | Value::Email(r) | Value::Url(r) | Value::Tag(r) => {
            match selector.value {
                Value::Integer(n) => {
                    let index = r.index as i64 + n - 1;
                    if n < 1 || index < 0 {
                        return Ok(Cell::NONE);
                    }
                    Ok(engine
                        .arena
                        .char_at(r.series, index as usize)
                        .map(|ch| Cell::new(Value::Char(ch)))
                        .unwrap_or(Cell::NONE))
                }
                _ => Err(bad_select(engine, current, selector)),
            }
        }
        Value::Binary(r) => match selector.value {
            Value::Integer(n) => {
                let index = r.index as i64 + n - 1;
                if n < 1 || index < 0 {
                    return Ok(Cell::NONE);
                }
                Ok(engine
                    .arena
                    .bytes(r.series)
                    .get(index as usize)
                    .map(|b| Cell::new(Value::Integer(*b as i64)))
                    .unwrap_or(Cell::NONE))
            }
            _ => Err(bad_select(engine, current, selector)),
        },
        Value::Object(frame) | Value::Module(frame) | Value::ErrorVal(frame) => {
            let Some(sym) = selector.value.word_sym() else {
                return Err(bad_select(engine, current, selector));
            };
            match find_word(&engine.arena, &engine.symbols, frame, sym) {
                Some(slot) => Ok(engine.arena.cell_at(frame, slot as usize)),
                None => Err(bad_select(engine, current, selector)),
            }
        }
        _ => Err(bad_select(engine, current, selector)),
    }
}

/// Dispatch the final store step.
fn store_segment(
    engine: &mut Engine,
    path_cell: &Cell,
    current: &Cell,
    selector: &Cell,
    value: Cell,
) -> Eval<()> {
    match current.value {
        Value::Block(r) | Value::Paren(r) => match selector.value {
            Value::Integer(n) => {
                let index = r.index as i64 + n - 1;
                let len = engine.arena.get(r.series).len() as i64;
                if n < 1 || index < 0 || index >= len {
                    return Err(raise(engine, ErrKind::BadRange, &[*selector]));
                }
                engine
                    .arena
                    .set_cell(r.series, index as usize, value)
                    .map_err(|e| raise_series(engine, e))
            }
            _ if selector.value.is_word_like() => {
                let sym = selector.value.word_sym().expect("word-like");
                let Some(found_at) = find_in_block(engine, r, sym) else {
                    return Err(raise(engine, ErrKind::BadSetPath, &[*path_cell]));
                };
                if found_at + 1 >= engine.arena.get(r.series).len() {
                    return Err(raise(engine, ErrKind::BadSetPath, &[*path_cell]));
                }
                engine
                    .arena
                    .set_cell(r.series, found_at + 1, value)
                    .map_err(|e| raise_series(engine, e))
            }
            _ => Err(raise(engine, ErrKind::BadSetType, &[*selector])),
        },
        Value::Str(r) | Value::File(r) | Value::Email(r) | Value::Url(r) | Value::Tag(r) => {
            match (selector.value, value.value) {
                (Value::Integer(n), Value::Char(ch)) => {
                    let index = r.index as i64 + n - 1;
                    let len = engine.arena.get(r.series).len() as i64;
                    if n < 1 || index < 0 || index >= len {
                        return Err(raise(engine, ErrKind::BadRange, &[*selector]));
                    }
                    engine
                        .arena
                        .set_char(r.series, index as usize, ch)
                        .map_err(|e| raise_series(engine, e))
                }
                (Value::Integer(_), _) => Err(raise(engine, ErrKind::BadSetType, &[value])),
                _ => Err(raise(engine, ErrKind::BadSetType, &[*selector])),
            }
        }
        Value::Binary(r) => match (selector.value, value.value) {
            (Value::Integer(n), Value::Integer(byte)) => {
                let index = r.index as i64 + n - 1;
                let len = engine.arena.get(r.series).len() as i64;
                if n < 1 || index < 0 || index >= len {
                    return Err(raise(engine, ErrKind::BadRange, &[*selector]));
                }
                if !(0..=255).contains(&byte) {
                    return Err(raise(engine, ErrKind::TypeLimit, &[value]));
                }
                engine
                    .arena
                    .set_byte(r.series, index as usize, byte as u8)
                    .map_err(|e| raise_series(engine, e))
            }
            _ => Err(raise(engine, ErrKind::BadSetType, &[*selector])),
        },
        Value::Object(frame) | Value::Module(frame) | Value::ErrorVal(frame) => {
            let Some(sym) = selector.value.word_sym() else {
                return Err(raise(engine, ErrKind::BadSetType, &[*selector]));
            };
            let Some(slot) = find_word(&engine.arena, &engine.symbols, frame, sym) else {
                return Err(raise(engine, ErrKind::BadSetPath, &[*path_cell]));
            };
            if slot_word(&engine.arena, frame, slot).flags.contains(CellFlags::LOCK) {
                return Err(raise(engine, ErrKind::LockedWord, &[*selector]));
            }
            engine
                .arena
                .set_cell(frame, slot as usize, value)
                .map_err(|e| raise_series(engine, e))
        }
        _ => Err(raise(engine, ErrKind::BadSetPath, &[*path_cell])),
    }
}

/// 1-based pick; off-range picks are none, as everywhere else in the
/// series model.
fn pick_block(engine: &Engine, r: SeriesRef, n: i64) -> Cell {
    let index = r.index as i64 + n - 1;
    if n < 1 || index < 0 {
        return Cell::NONE;
    }
    let cell = engine.arena.cell_at(r.series, index as usize);
    if cell.is_end() { Cell::NONE } else { cell }
}

/// Find a word-valued element matching `sym`, returning its index.
fn find_in_block(engine: &Engine, r: SeriesRef, sym: crate::symbol::Sym) -> Option<usize> {
    let canon = engine.symbols.canon(sym);
    let len = engine.arena.get(r.series).len();
    for i in (r.index as usize)..len {
        let cell = engine.arena.cell_at(r.series, i);
        if let Some(s) = cell.value.word_sym() {
            if engine.symbols.canon(s) == canon {
                return Some(i);
            }
        }
    }
    None
}

fn bad_select(engine: &mut Engine, current: &Cell, selector: &Cell) -> crate::error::Raise {
    let kind_cell = Cell::new(Value::Datatype(current.value.kind()));
    let sel = match selector.value {
        Value::Word(w) => Cell::new(Value::Word(Word::unbound(w.sym))),
        _ => *selector,
    };
    raise(engine, ErrKind::BadPath, &[kind_cell, sel])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};

    fn eval(src: &str) -> Cell {
        let mut e = Engine::new(Config::default());
        e.eval_str(src).expect("evaluation failed")
    }

    fn eval_err(src: &str) -> (Engine, Cell) {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str(src).expect_err("expected an error");
        (e, err)
    }

    #[test]
    fn test_block_pick_by_integer() {
        assert_eq!(eval("b: [10 20 30] b/2").value, Value::Integer(20));
        assert_eq!(eval("b: [10 20 30] b/9").value, Value::NoneVal);
    }

    #[test]
    fn test_block_select_by_word() {
        assert_eq!(eval("b: [alpha 1 beta 2] b/beta").value, Value::Integer(2));
        assert_eq!(eval("b: [alpha 1] b/gamma").value, Value::NoneVal);
    }

    #[test]
    fn test_nested_path() {
        assert_eq!(eval("b: [inner [5 6]] b/inner/2").value, Value::Integer(6));
    }

    #[test]
    fn test_object_field_access_and_set() {
        assert_eq!(eval("o: make object! [a: 1] o/a").value, Value::Integer(1));
        // The set-path expression evaluates to the stored value.
        assert_eq!(eval("o: make object! [a: 1] o/a: 5").value, Value::Integer(5));
        assert_eq!(eval("o: make object! [a: 1] o/a: 5 o/a").value, Value::Integer(5));
    }

    #[test]
    fn test_missing_object_field_is_bad_path() {
        let (e, err) = eval_err("o: make object! [a: 1] o/b");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::BadPath));
    }

    #[test]
    fn test_set_path_into_block_by_index() {
        assert_eq!(eval("b: [1 2 3] b/2: 9 b/2").value, Value::Integer(9));
    }

    #[test]
    fn test_set_path_out_of_range() {
        let (e, err) = eval_err("b: [1 2 3] b/9: 0");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::BadRange));
    }

    #[test]
    fn test_string_pick_by_index() {
        assert_eq!(eval(r#"s: "abc" s/2"#).value, Value::Char('b'));
    }

    #[test]
    fn test_paren_segment_selects_dynamically() {
        assert_eq!(eval("b: [10 20 30] i: 3 b/(i)").value, Value::Integer(30));
    }

    #[test]
    fn test_get_word_segment_selects_by_value() {
        assert_eq!(eval("b: [10 20 30] i: 2 b/:i").value, Value::Integer(20));
    }

    #[test]
    fn test_path_into_function_uses_refinements() {
        // append/only treats the block as a single element.
        assert_eq!(
            eval("b: [1 2] append/only b [3 4] length? b").value,
            Value::Integer(3)
        );
        assert_eq!(eval("b: [1 2] append b [3 4] length? b").value, Value::Integer(4));
    }

    #[test]
    fn test_unknown_refinement() {
        let (e, err) = eval_err("append/sideways [1] 2");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::NoRefine));
    }

    #[test]
    fn test_integer_select_on_object_is_bad_path() {
        let (e, err) = eval_err("o: make object! [a: 1] o/3");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::BadPath));
    }
}
