//! Loop natives and the loop-control protocol
//!
//! Every variable-carrying loop follows one pattern: build a per-iteration
//! frame holding the loop variable(s), deep-copy the body, bind the copy to
//! the frame, then evaluate it repeatedly while storing fresh values into
//! the frame slots. The copy is what makes the variable local: the caller's
//! block is never rebound (a `repeat n 3 [n]` leaves any outer `n` alone).
//!
//! Loop control arrives as a thrown unset cell whose side data says break
//! or continue; [`classify`] consumes those, while returns, throws, quits,
//! and errors pass through untouched.

use crate::bind::{BindOpts, bind_block};
use crate::engine::{Engine, Slot};
use crate::error::{ErrKind, Eval, raise, raise_mem, raise_series};
use crate::eval::{ThrownInfo, ThrownKind, do_block};
use crate::frame::{append_frame, frame_words, make_frame};
use crate::natives::NativeCtx;
use crate::series::{SeriesClass, SeriesId};
use crate::symbol::Sym;
use crate::value::{
    Cell, CellFlags, Kind, ParamClass, SeriesRef, Typeset, TypedWord, Value,
};

/// What a finished body evaluation means for the enclosing loop.
pub enum LoopSignal {
    /// `break` (optionally with a value): store it and leave the loop.
    Breaks(Cell),
    /// `continue`: next iteration.
    Continues,
    /// Anything else, including non-thrown values and escapes the loop
    /// must not absorb.
    Propagate,
}

/// The shared classifier: only a thrown unset paired with break/continue
/// side data is a loop signal.
pub fn classify(engine: &mut Engine, result: &Cell) -> LoopSignal {
    if !result.is_thrown() {
        return LoopSignal::Propagate;
    }
    match engine.thrown {
        Some(ThrownInfo { kind: ThrownKind::Break, arg }) => {
            debug_assert_eq!(result.value.kind(), Kind::Unset);
            engine.thrown = None;
            LoopSignal::Breaks(arg)
        }
        Some(ThrownInfo { kind: ThrownKind::Continue, .. }) => {
            debug_assert_eq!(result.value.kind(), Kind::Unset);
            engine.thrown = None;
            LoopSignal::Continues
        }
        _ => LoopSignal::Propagate,
    }
}

/// A loop's private frame plus its rebound body copy. Both are managed and
/// guarded on the keep list while the loop runs.
struct LoopBody {
    frame: SeriesId,
    body: SeriesId,
    keep_mark: usize,
}

fn make_loop_body(engine: &mut Engine, vars: &[Sym], body: SeriesRef) -> Eval<LoopBody> {
    let frame = make_frame(&mut engine.arena, &mut engine.symbols, vars.len(), false)
        .map_err(|e| raise_mem(engine, e))?;
    for sym in vars {
        append_frame(
            &mut engine.arena,
            frame,
            TypedWord::new(*sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .map_err(|e| raise_mem(engine, e))?;
    }
    let copy = engine
        .arena
        .copy_block(body.series, body.index as usize, true)
        .map_err(|e| raise_series(engine, e))?;
    bind_block(engine, frame, copy, BindOpts::deep())?;

    engine.arena.manage_deep(frame);
    let words = frame_words(&engine.arena, frame);
    engine.arena.manage(words);
    engine.arena.manage_deep(copy);
    let keep_mark = engine.arena.keep_mark();
    engine.arena.keep_push(frame);
    engine.arena.keep_push(copy);
    Ok(LoopBody { frame, body: copy, keep_mark })
}

impl LoopBody {
    fn set_var(&self, engine: &mut Engine, slot: usize, value: Cell) -> Eval<()> {
        engine
            .arena
            .set_cell(self.frame, slot + 1, value)
            .map_err(|e| raise_series(engine, e))
    }

    fn finish(self, engine: &mut Engine) {
        engine.arena.keep_truncate(self.keep_mark);
    }
}

/// Extract loop variable symbols from a word or block-of-words argument.
fn loop_vars(engine: &mut Engine, spec: &Cell) -> Eval<Vec<Sym>> {
    match spec.value {
        Value::Word(w) | Value::LitWord(w) => Ok(vec![w.sym]),
        Value::Block(r) => {
            let mut vars = Vec::new();
            for cell in engine.arena.cells(r.series).to_vec() {
                match cell.value.word_sym() {
                    Some(sym) => vars.push(sym),
                    None => return Err(raise(engine, ErrKind::ExpectArg, &[cell])),
                }
            }
            if vars.is_empty() {
                return Err(raise(engine, ErrKind::ExpectArg, &[*spec]));
            }
            Ok(vars)
        }
        _ => Err(raise(engine, ErrKind::ExpectArg, &[*spec])),
    }
}

fn block_arg(engine: &mut Engine, cell: &Cell) -> Eval<SeriesRef> {
    match cell.value.series_ref() {
        Some(r) if cell.value.is_block_like() => Ok(r),
        _ => Err(raise(engine, ErrKind::ExpectArg, &[*cell])),
    }
}

/// One body run plus classification; `Ok(true)` means keep looping.
fn run_body(engine: &mut Engine, body: SeriesId, out: Slot) -> Eval<bool> {
    do_block(engine, body, out)?;
    let result = engine.slot(out);
    match classify(engine, &result) {
        LoopSignal::Breaks(v) => {
            engine.set_slot(out, v.stored());
            Ok(false)
        }
        LoopSignal::Continues => {
            engine.set_slot(out, Cell::UNSET);
            Ok(true)
        }
        LoopSignal::Propagate => Ok(!result.is_thrown()),
    }
}

// ----- natives ----------------------------------------------------------

/// `loop count body` - run the body a fixed number of times.
pub fn native_loop(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let count = ctx.int_arg(engine, 1)?;
    let body = block_arg(engine, &ctx.arg(engine, 2))?;
    engine.set_slot(ctx.out, Cell::UNSET);
    for _ in 0..count {
        if !run_body(engine, body.series, ctx.out)? {
            return Ok(());
        }
    }
    Ok(())
}

/// `forever body`.
pub fn native_forever(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = block_arg(engine, &ctx.arg(engine, 1))?;
    engine.set_slot(ctx.out, Cell::UNSET);
    loop {
        if !run_body(engine, body.series, ctx.out)? {
            return Ok(());
        }
    }
}

/// `while cond body` - condition block first, body while truthy.
pub fn native_while(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let cond = block_arg(engine, &ctx.arg(engine, 1))?;
    let body = block_arg(engine, &ctx.arg(engine, 2))?;
    let test = engine.push_slot();
    let mut result = Ok(());
    loop {
        match do_block(engine, cond.series, test) {
            Ok(()) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        let c = engine.slot(test);
        if c.is_thrown() {
            // Control flow in the condition block governs the loop too.
            match classify(engine, &c) {
                LoopSignal::Breaks(v) => engine.set_slot(ctx.out, v.stored()),
                LoopSignal::Continues => continue,
                LoopSignal::Propagate => engine.set_slot(ctx.out, c),
            }
            break;
        }
        if c.value.kind() == Kind::Unset {
            result = Err(raise(engine, ErrKind::NeedValue, &[ctx.arg(engine, 1)]));
            break;
        }
        if !c.truthy() {
            break;
        }
        match run_body(engine, body.series, ctx.out) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    engine.ds_truncate(test.0);
    result
}

/// `until body` - repeat until the body's value is truthy.
pub fn native_until(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = block_arg(engine, &ctx.arg(engine, 1))?;
    loop {
        do_block(engine, body.series, ctx.out)?;
        let result = engine.slot(ctx.out);
        match classify(engine, &result) {
            LoopSignal::Breaks(v) => {
                engine.set_slot(ctx.out, v.stored());
                return Ok(());
            }
            LoopSignal::Continues => continue,
            LoopSignal::Propagate => {
                if result.is_thrown() {
                    return Ok(());
                }
            }
        }
        if result.value.kind() == Kind::Unset {
            return Err(raise(engine, ErrKind::NeedValue, &[ctx.arg(engine, 1)]));
        }
        if result.truthy() {
            return Ok(());
        }
    }
}

/// `repeat 'word count body` - integer loop from 1, variable is local.
pub fn native_repeat(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let vars = loop_vars(engine, &ctx.arg(engine, 1))?;
    let count = ctx.int_arg(engine, 2)?;
    let body = block_arg(engine, &ctx.arg(engine, 3))?;
    let lb = make_loop_body(engine, &vars, body)?;
    engine.set_slot(ctx.out, Cell::UNSET);
    let mut result = Ok(());
    for n in 1..=count {
        if let Err(e) = lb.set_var(engine, 0, Cell::new(Value::Integer(n))) {
            result = Err(e);
            break;
        }
        match run_body(engine, lb.body, ctx.out) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    lb.finish(engine);
    result
}

/// `for 'word start end bump body` - stepped integer loop, inclusive end.
pub fn native_for(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let vars = loop_vars(engine, &ctx.arg(engine, 1))?;
    let start = ctx.int_arg(engine, 2)?;
    let end = ctx.int_arg(engine, 3)?;
    let bump = ctx.int_arg(engine, 4)?;
    let body = block_arg(engine, &ctx.arg(engine, 5))?;
    if bump == 0 {
        return Err(raise(engine, ErrKind::BadRange, &[ctx.arg(engine, 4)]));
    }
    let lb = make_loop_body(engine, &vars, body)?;
    engine.set_slot(ctx.out, Cell::UNSET);
    let mut n = start;
    let mut result = Ok(());
    while (bump > 0 && n <= end) || (bump < 0 && n >= end) {
        if let Err(e) = lb.set_var(engine, 0, Cell::new(Value::Integer(n))) {
            result = Err(e);
            break;
        }
        match run_body(engine, lb.body, ctx.out) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        match n.checked_add(bump) {
            Some(next) => n = next,
            None => break,
        }
    }
    lb.finish(engine);
    result
}

/// Pull the element at `index` out of any series kind, as a cell.
fn element_at(engine: &Engine, data: &Cell, index: usize) -> Option<Cell> {
    let r = data.value.series_ref()?;
    let at = r.index as usize + index;
    if data.value.is_block_like() {
        let cell = engine.arena.cell_at(r.series, at);
        if cell.is_end() { None } else { Some(cell) }
    } else if data.value.kind() == Kind::Binary {
        engine.arena.bytes(r.series).get(at).map(|b| Cell::new(Value::Integer(*b as i64)))
    } else {
        engine.arena.char_at(r.series, at).map(|ch| Cell::new(Value::Char(ch)))
    }
}

fn series_len(engine: &Engine, data: &Cell) -> usize {
    match data.value.series_ref() {
        Some(r) => engine.arena.get(r.series).len().saturating_sub(r.index as usize),
        None => 0,
    }
}

/// `foreach 'word data body` - walk a series, binding one or more
/// variables per step.
pub fn native_foreach(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let vars = loop_vars(engine, &ctx.arg(engine, 1))?;
    let data = ctx.arg(engine, 2);
    if data.value.series_ref().is_none() {
        return Err(raise(engine, ErrKind::ExpectArg, &[data]));
    }
    let body = block_arg(engine, &ctx.arg(engine, 3))?;
    let lb = make_loop_body(engine, &vars, body)?;
    engine.set_slot(ctx.out, Cell::UNSET);
    let mut at = 0;
    let mut result = Ok(());
    'outer: while at < series_len(engine, &data) {
        for (v, _) in vars.iter().enumerate() {
            let value = element_at(engine, &data, at + v).unwrap_or(Cell::NONE);
            if let Err(e) = lb.set_var(engine, v, value) {
                result = Err(e);
                break 'outer;
            }
        }
        at += vars.len();
        match run_body(engine, lb.body, ctx.out) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    lb.finish(engine);
    result
}

/// `remove-each 'word data body` - keep walking, removing the elements
/// whose body evaluates truthy. Compacts in place.
pub fn native_remove_each(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let vars = loop_vars(engine, &ctx.arg(engine, 1))?;
    let data = ctx.arg(engine, 2);
    let data_ref = block_arg(engine, &data)?;
    let body = block_arg(engine, &ctx.arg(engine, 3))?;
    let lb = make_loop_body(engine, &vars, body)?;
    let test = engine.push_slot();
    let mut at = data_ref.index as usize;
    let mut result = Ok(());
    'outer: while at < engine.arena.get(data_ref.series).len() {
        for (v, _) in vars.iter().enumerate() {
            let cell = engine.arena.cell_at(data_ref.series, at + v);
            let value = if cell.is_end() { Cell::NONE } else { cell };
            if let Err(e) = lb.set_var(engine, v, value) {
                result = Err(e);
                break 'outer;
            }
        }
        match do_block(engine, lb.body, test) {
            Ok(()) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        let verdict = engine.slot(test);
        match classify(engine, &verdict) {
            LoopSignal::Breaks(v) => {
                engine.set_slot(ctx.out, v.stored());
                engine.ds_truncate(test.0);
                lb.finish(engine);
                return result;
            }
            LoopSignal::Continues => {
                at += vars.len();
                continue;
            }
            LoopSignal::Propagate => {
                if verdict.is_thrown() {
                    engine.set_slot(ctx.out, verdict);
                    break;
                }
            }
        }
        if verdict.truthy() {
            if let Err(e) = engine
                .arena
                .remove_cells(data_ref.series, at, vars.len())
                .map_err(|e| raise_series(engine, e))
            {
                result = Err(e);
                break;
            }
        } else {
            at += vars.len();
        }
    }
    engine.ds_truncate(test.0);
    lb.finish(engine);
    if result.is_ok() && !engine.slot(ctx.out).is_thrown() {
        engine.set_slot(ctx.out, data);
    }
    result
}

/// `map-each 'word data body` - collect non-unset body results into a
/// fresh block.
pub fn native_map_each(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let vars = loop_vars(engine, &ctx.arg(engine, 1))?;
    let data = ctx.arg(engine, 2);
    if data.value.series_ref().is_none() {
        return Err(raise(engine, ErrKind::ExpectArg, &[data]));
    }
    let body = block_arg(engine, &ctx.arg(engine, 3))?;
    let lb = make_loop_body(engine, &vars, body)?;
    let acc = match engine.arena.make(SeriesClass::Cells, 8) {
        Ok(acc) => acc,
        Err(e) => {
            lb.finish(engine);
            return Err(raise_mem(engine, e));
        }
    };
    let keep = engine.arena.keep_mark();
    engine.arena.keep_push(acc);
    let slot = engine.push_slot();
    let mut at = 0;
    let mut result = Ok(());
    let mut broke = false;
    'outer: while at < series_len(engine, &data) {
        for (v, _) in vars.iter().enumerate() {
            let value = element_at(engine, &data, at + v).unwrap_or(Cell::NONE);
            if let Err(e) = lb.set_var(engine, v, value) {
                result = Err(e);
                break 'outer;
            }
        }
        at += vars.len();
        match do_block(engine, lb.body, slot) {
            Ok(()) => {}
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        let produced = engine.slot(slot);
        match classify(engine, &produced) {
            LoopSignal::Breaks(v) => {
                engine.set_slot(ctx.out, v.stored());
                broke = true;
                break;
            }
            LoopSignal::Continues => continue,
            LoopSignal::Propagate => {
                if produced.is_thrown() {
                    engine.set_slot(ctx.out, produced);
                    broke = true;
                    break;
                }
            }
        }
        if produced.value.kind() != Kind::Unset {
            if let Err(e) = engine
                .arena
                .push_cell(acc, produced)
                .map_err(|e| raise_series(engine, e))
            {
                result = Err(e);
                break;
            }
        }
    }
    engine.ds_truncate(slot.0);
    engine.arena.manage_deep(acc);
    engine.arena.keep_truncate(keep);
    lb.finish(engine);
    result?;
    if !broke {
        engine.set_slot(ctx.out, Cell::new(Value::Block(SeriesRef::head(acc))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;

    fn eval(src: &str) -> Cell {
        let mut e = Engine::new(Config::default());
        e.eval_str(src).expect("evaluation failed")
    }

    #[test]
    fn test_loop_and_repeat() {
        assert_eq!(eval("n: 0 loop 4 [n: n + 1] n").value, Value::Integer(4));
        assert_eq!(eval("repeat i 3 [i]").value, Value::Integer(3));
    }

    #[test]
    fn test_loop_variable_is_local() {
        // The body copy binds to the loop frame; the outer word is untouched.
        assert_eq!(eval("repeat n 3 [n] value? 'n").value, Value::Logic(false));
    }

    #[test]
    fn test_foreach_yields_last_body_value() {
        assert_eq!(eval("foreach i [1 2 3] [i]").value, Value::Integer(3));
        assert_eq!(eval("sum: 0 foreach i [1 2 3] [sum: sum + i] sum").value, Value::Integer(6));
    }

    #[test]
    fn test_foreach_multiple_variables() {
        assert_eq!(
            eval("acc: 0 foreach [k v] [a 1 b 20] [acc: acc + v] acc").value,
            Value::Integer(21)
        );
    }

    #[test]
    fn test_foreach_over_string() {
        assert_eq!(eval(r#"last-ch: none foreach c "xyz" [last-ch: c] last-ch"#).value, Value::Char('z'));
    }

    #[test]
    fn test_for_counts_with_bump() {
        assert_eq!(eval("acc: 0 for i 1 10 2 [acc: acc + i] acc").value, Value::Integer(25));
        assert_eq!(eval("acc: 0 for i 3 1 -1 [acc: acc + i] acc").value, Value::Integer(6));
    }

    #[test]
    fn test_while_and_until() {
        assert_eq!(eval("n: 0 while [n < 5] [n: n + 1] n").value, Value::Integer(5));
        assert_eq!(eval("n: 0 until [n: n + 1 n >= 3] n").value, Value::Integer(3));
    }

    #[test]
    fn test_break_with_value() {
        assert_eq!(eval("loop 10 [break/return 7]").value, Value::Integer(7));
        assert_eq!(eval("foreach i [1 2 3] [if i = 2 [break] i]").value, Value::Unset);
    }

    #[test]
    fn test_continue_skips() {
        assert_eq!(
            eval("acc: 0 foreach i [1 2 3 4] [if i = 2 [continue] acc: acc + i] acc").value,
            Value::Integer(8)
        );
    }

    #[test]
    fn test_break_crosses_function_boundaries() {
        // A thrown break unwinds through an intervening call until a loop
        // absorbs it.
        assert_eq!(eval("f: func [] [break/return 9] loop 10 [f]").value, Value::Integer(9));
    }

    #[test]
    fn test_remove_each_compacts_in_place() {
        assert_eq!(
            eval("b: [1 2 3 4 5] remove-each i b [i > 3] length? b").value,
            Value::Integer(3)
        );
        assert_eq!(eval("b: [1 2 3] remove-each i b [i = 2] b/2").value, Value::Integer(3));
    }

    #[test]
    fn test_map_each_collects_non_unset() {
        assert_eq!(eval("length? map-each i [1 2 3] [i * 2]").value, Value::Integer(3));
        assert_eq!(eval("first map-each i [1 2 3] [i * 2]").value, Value::Integer(2));
        // Unset results fall out of the collection.
        assert_eq!(
            eval("length? map-each i [1 2 3] [either i = 2 [i] [()]]").value,
            Value::Integer(1)
        );
    }

    #[test]
    fn test_nested_loops_break_inner_only() {
        assert_eq!(
            eval("acc: 0 foreach i [1 2] [foreach j [10 20] [if j = 20 [break] acc: acc + j]] acc").value,
            Value::Integer(20)
        );
    }
}
