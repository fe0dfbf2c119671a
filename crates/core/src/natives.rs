//! The native function table
//!
//! Natives are Rust functions exposed as `native!` (prefix) and `action!`
//! (infix-capable operator) values. The table below is position-stable: the
//! boot block lists one `name: [spec]` pair per entry in the same order,
//! and boot cross-checks the names while it builds the word lists from the
//! scanned specs. Adding a native means adding it in both places.
//!
//! Natives read their arguments from the data-stack range the evaluator
//! bound for them and write one result into the caller's output slot.

use crate::bind::{BindOpts, CollectOpts, bind_block, bind_relative, collect_words};
use crate::engine::{Engine, Slot};
use crate::error::{ErrKind, Eval, raise, raise_mem, raise_series};
use crate::eval::{CallFrame, ThrownKind, apply_func, do_block, eval_next, throw_from, trap};
use crate::frame::{find_word, frame_words, get_var, set_var, slot_word};
use crate::series::{SeriesClass, SeriesFlags, SeriesId};
use crate::symbol::Sym;
use crate::value::{
    Cell, CellFlags, FuncRef, Kind, ParamClass, SeriesRef, Typeset, TypedWord, Value, Word,
};

/// Per-invocation context handed to a native: where its arguments sit and
/// where its result goes.
#[derive(Debug, Clone, Copy)]
pub struct NativeCtx {
    pub out: Slot,
    pub args: Slot,
    pub nargs: u32,
    pub label: Option<Sym>,
}

impl NativeCtx {
    /// Argument `n`, 1-based, as bound by the evaluator.
    pub fn arg(&self, engine: &Engine, n: usize) -> Cell {
        debug_assert!(n >= 1 && n <= self.nargs as usize);
        engine.ds[self.args.0 + n - 1]
    }

    /// Refinement slot truthiness.
    pub fn has(&self, engine: &Engine, n: usize) -> bool {
        self.arg(engine, n).truthy()
    }

    pub fn int_arg(&self, engine: &mut Engine, n: usize) -> Eval<i64> {
        match self.arg(engine, n).value {
            Value::Integer(v) => Ok(v),
            _ => {
                let got = self.arg(engine, n);
                Err(raise(engine, ErrKind::ExpectArg, &[got]))
            }
        }
    }

    fn ok(&self, engine: &mut Engine, value: Cell) -> Eval<()> {
        engine.set_slot(self.out, value.stored());
        Ok(())
    }
}

pub type NativeFn = fn(&mut Engine, &NativeCtx) -> Eval<()>;

pub struct NativeDef {
    pub name: &'static str,
    pub infix: bool,
    pub func: NativeFn,
}

const fn native(name: &'static str, func: NativeFn) -> NativeDef {
    NativeDef { name, infix: false, func }
}

const fn op(name: &'static str, func: NativeFn) -> NativeDef {
    NativeDef { name, infix: true, func }
}

/// Dispatch entry used by the evaluator.
pub fn run_native(engine: &mut Engine, id: u32, call: &CallFrame) -> Eval<()> {
    let ctx = NativeCtx {
        out: call.out,
        args: call.args,
        nargs: call.nargs,
        label: call.label,
    };
    let def = &NATIVES[id as usize];
    (def.func)(engine, &ctx)
}

// ----- shared helpers ---------------------------------------------------

fn string_cell(engine: &mut Engine, text: &str) -> Eval<Cell> {
    let id = engine
        .arena
        .make(SeriesClass::Bytes, text.len())
        .map_err(|e| raise_mem(engine, e))?;
    for ch in text.chars() {
        engine.arena.push_char(id, ch).map_err(|e| raise_series(engine, e))?;
    }
    engine.arena.manage(id);
    Ok(Cell::new(Value::Str(SeriesRef::head(id))))
}

fn expect_block(engine: &mut Engine, cell: &Cell) -> Eval<SeriesRef> {
    match cell.value {
        Value::Block(r) | Value::Paren(r) => Ok(r),
        _ => Err(raise(engine, ErrKind::ExpectArg, &[*cell])),
    }
}

fn series_of(engine: &mut Engine, cell: &Cell) -> Eval<SeriesRef> {
    match cell.value.series_ref() {
        Some(r) => Ok(r),
        None => Err(raise(engine, ErrKind::ExpectArg, &[*cell])),
    }
}

/// Loose equality: numbers compare across kinds, words and strings fold
/// case, blocks compare element-wise, frames by identity.
pub fn loose_eq(engine: &Engine, a: &Cell, b: &Cell) -> bool {
    use Value::*;
    match (a.value, b.value) {
        (Integer(x), Integer(y)) => x == y,
        (Money(x), Money(y)) => x == y,
        (Money(x), Integer(y)) | (Integer(y), Money(x)) => x == y * 1000,
        _ if numeric(&a.value).is_some() && numeric(&b.value).is_some() => {
            numeric(&a.value) == numeric(&b.value)
        }
        (Logic(x), Logic(y)) => x == y,
        (NoneVal, NoneVal) | (Unset, Unset) => true,
        (Char(x), Char(y)) => x.eq_ignore_ascii_case(&y),
        (Datatype(x), Datatype(y)) => x == y,
        (Typeset(x), Typeset(y)) => x == y,
        (Pair(ax, ay), Pair(bx, by)) => ax == bx && ay == by,
        (Tuple(x), Tuple(y)) => x == y,
        (Time(x), Time(y)) => x == y,
        (Date(x), Date(y)) => x == y,
        (Object(x), Object(y)) | (Module(x), Module(y)) | (ErrorVal(x), ErrorVal(y)) => x == y,
        (Handle(x), Handle(y)) => x == y,
        _ => {
            if let (Some(x), Some(y)) = (a.value.word_sym(), b.value.word_sym()) {
                return a.value.kind() == b.value.kind() && engine.symbols.case_eq(x, y);
            }
            if a.value.is_string_like() && b.value.is_string_like() {
                let (ra, rb) = (
                    a.value.series_ref().expect("string-like"),
                    b.value.series_ref().expect("string-like"),
                );
                let ta: String = engine.arena.text(ra.series).chars().skip(ra.index as usize).collect();
                let tb: String = engine.arena.text(rb.series).chars().skip(rb.index as usize).collect();
                return ta.to_lowercase() == tb.to_lowercase();
            }
            if a.value.kind() == Kind::Binary && b.value.kind() == Kind::Binary {
                let (ra, rb) = (
                    a.value.series_ref().expect("binary"),
                    b.value.series_ref().expect("binary"),
                );
                return engine.arena.bytes(ra.series)[ra.index as usize..]
                    == engine.arena.bytes(rb.series)[rb.index as usize..];
            }
            if a.value.is_block_like() && b.value.is_block_like() {
                if a.value.kind() != b.value.kind() {
                    return false;
                }
                let (ra, rb) = (
                    a.value.series_ref().expect("block-like"),
                    b.value.series_ref().expect("block-like"),
                );
                let la = engine.arena.get(ra.series).len() - ra.index as usize;
                let lb = engine.arena.get(rb.series).len() - rb.index as usize;
                if la != lb {
                    return false;
                }
                for i in 0..la {
                    let ea = engine.arena.cell_at(ra.series, ra.index as usize + i);
                    let eb = engine.arena.cell_at(rb.series, rb.index as usize + i);
                    if !loose_eq(engine, &ea, &eb) {
                        return false;
                    }
                }
                return true;
            }
            false
        }
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(n) => Some(*n as f64),
        Value::Decimal(f) | Value::Percent(f) => Some(*f),
        Value::Money(m) => Some(*m as f64 / 1000.0),
        _ => None,
    }
}

fn compare(engine: &mut Engine, ctx: &NativeCtx) -> Eval<std::cmp::Ordering> {
    let a = ctx.arg(engine, 1);
    let b = ctx.arg(engine, 2);
    if let (Some(x), Some(y)) = (numeric(&a.value), numeric(&b.value)) {
        return match x.partial_cmp(&y) {
            Some(ord) => Ok(ord),
            None => Err(raise(engine, ErrKind::ExpectArg, &[b])),
        };
    }
    match (a.value, b.value) {
        (Value::Char(x), Value::Char(y)) => {
            Ok(x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase()))
        }
        (Value::Time(x), Value::Time(y)) => Ok(x.cmp(&y)),
        _ if a.value.is_string_like() && b.value.is_string_like() => {
            let ra = a.value.series_ref().expect("string-like");
            let rb = b.value.series_ref().expect("string-like");
            let ta: String =
                engine.arena.text(ra.series).chars().skip(ra.index as usize).collect();
            let tb: String =
                engine.arena.text(rb.series).chars().skip(rb.index as usize).collect();
            Ok(ta.to_lowercase().cmp(&tb.to_lowercase()))
        }
        _ => Err(raise(engine, ErrKind::ExpectArg, &[b])),
    }
}

// ----- control natives --------------------------------------------------

fn n_do(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    match value.value {
        Value::Block(r) | Value::Paren(r) => {
            let out = ctx.out;
            do_block_at(engine, r, out)
        }
        Value::Str(r) => {
            let source: String = engine.arena.text(r.series).chars().skip(r.index as usize).collect();
            let block = crate::scan::scan_source(engine, &source)
                .map_err(|e| {
                    let line = Cell::new(Value::Integer(e.line as i64));
                    raise(engine, ErrKind::Syntax, &[Cell::NONE, line])
                })?;
            let lib = engine.lib;
            let user = engine.user;
            bind_block(engine, lib, block, BindOpts::deep())?;
            bind_block(engine, user, block, BindOpts::deep_set())?;
            engine.arena.manage_deep(block);
            do_block(engine, block, ctx.out)
        }
        Value::Native(_) | Value::Action(_) | Value::Function(_) | Value::Closure(_) => {
            Err(raise(engine, ErrKind::NotDone, &[value]))
        }
        _ => ctx.ok(engine, value),
    }
}

/// `do` over a block position: evaluate from the ref's index.
fn do_block_at(engine: &mut Engine, r: SeriesRef, out: Slot) -> Eval<()> {
    engine.set_slot(out, Cell::UNSET);
    let mut index = r.index as usize;
    while index < engine.arena.get(r.series).len() {
        match eval_next(engine, r.series, index, out, true)? {
            Some(next) => {
                if engine.slot(out).is_thrown() {
                    return Ok(());
                }
                index = next;
            }
            None => break,
        }
    }
    Ok(())
}

fn n_if(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let cond = ctx.arg(engine, 1);
    let body = expect_block(engine, &ctx.arg(engine, 2))?;
    if cond.truthy() {
        do_block(engine, body.series, ctx.out)
    } else {
        ctx.ok(engine, Cell::NONE)
    }
}

fn n_either(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let cond = ctx.arg(engine, 1);
    let which = if cond.truthy() { 2 } else { 3 };
    let body = expect_block(engine, &ctx.arg(engine, which))?;
    do_block(engine, body.series, ctx.out)
}

fn n_all(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let block = expect_block(engine, &ctx.arg(engine, 1))?;
    engine.set_slot(ctx.out, Cell::TRUE);
    let mut index = block.index as usize;
    let slot = engine.push_slot();
    let mut result = Ok(());
    while index < engine.arena.get(block.series).len() {
        match eval_next(engine, block.series, index, slot, true) {
            Ok(Some(next)) => {
                let v = engine.slot(slot);
                if v.is_thrown() {
                    engine.set_slot(ctx.out, v);
                    break;
                }
                // Unset results (side-effect expressions) do not decide.
                if v.value.kind() != Kind::Unset {
                    if !v.truthy() {
                        engine.set_slot(ctx.out, Cell::NONE);
                        break;
                    }
                    engine.set_slot(ctx.out, v.stored());
                }
                index = next;
            }
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    engine.ds_truncate(slot.0);
    result
}

fn n_any(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let block = expect_block(engine, &ctx.arg(engine, 1))?;
    engine.set_slot(ctx.out, Cell::NONE);
    let mut index = block.index as usize;
    let slot = engine.push_slot();
    let mut result = Ok(());
    while index < engine.arena.get(block.series).len() {
        match eval_next(engine, block.series, index, slot, true) {
            Ok(Some(next)) => {
                let v = engine.slot(slot);
                if v.is_thrown() {
                    engine.set_slot(ctx.out, v);
                    break;
                }
                if v.value.kind() != Kind::Unset && v.truthy() {
                    engine.set_slot(ctx.out, v.stored());
                    break;
                }
                index = next;
            }
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    engine.ds_truncate(slot.0);
    result
}

fn n_attempt(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = expect_block(engine, &ctx.arg(engine, 1))?;
    // Halt-unaware: a halt passes through attempt untouched.
    match trap(engine, false, |engine| {
        let slot = engine.push_slot();
        do_block(engine, body.series, slot)?;
        let v = engine.slot(slot);
        engine.ds_truncate(slot.0);
        Ok(v)
    })? {
        Ok(v) => ctx.ok(engine, v),
        Err(_) => ctx.ok(engine, Cell::NONE),
    }
}

fn n_try(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = expect_block(engine, &ctx.arg(engine, 1))?;
    match trap(engine, false, |engine| {
        let slot = engine.push_slot();
        do_block(engine, body.series, slot)?;
        let v = engine.slot(slot);
        engine.ds_truncate(slot.0);
        Ok(v)
    })? {
        Ok(v) => ctx.ok(engine, v),
        Err(err) => ctx.ok(engine, err),
    }
}

fn n_catch(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = expect_block(engine, &ctx.arg(engine, 1))?;
    let named = ctx.has(engine, 2);
    let name = if named { ctx.arg(engine, 3).value.word_sym() } else { None };
    do_block(engine, body.series, ctx.out)?;
    let result = engine.slot(ctx.out);
    if result.is_thrown() {
        if let Some(crate::eval::ThrownInfo { kind: ThrownKind::Throw(thrown_name), arg }) =
            engine.thrown
        {
            let matches = match (name, thrown_name) {
                (None, None) => true,
                (Some(want), Some(got)) => engine.symbols.case_eq(want, got),
                _ => false,
            };
            if matches {
                engine.thrown = None;
                engine.set_slot(ctx.out, arg.stored());
            }
        }
    }
    Ok(())
}

fn n_throw(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let name = if ctx.has(engine, 2) { ctx.arg(engine, 3).value.word_sym() } else { None };
    throw_from(engine, ThrownKind::Throw(name), value, ctx.out);
    Ok(())
}

fn n_return(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    throw_from(engine, ThrownKind::Return, value, ctx.out);
    Ok(())
}

fn n_exit(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    throw_from(engine, ThrownKind::Exit, Cell::UNSET, ctx.out);
    Ok(())
}

fn n_break(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = if ctx.has(engine, 1) { ctx.arg(engine, 2) } else { Cell::UNSET };
    throw_from(engine, ThrownKind::Break, value, ctx.out);
    Ok(())
}

fn n_continue(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    throw_from(engine, ThrownKind::Continue, Cell::UNSET, ctx.out);
    Ok(())
}

fn n_quit(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = if ctx.has(engine, 1) { ctx.arg(engine, 2) } else { Cell::UNSET };
    throw_from(engine, ThrownKind::Quit, value, ctx.out);
    Ok(())
}

fn n_halt(engine: &mut Engine, _ctx: &NativeCtx) -> Eval<()> {
    Err(raise(engine, ErrKind::Halt, &[]))
}

// ----- definition natives -----------------------------------------------

/// Parse a function spec block into a word-list series of typed words.
pub fn make_params(engine: &mut Engine, spec: SeriesRef) -> Eval<SeriesId> {
    let words = engine
        .arena
        .make(SeriesClass::Cells, 4)
        .map_err(|e| raise_mem(engine, e))?;
    let no_name = engine.symbols.intern(crate::frame::NO_NAME);
    let mut head = Cell::new(Value::TypedWord(TypedWord::new(
        no_name,
        ParamClass::Normal,
        Typeset::any_type(),
    )));
    head.flags |= CellFlags::HIDE;
    engine.arena.push_cell(words, head).map_err(|e| raise_series(engine, e))?;

    let len = engine.arena.get(spec.series).len();
    for i in (spec.index as usize)..len {
        let cell = engine.arena.cell_at(spec.series, i);
        let (sym, class, types) = match cell.value {
            // Doc strings and type annotations for the whole function.
            Value::Str(_) => continue,
            Value::Word(w) => (w.sym, ParamClass::Normal, Typeset::any_value()),
            Value::LitWord(w) => (w.sym, ParamClass::Literal, Typeset::any_type()),
            Value::GetWord(w) => (w.sym, ParamClass::Get, Typeset::any_type()),
            Value::Refinement(w) => (
                w.sym,
                ParamClass::Refinement,
                Typeset::of(&[Kind::Logic, Kind::NoneVal]),
            ),
            Value::SetWord(_) => {
                // Reserved parameter form; refused until it means something.
                return Err(raise(engine, ErrKind::NotDone, &[cell]));
            }
            Value::Block(r) => {
                // Typeset for the preceding parameter.
                let tail = engine.arena.get(words).len();
                if tail <= 1 {
                    return Err(raise(engine, ErrKind::ExpectArg, &[cell]));
                }
                let types = resolve_typeset(engine, r)?;
                let mut prev = engine.arena.cell_at(words, tail - 1);
                if let Value::TypedWord(mut tw) = prev.value {
                    tw.types = types;
                    prev.value = Value::TypedWord(tw);
                    engine
                        .arena
                        .set_cell(words, tail - 1, prev)
                        .map_err(|e| raise_series(engine, e))?;
                }
                continue;
            }
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[cell])),
        };
        // Duplicate names make argument frames ambiguous.
        for existing in engine.arena.cells(words).to_vec() {
            if let Value::TypedWord(tw) = existing.value {
                if engine.symbols.case_eq(tw.sym, sym) {
                    let dup = Cell::new(Value::Word(Word::unbound(sym)));
                    return Err(raise(engine, ErrKind::DupVars, &[dup]));
                }
            }
        }
        engine
            .arena
            .push_cell(words, Cell::new(Value::TypedWord(TypedWord::new(sym, class, types))))
            .map_err(|e| raise_series(engine, e))?;
    }
    Ok(words)
}

/// Resolve a spec type block (`[integer! any-block!]`) to a typeset.
fn resolve_typeset(engine: &mut Engine, r: SeriesRef) -> Eval<Typeset> {
    let mut types = Typeset::EMPTY;
    let len = engine.arena.get(r.series).len();
    for i in (r.index as usize)..len {
        let cell = engine.arena.cell_at(r.series, i);
        let Some(sym) = cell.value.word_sym() else {
            return Err(raise(engine, ErrKind::ExpectArg, &[cell]));
        };
        let name = engine.symbols.name(sym).to_string();
        if let Some(kind) = Kind::from_name(&name) {
            types = types.with(kind);
        } else if let Some(group) = Typeset::group_by_name(&name) {
            types = types.union(group);
        } else {
            return Err(raise(engine, ErrKind::ExpectArg, &[cell]));
        }
    }
    Ok(types)
}

/// Build a function or closure value from spec and body blocks. Both are
/// deep-copied so later edits to the originals cannot warp the function.
pub fn make_function(
    engine: &mut Engine,
    spec: SeriesRef,
    body: SeriesRef,
    closure: bool,
) -> Eval<Cell> {
    let spec_copy = engine
        .arena
        .copy_block(spec.series, spec.index as usize, true)
        .map_err(|e| raise_series(engine, e))?;
    let words = make_params(engine, SeriesRef::head(spec_copy))?;
    let body_copy = engine
        .arena
        .copy_block(body.series, body.index as usize, true)
        .map_err(|e| raise_series(engine, e))?;
    bind_relative(engine, words, body_copy)?;
    engine.arena.manage_deep(spec_copy);
    engine.arena.manage(words);
    engine.arena.manage_deep(body_copy);
    let f = FuncRef { spec: spec_copy, words, body: body_copy };
    Ok(Cell::new(if closure { Value::Closure(f) } else { Value::Function(f) }))
}

fn n_func(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let spec = expect_block(engine, &ctx.arg(engine, 1))?;
    let body = expect_block(engine, &ctx.arg(engine, 2))?;
    let f = make_function(engine, spec, body, false)?;
    ctx.ok(engine, f)
}

fn n_closure(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let spec = expect_block(engine, &ctx.arg(engine, 1))?;
    let body = expect_block(engine, &ctx.arg(engine, 2))?;
    let f = make_function(engine, spec, body, true)?;
    ctx.ok(engine, f)
}

fn n_does(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let body = expect_block(engine, &ctx.arg(engine, 1))?;
    let empty = SeriesRef::head(engine.empty_block);
    let f = make_function(engine, empty, body, false)?;
    ctx.ok(engine, f)
}

/// Build an object frame from collected set-words, bind the spec to it,
/// and run the spec so the slots take their values.
pub fn make_object(engine: &mut Engine, parent: Option<SeriesId>, spec: SeriesRef) -> Eval<Cell> {
    let parent_words = parent.map(|p| frame_words(&engine.arena, p));
    let words = collect_words(
        engine,
        parent_words,
        &[spec.series],
        CollectOpts { set_words_only: true, with_self: true, ..CollectOpts::default() },
    )?;
    let nslots = engine.arena.get(words).len();
    let frame = engine
        .arena
        .make(SeriesClass::Cells, nslots)
        .map_err(|e| raise_mem(engine, e))?;
    engine
        .arena
        .push_cell(frame, Cell::new(Value::FrameHead { words, spec: None }))
        .map_err(|e| raise_series(engine, e))?;
    for slot in 1..nslots {
        // Inherited slots start from the parent's current values.
        let initial = match parent {
            Some(p) if slot < engine.arena.get(p).len() => engine.arena.cell_at(p, slot),
            _ => Cell::UNSET,
        };
        engine.arena.push_cell(frame, initial).map_err(|e| raise_series(engine, e))?;
    }

    bind_block(engine, frame, spec.series, BindOpts::deep())?;
    engine.arena.manage_deep(frame);
    engine.arena.manage(words);
    let keep = engine.arena.keep_mark();
    engine.arena.keep_push(frame);

    let slot = engine.push_slot();
    let ran = do_block(engine, spec.series, slot);
    let body_result = engine.slot(slot);
    engine.ds_truncate(slot.0);
    engine.arena.keep_truncate(keep);
    ran?;
    if body_result.is_thrown() {
        // The escape wins over the half-built object.
        return Ok(body_result);
    }
    Ok(Cell::new(Value::Object(frame)))
}

fn n_make(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let target = ctx.arg(engine, 1);
    let spec = ctx.arg(engine, 2);
    match (target.value, spec.value) {
        (Value::Datatype(Kind::Object), Value::Block(r)) => {
            let obj = make_object(engine, None, r)?;
            ctx.ok(engine, obj)
        }
        (Value::Object(parent), Value::Block(r)) => {
            let obj = make_object(engine, Some(parent), r)?;
            ctx.ok(engine, obj)
        }
        (Value::Datatype(Kind::Block), Value::Integer(n)) => {
            let id = engine
                .arena
                .make(SeriesClass::Cells, n.max(0) as usize)
                .map_err(|e| raise_mem(engine, e))?;
            engine.arena.manage(id);
            ctx.ok(engine, Cell::new(Value::Block(SeriesRef::head(id))))
        }
        (Value::Datatype(Kind::Str), Value::Integer(n)) => {
            let id = engine
                .arena
                .make(SeriesClass::Bytes, n.max(0) as usize)
                .map_err(|e| raise_mem(engine, e))?;
            engine.arena.manage(id);
            ctx.ok(engine, Cell::new(Value::Str(SeriesRef::head(id))))
        }
        (Value::Datatype(Kind::Binary), Value::Integer(n)) => {
            let id = engine
                .arena
                .make(SeriesClass::Bytes, n.max(0) as usize)
                .map_err(|e| raise_mem(engine, e))?;
            engine.arena.manage(id);
            ctx.ok(engine, Cell::new(Value::Binary(SeriesRef::head(id))))
        }
        (Value::Datatype(Kind::ErrorVal), _) => {
            let text = crate::mold::form_cell(engine, &spec);
            let msg = string_cell(engine, &text)?;
            let err = crate::error::make_error(engine, ErrKind::User, &[msg])
                .map_err(|e| raise_mem(engine, e))?;
            ctx.ok(engine, err)
        }
        _ => Err(raise(engine, ErrKind::ExpectArg, &[target, spec])),
    }
}

fn n_bind(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let block = expect_block(engine, &ctx.arg(engine, 1))?;
    let context = ctx.arg(engine, 2);
    let frame = match context.value {
        Value::Object(f) | Value::Module(f) | Value::ErrorVal(f) => f,
        _ => match context.value.word() {
            Some(w) if w.binding.is_some() && w.index >= 0 => w.binding.expect("checked"),
            _ => return Err(raise(engine, ErrKind::NotDefined, &[context])),
        },
    };
    let target = if ctx.has(engine, 3) {
        let copy = engine
            .arena
            .copy_block(block.series, block.index as usize, true)
            .map_err(|e| raise_series(engine, e))?;
        engine.arena.manage_deep(copy);
        SeriesRef::head(copy)
    } else {
        block
    };
    bind_block(engine, frame, target.series, BindOpts::deep())?;
    ctx.ok(engine, Cell::new(Value::Block(target)))
}

fn n_in(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let object = ctx.arg(engine, 1);
    let word = ctx.arg(engine, 2);
    let frame = match object.value {
        Value::Object(f) | Value::Module(f) | Value::ErrorVal(f) => f,
        _ => return Err(raise(engine, ErrKind::ExpectArg, &[object])),
    };
    let Some(sym) = word.value.word_sym() else {
        return Err(raise(engine, ErrKind::ExpectArg, &[word]));
    };
    match find_word(&engine.arena, &engine.symbols, frame, sym) {
        Some(slot) => ctx.ok(engine, Cell::new(Value::Word(Word::bound(sym, frame, slot)))),
        None => ctx.ok(engine, Cell::NONE),
    }
}

fn n_set(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let target = ctx.arg(engine, 1);
    let value = ctx.arg(engine, 2);
    match target.value {
        Value::Block(r) => {
            let words: Vec<Cell> = engine.arena.cells(r.series)[r.index as usize..].to_vec();
            for (i, wcell) in words.iter().enumerate() {
                let Some(w) = wcell.value.word() else {
                    return Err(raise(engine, ErrKind::ExpectArg, &[*wcell]));
                };
                let v = match value.value {
                    Value::Block(vr) => {
                        let cell = engine.arena.cell_at(vr.series, vr.index as usize + i);
                        if cell.is_end() { Cell::NONE } else { cell }
                    }
                    _ => value,
                };
                set_var(engine, &w.clone(), v)?;
            }
        }
        _ => {
            let Some(w) = target.value.word() else {
                return Err(raise(engine, ErrKind::ExpectArg, &[target]));
            };
            set_var(engine, &w.clone(), value)?;
        }
    }
    ctx.ok(engine, value)
}

fn n_get(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let target = ctx.arg(engine, 1);
    let Some(w) = target.value.word() else {
        return Err(raise(engine, ErrKind::ExpectArg, &[target]));
    };
    let v = get_var(engine, &w.clone())?;
    ctx.ok(engine, v)
}

fn n_value_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let target = ctx.arg(engine, 1);
    let Some(w) = target.value.word() else {
        return Err(raise(engine, ErrKind::ExpectArg, &[target]));
    };
    let defined = match get_var(engine, &w.clone()) {
        Ok(v) => v.value.kind() != Kind::Unset,
        Err(_) => false,
    };
    ctx.ok(engine, Cell::new(Value::Logic(defined)))
}

fn n_unset(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let target = ctx.arg(engine, 1);
    match target.value {
        Value::Block(r) => {
            let words: Vec<Cell> = engine.arena.cells(r.series)[r.index as usize..].to_vec();
            for wcell in words {
                if let Some(w) = wcell.value.word() {
                    set_var(engine, &w.clone(), Cell::UNSET)?;
                }
            }
        }
        _ => {
            let Some(w) = target.value.word() else {
                return Err(raise(engine, ErrKind::ExpectArg, &[target]));
            };
            set_var(engine, &w.clone(), Cell::UNSET)?;
        }
    }
    ctx.ok(engine, Cell::UNSET)
}

fn n_type_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let kind = ctx.arg(engine, 1).value.kind();
    ctx.ok(engine, Cell::new(Value::Datatype(kind)))
}

fn protect_value(engine: &mut Engine, value: &Cell, deep: bool, on: bool) -> Eval<()> {
    if let Some(w) = value.value.word() {
        let Some(frame) = w.binding else {
            return Err(raise(engine, ErrKind::NotDefined, &[*value]));
        };
        if w.index <= 0 {
            return Err(raise(engine, ErrKind::ExpectArg, &[*value]));
        }
        let words = frame_words(&engine.arena, frame);
        let mut entry = slot_word(&engine.arena, frame, w.index);
        entry.flags.set(CellFlags::LOCK, on);
        engine
            .arena
            .set_cell(words, w.index as usize, entry)
            .map_err(|e| raise_series(engine, e))?;
        return Ok(());
    }
    let id = match value.value {
        Value::Object(f) | Value::Module(f) | Value::ErrorVal(f) => f,
        _ => match value.value.series_ref() {
            Some(r) => r.series,
            None => return Err(raise(engine, ErrKind::ExpectArg, &[*value])),
        },
    };
    engine.arena.get_mut(id).flags.set(SeriesFlags::PROTECTED, on);
    if deep && engine.arena.get(id).is_cell_array() {
        for i in 0..engine.arena.get(id).len() {
            let cell = engine.arena.cell_at(id, i);
            if cell.value.series_ref().is_some() || matches!(cell.value, Value::Object(_)) {
                protect_value(engine, &cell, true, on)?;
            }
        }
    }
    Ok(())
}

fn n_protect(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let deep = ctx.has(engine, 2);
    protect_value(engine, &value, deep, true)?;
    ctx.ok(engine, value)
}

fn n_unprotect(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let deep = ctx.has(engine, 2);
    protect_value(engine, &value, deep, false)?;
    ctx.ok(engine, value)
}

// ----- series natives ---------------------------------------------------

fn nth_cell(engine: &Engine, cell: &Cell, n: i64) -> Option<Cell> {
    let r = cell.value.series_ref()?;
    let index = r.index as i64 + n - 1;
    if n < 1 || index < 0 {
        return None;
    }
    if cell.value.is_block_like() {
        let c = engine.arena.cell_at(r.series, index as usize);
        if c.is_end() { None } else { Some(c) }
    } else if cell.value.kind() == Kind::Binary {
        engine
            .arena
            .bytes(r.series)
            .get(index as usize)
            .map(|b| Cell::new(Value::Integer(*b as i64)))
    } else {
        engine.arena.char_at(r.series, index as usize).map(|ch| Cell::new(Value::Char(ch)))
    }
}

fn series_remaining(engine: &Engine, r: SeriesRef) -> i64 {
    engine.arena.get(r.series).len() as i64 - r.index as i64
}

fn n_first(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    match nth_cell(engine, &s, 1) {
        Some(v) => ctx.ok(engine, v),
        None => Err(raise(engine, ErrKind::PastEnd, &[s])),
    }
}

fn n_last(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    let n = series_remaining(engine, r);
    match nth_cell(engine, &s, n) {
        Some(v) => ctx.ok(engine, v),
        None => Err(raise(engine, ErrKind::PastEnd, &[s])),
    }
}

/// Shift a series value's index, clamped to [head, tail].
fn shifted(engine: &Engine, cell: &Cell, by: i64) -> Cell {
    let mut out = *cell;
    if let Some(r) = out.value.series_ref_mut() {
        let len = engine.arena.get(r.series).len() as i64;
        let index = (r.index as i64 + by).clamp(0, len);
        r.index = index as u32;
    }
    out
}

fn n_next(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    series_of(engine, &s)?;
    let v = shifted(engine, &s, 1);
    ctx.ok(engine, v)
}

fn n_back(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    series_of(engine, &s)?;
    let v = shifted(engine, &s, -1);
    ctx.ok(engine, v)
}

fn n_skip(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let by = ctx.int_arg(engine, 2)?;
    series_of(engine, &s)?;
    let v = shifted(engine, &s, by);
    ctx.ok(engine, v)
}

fn n_head(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let mut s = ctx.arg(engine, 1);
    series_of(engine, &s)?;
    if let Some(r) = s.value.series_ref_mut() {
        r.index = 0;
    }
    ctx.ok(engine, s)
}

fn n_tail(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let mut s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    let len = engine.arena.get(r.series).len() as u32;
    if let Some(r) = s.value.series_ref_mut() {
        r.index = len;
    }
    ctx.ok(engine, s)
}

fn n_head_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    ctx.ok(engine, Cell::new(Value::Logic(r.index == 0)))
}

fn n_tail_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    let at_tail = r.index as usize >= engine.arena.get(r.series).len();
    ctx.ok(engine, Cell::new(Value::Logic(at_tail)))
}

fn n_index_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    ctx.ok(engine, Cell::new(Value::Integer(r.index as i64 + 1)))
}

fn n_length_q(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    ctx.ok(engine, Cell::new(Value::Integer(series_remaining(engine, r).max(0))))
}

fn n_pick(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let n = ctx.int_arg(engine, 2)?;
    series_of(engine, &s)?;
    let v = nth_cell(engine, &s, n).unwrap_or(Cell::NONE);
    ctx.ok(engine, v)
}

fn n_poke(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let n = ctx.int_arg(engine, 2)?;
    let value = ctx.arg(engine, 3);
    let r = series_of(engine, &s)?;
    let index = r.index as i64 + n - 1;
    if n < 1 || index < 0 || index >= engine.arena.get(r.series).len() as i64 {
        return Err(raise(engine, ErrKind::BadRange, &[ctx.arg(engine, 2)]));
    }
    if s.value.is_block_like() {
        engine
            .arena
            .set_cell(r.series, index as usize, value)
            .map_err(|e| raise_series(engine, e))?;
    } else if s.value.kind() == Kind::Binary {
        let Value::Integer(byte) = value.value else {
            return Err(raise(engine, ErrKind::ExpectArg, &[value]));
        };
        if !(0..=255).contains(&byte) {
            return Err(raise(engine, ErrKind::TypeLimit, &[value]));
        }
        engine
            .arena
            .set_byte(r.series, index as usize, byte as u8)
            .map_err(|e| raise_series(engine, e))?;
    } else {
        let Value::Char(ch) = value.value else {
            return Err(raise(engine, ErrKind::ExpectArg, &[value]));
        };
        engine
            .arena
            .set_char(r.series, index as usize, ch)
            .map_err(|e| raise_series(engine, e))?;
    }
    ctx.ok(engine, value)
}

/// Insert `value` into a series at `at`; blocks splice unless `only`.
/// Returns how many elements went in.
fn insert_at(
    engine: &mut Engine,
    target: &Cell,
    at: usize,
    value: &Cell,
    only: bool,
) -> Eval<usize> {
    let r = target.value.series_ref().expect("checked by caller");
    if target.value.is_block_like() {
        if value.value.is_block_like() && !only {
            let vr = value.value.series_ref().expect("block-like");
            let cells: Vec<Cell> =
                engine.arena.cells(vr.series)[vr.index as usize..].to_vec();
            engine
                .arena
                .insert_cells(r.series, at, &cells)
                .map_err(|e| raise_series(engine, e))?;
            Ok(cells.len())
        } else {
            engine
                .arena
                .insert_cells(r.series, at, &[*value])
                .map_err(|e| raise_series(engine, e))?;
            Ok(1)
        }
    } else if target.value.kind() == Kind::Binary {
        match value.value {
            Value::Integer(b) if (0..=255).contains(&b) => {
                engine.arena.expand(r.series, at, 1).map_err(|e| raise_series(engine, e))?;
                engine.arena.set_byte(r.series, at, b as u8).map_err(|e| raise_series(engine, e))?;
                Ok(1)
            }
            Value::Binary(vr) => {
                let bytes: Vec<u8> = engine.arena.bytes(vr.series)[vr.index as usize..].to_vec();
                engine
                    .arena
                    .expand(r.series, at, bytes.len())
                    .map_err(|e| raise_series(engine, e))?;
                for (i, b) in bytes.iter().enumerate() {
                    engine
                        .arena
                        .set_byte(r.series, at + i, *b)
                        .map_err(|e| raise_series(engine, e))?;
                }
                Ok(bytes.len())
            }
            _ => Err(raise(engine, ErrKind::ExpectArg, &[*value])),
        }
    } else {
        // String targets take chars and stringish values by formed text.
        let text = match value.value {
            Value::Char(ch) => ch.to_string(),
            _ => crate::mold::form_cell(engine, value),
        };
        let chars: Vec<char> = text.chars().collect();
        engine
            .arena
            .expand(r.series, at, chars.len())
            .map_err(|e| raise_series(engine, e))?;
        for (i, ch) in chars.iter().enumerate() {
            engine
                .arena
                .set_char(r.series, at + i, *ch)
                .map_err(|e| raise_series(engine, e))?;
        }
        Ok(chars.len())
    }
}

fn n_append(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let value = ctx.arg(engine, 2);
    let only = ctx.has(engine, 3);
    let r = series_of(engine, &s)?;
    let tail = engine.arena.get(r.series).len();
    insert_at(engine, &s, tail, &value, only)?;
    let mut head = s;
    if let Some(hr) = head.value.series_ref_mut() {
        hr.index = 0;
    }
    ctx.ok(engine, head)
}

fn n_insert(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let value = ctx.arg(engine, 2);
    let only = ctx.has(engine, 3);
    let r = series_of(engine, &s)?;
    let at = (r.index as usize).min(engine.arena.get(r.series).len());
    let n = insert_at(engine, &s, at, &value, only)?;
    let v = shifted(engine, &s, n as i64);
    ctx.ok(engine, v)
}

fn n_copy(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let deep = ctx.has(engine, 2);
    let part = if ctx.has(engine, 3) { Some(ctx.int_arg(engine, 4)?) } else { None };
    let r = series_of(engine, &s)?;
    if s.value.is_block_like() {
        let copy = engine
            .arena
            .copy_block(r.series, r.index as usize, deep)
            .map_err(|e| raise_series(engine, e))?;
        if let Some(limit) = part {
            let keep = limit.max(0) as usize;
            let len = engine.arena.get(copy).len();
            if keep < len {
                engine
                    .arena
                    .remove_cells(copy, keep, len - keep)
                    .map_err(|e| raise_series(engine, e))?;
            }
        }
        engine.arena.manage_deep(copy);
        let mut out = s;
        if let Some(or) = out.value.series_ref_mut() {
            or.series = copy;
            or.index = 0;
        }
        ctx.ok(engine, out)
    } else if s.value.kind() == Kind::Binary {
        let bytes: Vec<u8> = engine.arena.bytes(r.series)[r.index as usize..].to_vec();
        let take = part.map(|p| (p.max(0) as usize).min(bytes.len())).unwrap_or(bytes.len());
        let id = engine
            .arena
            .make(SeriesClass::Bytes, take)
            .map_err(|e| raise_mem(engine, e))?;
        for b in &bytes[..take] {
            engine.arena.push_byte(id, *b).map_err(|e| raise_series(engine, e))?;
        }
        engine.arena.manage(id);
        let mut out = s;
        if let Some(or) = out.value.series_ref_mut() {
            or.series = id;
            or.index = 0;
        }
        ctx.ok(engine, out)
    } else {
        let text: Vec<char> =
            engine.arena.text(r.series).chars().skip(r.index as usize).collect();
        let take = part.map(|p| (p.max(0) as usize).min(text.len())).unwrap_or(text.len());
        let id = engine
            .arena
            .make(SeriesClass::Bytes, take)
            .map_err(|e| raise_mem(engine, e))?;
        for ch in &text[..take] {
            engine.arena.push_char(id, *ch).map_err(|e| raise_series(engine, e))?;
        }
        engine.arena.manage(id);
        let mut out = s;
        if let Some(or) = out.value.series_ref_mut() {
            or.series = id;
            or.index = 0;
        }
        ctx.ok(engine, out)
    }
}

fn n_clear(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let r = series_of(engine, &s)?;
    engine
        .arena
        .truncate_at(r.series, r.index as usize)
        .map_err(|e| raise_series(engine, e))?;
    ctx.ok(engine, s)
}

fn n_select(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let s = ctx.arg(engine, 1);
    let wanted = ctx.arg(engine, 2);
    let r = series_of(engine, &s)?;
    if !s.value.is_block_like() {
        return Err(raise(engine, ErrKind::ExpectArg, &[s]));
    }
    let len = engine.arena.get(r.series).len();
    let mut i = r.index as usize;
    while i < len {
        let cell = engine.arena.cell_at(r.series, i);
        if loose_eq(engine, &cell, &wanted) {
            let next = engine.arena.cell_at(r.series, i + 1);
            let v = if next.is_end() { Cell::NONE } else { next };
            return ctx.ok(engine, v);
        }
        i += 1;
    }
    ctx.ok(engine, Cell::NONE)
}

// ----- output and reflection --------------------------------------------

fn n_print(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let text = match value.value {
        // Blocks print reduced and space-joined.
        Value::Block(r) => {
            let mut parts = Vec::new();
            let slot = engine.push_slot();
            let mut index = r.index as usize;
            while index < engine.arena.get(r.series).len() {
                match eval_next(engine, r.series, index, slot, true)? {
                    Some(next) => {
                        let v = engine.slot(slot);
                        if v.is_thrown() {
                            engine.set_slot(ctx.out, v);
                            engine.ds_truncate(slot.0);
                            return Ok(());
                        }
                        parts.push(crate::mold::form_cell(engine, &v));
                        index = next;
                    }
                    None => break,
                }
            }
            engine.ds_truncate(slot.0);
            parts.join(" ")
        }
        _ => crate::mold::form_cell(engine, &value),
    };
    println!("{text}");
    ctx.ok(engine, Cell::UNSET)
}

fn n_probe(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    println!("{}", crate::mold::mold_cell(engine, &value));
    ctx.ok(engine, value)
}

fn n_mold(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let text = crate::mold::mold_cell(engine, &value);
    let cell = string_cell(engine, &text)?;
    ctx.ok(engine, cell)
}

fn n_form(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let text = crate::mold::form_cell(engine, &value);
    let cell = string_cell(engine, &text)?;
    ctx.ok(engine, cell)
}

fn n_reduce(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let Value::Block(r) = value.value else {
        return ctx.ok(engine, value);
    };
    let acc = engine
        .arena
        .make(SeriesClass::Cells, 8)
        .map_err(|e| raise_mem(engine, e))?;
    let keep = engine.arena.keep_mark();
    engine.arena.keep_push(acc);
    let slot = engine.push_slot();
    let mut index = r.index as usize;
    let mut result = Ok(());
    while index < engine.arena.get(r.series).len() {
        match eval_next(engine, r.series, index, slot, true) {
            Ok(Some(next)) => {
                let v = engine.slot(slot);
                if v.is_thrown() {
                    engine.set_slot(ctx.out, v);
                    engine.ds_truncate(slot.0);
                    engine.arena.keep_truncate(keep);
                    return Ok(());
                }
                if let Err(e) =
                    engine.arena.push_cell(acc, v).map_err(|e| raise_series(engine, e))
                {
                    result = Err(e);
                    break;
                }
                index = next;
            }
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    engine.ds_truncate(slot.0);
    engine.arena.manage_deep(acc);
    engine.arena.keep_truncate(keep);
    result?;
    ctx.ok(engine, Cell::new(Value::Block(SeriesRef::head(acc))))
}

fn compose_into(
    engine: &mut Engine,
    src: SeriesRef,
    deep: bool,
    acc: SeriesId,
) -> Eval<()> {
    let len = engine.arena.get(src.series).len();
    for i in (src.index as usize)..len {
        let cell = engine.arena.cell_at(src.series, i);
        match cell.value {
            Value::Paren(p) => {
                let slot = engine.push_slot();
                let ran = do_block(engine, p.series, slot);
                let v = engine.slot(slot);
                engine.ds_truncate(slot.0);
                ran?;
                if v.is_thrown() {
                    return Err(raise(engine, ErrKind::BadPath, &[cell]));
                }
                match v.value {
                    // Block results splice; everything else inserts.
                    Value::Block(vr) => {
                        let cells: Vec<Cell> =
                            engine.arena.cells(vr.series)[vr.index as usize..].to_vec();
                        for c in cells {
                            engine.arena.push_cell(acc, c).map_err(|e| raise_series(engine, e))?;
                        }
                    }
                    Value::Unset => {}
                    _ => {
                        engine.arena.push_cell(acc, v).map_err(|e| raise_series(engine, e))?;
                    }
                }
            }
            Value::Block(inner) if deep => {
                let nested = engine
                    .arena
                    .make(SeriesClass::Cells, 4)
                    .map_err(|e| raise_mem(engine, e))?;
                let keep = engine.arena.keep_mark();
                engine.arena.keep_push(nested);
                let ran = compose_into(engine, inner, true, nested);
                engine.arena.keep_truncate(keep);
                ran?;
                let mut copy = cell;
                if let Some(cr) = copy.value.series_ref_mut() {
                    cr.series = nested;
                    cr.index = 0;
                }
                engine.arena.push_cell(acc, copy).map_err(|e| raise_series(engine, e))?;
            }
            _ => {
                engine.arena.push_cell(acc, cell).map_err(|e| raise_series(engine, e))?;
            }
        }
    }
    Ok(())
}

fn n_compose(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let value = ctx.arg(engine, 1);
    let deep = ctx.has(engine, 2);
    let r = expect_block(engine, &value)?;
    let acc = engine
        .arena
        .make(SeriesClass::Cells, 8)
        .map_err(|e| raise_mem(engine, e))?;
    let keep = engine.arena.keep_mark();
    engine.arena.keep_push(acc);
    let ran = compose_into(engine, r, deep, acc);
    engine.arena.manage_deep(acc);
    engine.arena.keep_truncate(keep);
    ran?;
    ctx.ok(engine, Cell::new(Value::Block(SeriesRef::head(acc))))
}

fn n_apply(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let func = ctx.arg(engine, 1);
    let block = expect_block(engine, &ctx.arg(engine, 2))?;
    let only = ctx.has(engine, 3);
    if !func.value.is_function_like() {
        return Err(raise(engine, ErrKind::ExpectArg, &[func]));
    }
    let vals: Vec<Cell> = if only {
        engine.arena.cells(block.series)[block.index as usize..].to_vec()
    } else {
        // Reduce the whole block first; arity errors come after any side
        // effects the reduction performs.
        let mut acc = Vec::new();
        let slot = engine.push_slot();
        let mut index = block.index as usize;
        loop {
            if index >= engine.arena.get(block.series).len() {
                break;
            }
            match eval_next(engine, block.series, index, slot, true) {
                Ok(Some(next)) => {
                    let v = engine.slot(slot);
                    if v.is_thrown() {
                        engine.set_slot(ctx.out, v);
                        engine.ds_truncate(slot.0);
                        return Ok(());
                    }
                    acc.push(v.stored());
                    index = next;
                }
                Ok(None) => break,
                Err(e) => {
                    engine.ds_truncate(slot.0);
                    return Err(e);
                }
            }
        }
        engine.ds_truncate(slot.0);
        acc
    };
    apply_func(engine, func, &vals, ctx.out)
}

fn n_recycle(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let stats = engine.recycle_now();
    ctx.ok(engine, Cell::new(Value::Integer(stats.freed as i64)))
}

fn n_stats(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let pool = engine.arena.pools.stats();
    let live = engine.arena.live_count();
    let acc = engine
        .arena
        .make(SeriesClass::Cells, 3)
        .map_err(|e| raise_mem(engine, e))?;
    for n in [live as i64, pool.buffers_made as i64, pool.system_bytes as i64] {
        engine
            .arena
            .push_cell(acc, Cell::new(Value::Integer(n)))
            .map_err(|e| raise_series(engine, e))?;
    }
    engine.arena.manage(acc);
    ctx.ok(engine, Cell::new(Value::Block(SeriesRef::head(acc))))
}

// ----- math and comparison actions --------------------------------------

fn n_not(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let v = ctx.arg(engine, 1);
    ctx.ok(engine, Cell::new(Value::Logic(!v.truthy())))
}

fn n_negate(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let v = ctx.arg(engine, 1);
    let negated = match v.value {
        Value::Integer(n) => Value::Integer(
            n.checked_neg().ok_or(()).map_err(|_| raise(engine, ErrKind::Range, &[v]))?,
        ),
        Value::Decimal(f) => Value::Decimal(-f),
        Value::Percent(f) => Value::Percent(-f),
        Value::Money(m) => Value::Money(-m),
        Value::Pair(x, y) => Value::Pair(-x, -y),
        Value::Time(t) => Value::Time(-t),
        _ => return Err(raise(engine, ErrKind::ExpectArg, &[v])),
    };
    ctx.ok(engine, Cell::new(negated))
}

#[derive(Clone, Copy, PartialEq)]
enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

fn arith(engine: &mut Engine, ctx: &NativeCtx, op: MathOp) -> Eval<()> {
    use Value::*;
    let a = ctx.arg(engine, 1);
    let b = ctx.arg(engine, 2);
    let result = match (a.value, b.value) {
        (Integer(x), Integer(y)) => int_math(engine, x, y, op, &b)?,
        (Money(x), Money(y)) => match op {
            MathOp::Add => Money(x + y),
            MathOp::Sub => Money(x - y),
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        (Money(x), Integer(y)) => match op {
            MathOp::Add => Money(x + y * 1000),
            MathOp::Sub => Money(x - y * 1000),
            MathOp::Mul => Money(x * y),
            MathOp::Div => {
                if y == 0 {
                    return Err(raise(engine, ErrKind::Range, &[b]));
                }
                Money(x / y)
            }
            MathOp::Rem => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        (Pair(ax, ay), Pair(bx, by)) => match op {
            MathOp::Add => Pair(ax + bx, ay + by),
            MathOp::Sub => Pair(ax - bx, ay - by),
            MathOp::Mul => Pair(ax * bx, ay * by),
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        (Pair(ax, ay), Integer(n)) => match op {
            MathOp::Mul => Pair(ax * n as i32, ay * n as i32),
            MathOp::Add => Pair(ax + n as i32, ay + n as i32),
            MathOp::Sub => Pair(ax - n as i32, ay - n as i32),
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        (Char(c), Integer(n)) => match op {
            MathOp::Add => char::from_u32((c as i64 + n) as u32)
                .map(Char)
                .ok_or(())
                .map_err(|_| raise(engine, ErrKind::Range, &[b]))?,
            MathOp::Sub => char::from_u32((c as i64 - n) as u32)
                .map(Char)
                .ok_or(())
                .map_err(|_| raise(engine, ErrKind::Range, &[b]))?,
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        (Time(x), Time(y)) => match op {
            MathOp::Add => Time(x + y),
            MathOp::Sub => Time(x - y),
            _ => return Err(raise(engine, ErrKind::ExpectArg, &[b])),
        },
        _ => {
            let (Some(x), Some(y)) = (numeric(&a.value), numeric(&b.value)) else {
                return Err(raise(engine, ErrKind::ExpectArg, &[a, b]));
            };
            let f = match op {
                MathOp::Add => x + y,
                MathOp::Sub => x - y,
                MathOp::Mul => x * y,
                MathOp::Div => {
                    if y == 0.0 {
                        return Err(raise(engine, ErrKind::Range, &[b]));
                    }
                    x / y
                }
                MathOp::Rem => x % y,
            };
            if !f.is_finite() {
                return Err(raise(engine, ErrKind::Range, &[b]));
            }
            // Two percents stay a percent under + and -.
            if a.value.kind() == Kind::Percent
                && b.value.kind() == Kind::Percent
                && matches!(op, MathOp::Add | MathOp::Sub)
            {
                Percent(f)
            } else {
                Decimal(f)
            }
        }
    };
    ctx.ok(engine, Cell::new(result))
}

fn int_math(engine: &mut Engine, x: i64, y: i64, op: MathOp, b: &Cell) -> Eval<Value> {
    let checked = match op {
        MathOp::Add => x.checked_add(y),
        MathOp::Sub => x.checked_sub(y),
        MathOp::Mul => x.checked_mul(y),
        MathOp::Div => {
            if y == 0 {
                return Err(raise(engine, ErrKind::Range, &[*b]));
            }
            // Exact division stays integral; otherwise fall to decimal.
            if x % y == 0 {
                x.checked_div(y)
            } else {
                return Ok(Value::Decimal(x as f64 / y as f64));
            }
        }
        MathOp::Rem => {
            if y == 0 {
                return Err(raise(engine, ErrKind::Range, &[*b]));
            }
            x.checked_rem(y)
        }
    };
    match checked {
        Some(v) => Ok(Value::Integer(v)),
        None => Err(raise(engine, ErrKind::Range, &[*b])),
    }
}

fn n_add(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    arith(engine, ctx, MathOp::Add)
}

fn n_subtract(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    arith(engine, ctx, MathOp::Sub)
}

fn n_multiply(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    arith(engine, ctx, MathOp::Mul)
}

fn n_divide(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    arith(engine, ctx, MathOp::Div)
}

fn n_remainder(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    arith(engine, ctx, MathOp::Rem)
}

fn n_equal(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let a = ctx.arg(engine, 1);
    let b = ctx.arg(engine, 2);
    let eq = loose_eq(engine, &a, &b);
    ctx.ok(engine, Cell::new(Value::Logic(eq)))
}

fn n_not_equal(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let a = ctx.arg(engine, 1);
    let b = ctx.arg(engine, 2);
    let eq = loose_eq(engine, &a, &b);
    ctx.ok(engine, Cell::new(Value::Logic(!eq)))
}

fn n_lesser(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let ord = compare(engine, ctx)?;
    ctx.ok(engine, Cell::new(Value::Logic(ord == std::cmp::Ordering::Less)))
}

fn n_greater(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let ord = compare(engine, ctx)?;
    ctx.ok(engine, Cell::new(Value::Logic(ord == std::cmp::Ordering::Greater)))
}

fn n_lesser_eq(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let ord = compare(engine, ctx)?;
    ctx.ok(engine, Cell::new(Value::Logic(ord != std::cmp::Ordering::Greater)))
}

fn n_greater_eq(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    let ord = compare(engine, ctx)?;
    ctx.ok(engine, Cell::new(Value::Logic(ord != std::cmp::Ordering::Less)))
}

fn bit_logic(engine: &mut Engine, ctx: &NativeCtx, and: bool) -> Eval<()> {
    let a = ctx.arg(engine, 1);
    let b = ctx.arg(engine, 2);
    let result = match (a.value, b.value) {
        (Value::Logic(x), Value::Logic(y)) => Value::Logic(if and { x && y } else { x || y }),
        (Value::Integer(x), Value::Integer(y)) => Value::Integer(if and { x & y } else { x | y }),
        _ => return Err(raise(engine, ErrKind::ExpectArg, &[a, b])),
    };
    ctx.ok(engine, Cell::new(result))
}

fn n_and(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    bit_logic(engine, ctx, true)
}

fn n_or(engine: &mut Engine, ctx: &NativeCtx) -> Eval<()> {
    bit_logic(engine, ctx, false)
}

/// The table. Order is frozen against the boot block.
pub static NATIVES: &[NativeDef] = &[
    native("do", n_do),
    native("if", n_if),
    native("either", n_either),
    native("all", n_all),
    native("any", n_any),
    native("attempt", n_attempt),
    native("try", n_try),
    native("catch", n_catch),
    native("throw", n_throw),
    native("return", n_return),
    native("exit", n_exit),
    native("break", n_break),
    native("continue", n_continue),
    native("quit", n_quit),
    native("halt", n_halt),
    native("func", n_func),
    native("closure", n_closure),
    native("does", n_does),
    native("make", n_make),
    native("bind", n_bind),
    native("in", n_in),
    native("set", n_set),
    native("get", n_get),
    native("value?", n_value_q),
    native("unset", n_unset),
    native("type?", n_type_q),
    native("protect", n_protect),
    native("unprotect", n_unprotect),
    native("for", crate::loops::native_for),
    native("foreach", crate::loops::native_foreach),
    native("repeat", crate::loops::native_repeat),
    native("while", crate::loops::native_while),
    native("until", crate::loops::native_until),
    native("forever", crate::loops::native_forever),
    native("loop", crate::loops::native_loop),
    native("remove-each", crate::loops::native_remove_each),
    native("map-each", crate::loops::native_map_each),
    native("first", n_first),
    native("last", n_last),
    native("next", n_next),
    native("back", n_back),
    native("head", n_head),
    native("tail", n_tail),
    native("head?", n_head_q),
    native("tail?", n_tail_q),
    native("index?", n_index_q),
    native("length?", n_length_q),
    native("pick", n_pick),
    native("poke", n_poke),
    native("append", n_append),
    native("insert", n_insert),
    native("copy", n_copy),
    native("skip", n_skip),
    native("clear", n_clear),
    native("select", n_select),
    native("print", n_print),
    native("probe", n_probe),
    native("mold", n_mold),
    native("form", n_form),
    native("reduce", n_reduce),
    native("compose", n_compose),
    native("apply", n_apply),
    native("recycle", n_recycle),
    native("stats", n_stats),
    native("not", n_not),
    native("negate", n_negate),
    op("+", n_add),
    op("-", n_subtract),
    op("*", n_multiply),
    op("/", n_divide),
    op("//", n_remainder),
    op("=", n_equal),
    op("<>", n_not_equal),
    op("<", n_lesser),
    op(">", n_greater),
    op("<=", n_lesser_eq),
    op(">=", n_greater_eq),
    op("and", n_and),
    op("or", n_or),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;

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
    fn test_arithmetic() {
        assert_eq!(eval("3 + 4").value, Value::Integer(7));
        assert_eq!(eval("10 - 2 - 3").value, Value::Integer(5));
        assert_eq!(eval("6 / 2").value, Value::Integer(3));
        assert_eq!(eval("7 / 2").value, Value::Decimal(3.5));
        assert_eq!(eval("7 // 2").value, Value::Integer(1));
        assert_eq!(eval("1.5 * 2").value, Value::Decimal(3.0));
        assert_eq!(eval(r#"#"a" + 1"#).value, Value::Char('b'));
        assert_eq!(eval("$2.50 + $1").value, Value::Money(3500));
        assert_eq!(eval("1x2 + 3x4").value, Value::Pair(4, 6));
    }

    #[test]
    fn test_overflow_and_zero_divide_raise_range() {
        let (e, err) = eval_err("9223372036854775807 + 1");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::Range));
        let (e, err) = eval_err("1 / 0");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::Range));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 < 2").value, Value::Logic(true));
        assert_eq!(eval("2 <= 2").value, Value::Logic(true));
        assert_eq!(eval("3 > 4").value, Value::Logic(false));
        assert_eq!(eval("1 = 1.0").value, Value::Logic(true));
        assert_eq!(eval("1 <> 2").value, Value::Logic(true));
        assert_eq!(eval(r#""Abc" = "abc""#).value, Value::Logic(true));
        assert_eq!(eval("[1 [2]] = [1 [2]]").value, Value::Logic(true));
        assert_eq!(eval("'Word = 'word").value, Value::Logic(true));
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(eval("if 1 < 2 [99]").value, Value::Integer(99));
        assert_eq!(eval("if 1 > 2 [99]").value, Value::NoneVal);
        assert_eq!(eval("either false [1] [2]").value, Value::Integer(2));
        assert_eq!(eval("all [1 2 3]").value, Value::Integer(3));
        assert_eq!(eval("all [1 none 3]").value, Value::NoneVal);
        assert_eq!(eval("any [none false 7]").value, Value::Integer(7));
        assert_eq!(eval("any [none false]").value, Value::NoneVal);
    }

    #[test]
    fn test_functions_and_refinements() {
        assert_eq!(eval("f: func [a b] [a + b] f 2 3").value, Value::Integer(5));
        assert_eq!(
            eval("f: func [a /double] [either double [a * 2] [a]] f 5").value,
            Value::Integer(5)
        );
        assert_eq!(
            eval("f: func [a /double] [either double [a * 2] [a]] f/double 5").value,
            Value::Integer(10)
        );
    }

    #[test]
    fn test_refinement_arguments_follow_path_order() {
        let base = "f: func [a /with extra /scale factor] [
            either with [either scale [a + extra * factor] [a + extra]] [a]
        ] ";
        assert_eq!(eval(&format!("{base} f/with 1 10")).value, Value::Integer(11));
        // Out-of-order refinements replay onto their parameter slots, and
        // arguments are consumed in the order the path named them.
        assert_eq!(
            eval(&format!("{base} f/scale/with 1 3 10")).value,
            Value::Integer(33)
        );
        assert_eq!(
            eval(&format!("{base} f/with/scale 1 10 3")).value,
            Value::Integer(33)
        );
    }

    #[test]
    fn test_soft_quote_parameters() {
        // A lit-word parameter takes words literally but evaluates parens.
        assert_eq!(eval("f: func ['w] [w] f abc").value.kind(), Kind::Word);
        assert_eq!(eval("f: func ['w] [w] f (1 + 2)").value, Value::Integer(3));
    }

    #[test]
    fn test_hard_quote_parameters() {
        assert_eq!(eval("f: func [:w] [w] f (1 + 2)").value.kind(), Kind::Paren);
    }

    #[test]
    fn test_return_and_exit() {
        assert_eq!(eval("f: func [a] [return a + 1 99] f 1").value, Value::Integer(2));
        assert_eq!(eval("f: func [a] [if a [exit] 99] f true").value, Value::Unset);
    }

    #[test]
    fn test_catch_throw() {
        assert_eq!(eval("catch [throw 42 99]").value, Value::Integer(42));
        assert_eq!(eval("catch/name [throw/name 7 'tag] 'tag").value, Value::Integer(7));
        // A named throw passes through an unnamed catch.
        let (e, err) = eval_err("catch [throw/name 7 'tag]");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::ThrowUncaught));
    }

    #[test]
    fn test_attempt_and_try() {
        assert_eq!(eval("attempt [1 / 0]").value, Value::NoneVal);
        assert_eq!(eval("attempt [5]").value, Value::Integer(5));
        assert_eq!(eval("type? try [1 / 0]").value, Value::Datatype(Kind::ErrorVal));
    }

    #[test]
    fn test_series_basics() {
        assert_eq!(eval("length? [1 2 3]").value, Value::Integer(3));
        assert_eq!(eval("first [7 8]").value, Value::Integer(7));
        assert_eq!(eval("last [7 8]").value, Value::Integer(8));
        assert_eq!(eval("index? next [1 2 3]").value, Value::Integer(2));
        assert_eq!(eval("length? next [1 2 3]").value, Value::Integer(2));
        assert_eq!(eval("head? next [1]").value, Value::Logic(false));
        assert_eq!(eval("tail? next [1]").value, Value::Logic(true));
        assert_eq!(eval("pick [1 2 3] 2").value, Value::Integer(2));
        assert_eq!(eval("pick [1 2 3] 9").value, Value::NoneVal);
        assert_eq!(eval("b: [1 2 3] poke b 2 9 b/2").value, Value::Integer(9));
        assert_eq!(eval("select [a 1 b 2] 'b").value, Value::Integer(2));
    }

    #[test]
    fn test_append_insert_copy_clear() {
        assert_eq!(eval("b: [1] append b 2 length? b").value, Value::Integer(2));
        assert_eq!(eval("b: [1 2] insert b 0 first b").value, Value::Integer(0));
        assert_eq!(eval("b: [1 2] c: copy b append c 3 length? b").value, Value::Integer(2));
        assert_eq!(eval("b: [1 2 3] clear next b length? b").value, Value::Integer(1));
        assert_eq!(eval(r#"s: copy "ab" append s #"c" length? s"#).value, Value::Integer(3));
    }

    #[test]
    fn test_copy_deep_isolates_nested_blocks() {
        assert_eq!(
            eval("a: [[1]] b: copy/deep a append first b 2 length? first a").value,
            Value::Integer(1)
        );
        assert_eq!(
            eval("a: [[1]] b: copy a append first b 2 length? first a").value,
            Value::Integer(2)
        );
    }

    #[test]
    fn test_reduce_and_compose() {
        assert_eq!(eval("length? reduce [1 + 1 2 + 2]").value, Value::Integer(2));
        assert_eq!(eval("first reduce [1 + 1]").value, Value::Integer(2));
        assert_eq!(eval("first compose [(1 + 1) word]").value, Value::Integer(2));
        assert_eq!(eval("length? compose [(reduce [1 2]) 3]").value, Value::Integer(3));
    }

    #[test]
    fn test_apply_positional_refinements() {
        assert_eq!(
            eval("f: func [a /double] [either double [a * 2] [a]] apply :f [5 true]").value,
            Value::Integer(10)
        );
        assert_eq!(
            eval("f: func [a /double] [either double [a * 2] [a]] apply :f [5 none]").value,
            Value::Integer(5)
        );
        let (e, err) = eval_err("f: func [a] [a] apply :f [1 2]");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::TooMany));
    }

    #[test]
    fn test_set_get_value() {
        assert_eq!(eval("x: 1 set 'x 5 x").value, Value::Integer(5));
        assert_eq!(eval("x: 7 get 'x").value, Value::Integer(7));
        assert_eq!(eval("x: 1 value? 'x").value, Value::Logic(true));
        assert_eq!(eval("value? 'never-set-anywhere").value, Value::Logic(false));
        assert_eq!(eval("x: 1 unset 'x value? 'x").value, Value::Logic(false));
    }

    #[test]
    fn test_protect_word() {
        let (e, err) = eval_err("x: 1 protect 'x x: 2");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::LockedWord));
        assert_eq!(eval("x: 1 protect 'x unprotect 'x x: 2").value, Value::Integer(2));
    }

    #[test]
    fn test_protect_series() {
        let (e, err) = eval_err("b: [1 2] protect b append b 3");
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::Protected));
    }

    #[test]
    fn test_make_object_with_inheritance() {
        assert_eq!(eval("o: make object! [a: 1] p: make o [b: 2] p/a + p/b").value, Value::Integer(3));
    }

    #[test]
    fn test_type_query() {
        assert_eq!(eval("type? 1").value, Value::Datatype(Kind::Integer));
        assert_eq!(eval("type? type? 1").value, Value::Datatype(Kind::Datatype));
        assert_eq!(eval("type? 1 = integer!").value, Value::Logic(true));
    }

    #[test]
    fn test_in_and_bind() {
        assert_eq!(eval("o: make object! [a: 42] get in o 'a").value, Value::Integer(42));
        assert_eq!(eval("o: make object! [a: 1] in o 'missing").value, Value::NoneVal);
        assert_eq!(eval("o: make object! [a: 9] do bind [a] o").value, Value::Integer(9));
    }

    #[test]
    fn test_mold_form_natives() {
        let mut e = Engine::new(Config::default());
        let v = e.eval_str("mold [1 2]").unwrap();
        match v.value {
            Value::Str(r) => assert_eq!(e.arena.text(r.series), "[1 2]"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_logic_ops() {
        assert_eq!(eval("true and false").value, Value::Logic(false));
        assert_eq!(eval("true or false").value, Value::Logic(true));
        assert_eq!(eval("3 and 5").value, Value::Integer(1));
        assert_eq!(eval("not none").value, Value::Logic(true));
    }
}
