//! The evaluator
//!
//! A recursive expression stepper over block series. Each step polls the
//! cooperative signals, fetches the cell at the current index, dispatches on
//! its kind, and (when enabled) runs the infix lookahead that lets a
//! trailing infix function consume the value just produced as its left
//! argument. All intermediate results live in data-stack slots so the
//! collector can see them; nothing of consequence sits only in host locals.
//!
//! Control flow is explicit everywhere:
//! - hard failures travel as `Err(Raise)` and unwind to the nearest trap;
//! - `return`/`break`/`continue`/`throw`/`quit` travel as ordinary cells
//!   with the thrown flag set, paired with side data in `Engine::thrown`,
//!   until a loop, function boundary, or `catch` absorbs them.
//!
//! Call frames are pushed on `Engine::calls` with their arguments as a
//! data-stack range; stack-relative words resolve against this chain.

use crate::bind::BindOpts;
use crate::engine::{EVAL_BUDGET, Engine, Slot};
use crate::error::{ErrKind, Eval, Raise, raise, set_error_near};
use crate::frame::{find_word, get_var, set_var};
use crate::path::{self, PathAction, PathOutcome};
use crate::series::SeriesId;
use crate::signals::{SIG_ESCAPE, SIG_RECYCLE};
use crate::symbol::Sym;
use crate::value::{Cell, Kind, ParamClass, SeriesRef, TypedWord, Value, Word};

/// Evaluator nesting limit; the host-stack overflow guard.
pub const MAX_DEPTH: u32 = 256;

/// One live function invocation.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// The function value being run.
    pub func: Cell,
    /// Symbol the function was reached through, for error reports.
    pub label: Option<Sym>,
    /// Caller's output slot.
    pub out: Slot,
    /// Block and index where the call was found (none for `apply`).
    pub block: Option<SeriesId>,
    pub index: u32,
    /// First argument slot; arguments are contiguous.
    pub args: Slot,
    pub nargs: u32,
    /// Set once every argument is bound; relative words only resolve
    /// against ready calls.
    pub ready: bool,
}

/// The parameter word-list series of any function kind.
pub fn words_of(func: &Cell) -> Option<SeriesId> {
    match func.value {
        Value::Function(f) | Value::Closure(f) => Some(f.words),
        Value::Native(n) | Value::Action(n) => Some(n.words),
        _ => None,
    }
}

impl CallFrame {
    /// The word-list series owning this call's parameters.
    pub fn func_words(&self) -> Option<SeriesId> {
        words_of(&self.func)
    }
}

/// What a thrown cell means; carried beside it in `Engine::thrown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrownKind {
    Break,
    Continue,
    Return,
    Exit,
    Throw(Option<Sym>),
    Quit,
}

#[derive(Debug, Clone, Copy)]
pub struct ThrownInfo {
    pub kind: ThrownKind,
    pub arg: Cell,
}

/// Arm a control-flow escape: the out slot gets a thrown-flagged cell and
/// the side data records what kind of escape is in flight. Loop signals
/// (break/continue) travel as thrown unset; the others carry their value.
pub fn throw_from(engine: &mut Engine, kind: ThrownKind, arg: Cell, out: Slot) {
    engine.thrown = Some(ThrownInfo { kind, arg: arg.stored() });
    let mut marker = match kind {
        ThrownKind::Break | ThrownKind::Continue => Cell::UNSET,
        _ => arg.stored(),
    };
    marker.set_thrown(true);
    engine.set_slot(out, marker);
}

/// Per-step signal poll. The budget batches the check; when it runs out we
/// accumulate cycles, enforce the optional cycle limit, and service any
/// raised bits (recycle runs the collector, escape raises the halt).
pub fn check_signals(engine: &mut Engine) -> Eval<()> {
    engine.budget -= 1;
    if engine.budget > 0 {
        return Ok(());
    }
    engine.cycles += EVAL_BUDGET as u64;
    engine.budget = EVAL_BUDGET;
    if let Some(limit) = engine.cycle_limit {
        if engine.cycles > limit {
            return Err(raise(engine, ErrKind::Halt, &[]));
        }
    }
    if engine.signals.pending(engine.sigmask & SIG_RECYCLE) {
        // Mask the bit while it is serviced, restore after.
        let saved = engine.sigmask;
        engine.sigmask &= !SIG_RECYCLE;
        engine.signals.take(SIG_RECYCLE);
        engine.maybe_recycle();
        engine.sigmask = saved;
    }
    if engine.signals.pending(engine.sigmask & SIG_ESCAPE) {
        engine.signals.take(SIG_ESCAPE);
        if !engine.booting {
            return Err(raise(engine, ErrKind::Halt, &[]));
        }
    }
    Ok(())
}

/// Evaluate a whole block, leaving the last expression's value in `out`.
/// An empty block leaves unset. Thrown cells stop the walk and stay in
/// `out` for the caller to classify.
pub fn do_block(engine: &mut Engine, block: SeriesId, out: Slot) -> Eval<()> {
    engine.depth += 1;
    if engine.depth > MAX_DEPTH {
        engine.depth -= 1;
        return Err(Raise(engine.stack_error));
    }
    // The code being walked is itself a root: nothing else may be holding
    // this series while it runs.
    let keep = engine.arena.keep_mark();
    engine.arena.keep_push(block);
    engine.set_slot(out, Cell::UNSET);
    let mut index = 0;
    let mut result = Ok(());
    while index < engine.arena.get(block).len() {
        match eval_next(engine, block, index, out, true) {
            Ok(Some(next)) => {
                debug_assert!(next > index, "evaluator must advance");
                if engine.slot(out).is_thrown() {
                    break;
                }
                index = next;
            }
            Ok(None) => break,
            Err(e) => {
                set_error_near(
                    engine,
                    &e.0,
                    Cell::new(Value::Block(SeriesRef { series: block, index: index as u32 })),
                );
                result = Err(e);
                break;
            }
        }
    }
    engine.arena.keep_truncate(keep);
    engine.depth -= 1;
    result
}

/// Evaluate one expression at `index`, including its infix continuation.
///
/// Returns the post-expression index, or `None` at the end of the block
/// (with unset stored). A thrown result suppresses the lookahead.
pub fn eval_next(
    engine: &mut Engine,
    block: SeriesId,
    index: usize,
    out: Slot,
    lookahead: bool,
) -> Eval<Option<usize>> {
    check_signals(engine)?;
    let cell = engine.arena.cell_at(block, index);
    let mut idx = match cell.value {
        Value::End => {
            engine.set_slot(out, Cell::UNSET);
            return Ok(None);
        }
        Value::Word(w) => {
            let val = get_var(engine, &w)?;
            if val.value.is_function_like() {
                do_call(engine, val, block, index + 1, out, Some(w.sym), &[], false)?
            } else if val.value.kind() == Kind::Unset {
                return Err(raise(engine, ErrKind::NotDefined, &[cell]));
            } else {
                engine.set_slot(out, val.stored());
                index + 1
            }
        }
        Value::SetWord(w) => {
            let next = eval_next(engine, block, index + 1, out, true)?;
            let Some(next) = next else {
                return Err(raise(engine, ErrKind::NeedValue, &[cell]));
            };
            let val = engine.slot(out);
            if val.is_thrown() {
                return Ok(Some(next));
            }
            if val.value.kind() == Kind::Unset {
                return Err(raise(engine, ErrKind::NeedValue, &[cell]));
            }
            set_var(engine, &w, val)?;
            next
        }
        Value::GetWord(w) => {
            let val = get_var(engine, &w)?;
            engine.set_slot(out, val.stored());
            index + 1
        }
        Value::LitWord(w) => {
            engine.set_slot(out, Cell::new(Value::Word(w)));
            index + 1
        }
        Value::LitPath(r) => {
            engine.set_slot(out, Cell::new(Value::Path(r)));
            index + 1
        }
        Value::Paren(r) => {
            do_block(engine, r.series, out)?;
            index + 1
        }
        Value::Path(r) => eval_path_expr(engine, r, block, index, out)?,
        Value::SetPath(r) => {
            let next = eval_next(engine, block, index + 1, out, true)?;
            let Some(next) = next else {
                return Err(raise(engine, ErrKind::NeedValue, &[cell]));
            };
            let val = engine.slot(out);
            if val.is_thrown() {
                return Ok(Some(next));
            }
            if val.value.kind() == Kind::Unset {
                return Err(raise(engine, ErrKind::NeedValue, &[cell]));
            }
            match path::traverse(engine, r, PathAction::Set(val))? {
                PathOutcome::Value(_) | PathOutcome::Stored => {}
                PathOutcome::Func { .. } => {
                    return Err(raise(engine, ErrKind::BadSetPath, &[cell]));
                }
            }
            // A set-path expression evaluates to the value it stored.
            engine.set_slot(out, val);
            next
        }
        Value::GetPath(r) => {
            match path::traverse(engine, r, PathAction::Get)? {
                PathOutcome::Value(v) => engine.set_slot(out, v.stored()),
                PathOutcome::Stored => unreachable!("get traversal never stores"),
                PathOutcome::Func { func, refine_at } => {
                    // Refinements after a function make no sense without a
                    // call; refuse loudly rather than ignore them.
                    if refine_at < engine.arena.get(r.series).len() {
                        return Err(raise(engine, ErrKind::BadPath, &[cell]));
                    }
                    engine.set_slot(out, func.stored());
                }
            }
            index + 1
        }
        Value::Native(_) | Value::Action(_) | Value::Function(_) | Value::Closure(_) => {
            do_call(engine, cell, block, index + 1, out, None, &[], false)?
        }
        _ => {
            engine.set_slot(out, cell.stored());
            index + 1
        }
    };

    if engine.slot(out).is_thrown() {
        return Ok(Some(idx));
    }

    if lookahead {
        loop {
            let next_cell = engine.arena.cell_at(block, idx);
            let (func, label) = match next_cell.value {
                Value::Word(w) if w.binding.is_some() => match get_var(engine, &w) {
                    Ok(v) if v.value.is_function_like() && v.is_infix() => (v, Some(w.sym)),
                    _ => break,
                },
                Value::Native(_) | Value::Action(_) if next_cell.is_infix() => (next_cell, None),
                _ => break,
            };
            idx = do_call(engine, func, block, idx + 1, out, label, &[], true)?;
            if engine.slot(out).is_thrown() {
                break;
            }
        }
    }
    Ok(Some(idx))
}

/// A path in evaluation position: traverse it, and if it lands on a
/// function, invoke it with the remaining segments as refinements.
fn eval_path_expr(
    engine: &mut Engine,
    r: SeriesRef,
    block: SeriesId,
    index: usize,
    out: Slot,
) -> Eval<usize> {
    let path_cell = Cell::new(Value::Path(r));
    match path::traverse(engine, r, PathAction::Get)? {
        PathOutcome::Value(v) => {
            if v.value.kind() == Kind::Unset {
                return Err(raise(engine, ErrKind::NotDefined, &[path_cell]));
            }
            engine.set_slot(out, v.stored());
            Ok(index + 1)
        }
        PathOutcome::Stored => unreachable!("get traversal never stores"),
        PathOutcome::Func { func, refine_at } => {
            // Remaining segments select refinements for the invocation.
            let mut refines = Vec::new();
            let len = engine.arena.get(r.series).len();
            for i in refine_at..len {
                let seg = engine.arena.cell_at(r.series, i);
                match seg.value.word_sym() {
                    Some(sym) => refines.push(sym),
                    None => {
                        return Err(raise(engine, ErrKind::BadPath, &[path_cell, seg]));
                    }
                }
            }
            let label = engine
                .arena
                .cell_at(r.series, r.index as usize)
                .value
                .word_sym();
            do_call(engine, func, block, index + 1, out, label, &refines, false)
        }
    }
}

/// Outcome of binding one parameter from the block.
enum Fill {
    At(usize),
    End,
    Thrown(usize),
}

fn param_of(cell: &Cell) -> Option<TypedWord> {
    match cell.value {
        Value::TypedWord(tw) => Some(tw),
        _ => None,
    }
}

fn label_cell(label: Option<Sym>) -> Cell {
    match label {
        Some(sym) => Cell::new(Value::Word(Word::unbound(sym))),
        None => Cell::NONE,
    }
}

/// Invoke a function found at a call site in `block`; arguments are
/// consumed starting at `index`. Returns the index after the consumed
/// arguments. `refines` carries path-supplied refinements in path order;
/// `as_infix` marks that the first argument is already in `out`.
#[allow(clippy::too_many_arguments)]
pub fn do_call(
    engine: &mut Engine,
    func: Cell,
    block: SeriesId,
    index: usize,
    out: Slot,
    label: Option<Sym>,
    refines: &[Sym],
    as_infix: bool,
) -> Eval<usize> {
    if func.is_infix() && !as_infix {
        return Err(raise(engine, ErrKind::NoOpArg, &[label_cell(label)]));
    }
    let call = push_call(engine, func, label, out, Some(block), index)?;
    match bind_args(engine, call, refines, as_infix, index) {
        Err(e) => {
            pop_call(engine);
            Err(e)
        }
        Ok(Fill::Thrown(next)) => {
            pop_call(engine);
            Ok(next)
        }
        Ok(Fill::End) => unreachable!("bind_args reports end as an error"),
        Ok(Fill::At(next)) => {
            engine.calls.last_mut().expect("call just pushed").ready = true;
            let ran = dispatch_call(engine);
            pop_call(engine);
            ran?;
            Ok(next)
        }
    }
}

/// Push a call frame with its argument slots (initialized to none).
fn push_call(
    engine: &mut Engine,
    func: Cell,
    label: Option<Sym>,
    out: Slot,
    block: Option<SeriesId>,
    index: usize,
) -> Eval<usize> {
    let Some(words) = words_of(&func) else {
        return Err(raise(engine, ErrKind::Internal, &[func]));
    };
    let nargs = engine.arena.get(words).len().saturating_sub(1);
    let args = Slot(engine.ds.len());
    for _ in 0..nargs {
        engine.ds.push(Cell::NONE);
    }
    engine.calls.push(CallFrame {
        func,
        label,
        out,
        block,
        index: index as u32,
        args,
        nargs: nargs as u32,
        ready: false,
    });
    Ok(engine.calls.len() - 1)
}

fn pop_call(engine: &mut Engine) {
    let call = engine.calls.pop().expect("unbalanced call chain");
    engine.ds_truncate(call.args.0);
}

/// Bind every parameter of the youngest call, consuming expressions from
/// the call-site block. Returns the index after the last consumed value,
/// or `Thrown` if an argument's evaluation threw (the caller disposes the
/// frame and propagates).
fn bind_args(
    engine: &mut Engine,
    call_index: usize,
    refines: &[Sym],
    as_infix: bool,
    mut idx: usize,
) -> Eval<Fill> {
    let call = engine.calls[call_index];
    let words = call.func_words().expect("calls always have word lists");
    let params: Vec<Cell> = engine.arena.cells(words)[1..].to_vec();
    let block = call.block.expect("block-driven binding needs a call site");
    let label = call.label;

    // Leading parameters, up to the first refinement.
    let mut lead = 0;
    while lead < params.len() {
        let Some(tw) = param_of(&params[lead]) else { break };
        if tw.class == ParamClass::Refinement {
            break;
        }
        let slot = Slot(call.args.0 + lead);
        if as_infix && lead == 0 {
            // The left operand was evaluated before the call was seen.
            let left = engine.slot(call.out).stored();
            engine.set_slot(slot, left);
        } else {
            match fill_param(engine, &tw, block, idx, slot, !as_infix, label)? {
                Fill::At(next) => idx = next,
                Fill::End => {
                    let param = Cell::new(Value::Word(Word::unbound(tw.sym)));
                    return Err(raise(engine, ErrKind::NoArg, &[label_cell(label), param]));
                }
                Fill::Thrown(next) => {
                    let thrown = engine.slot(slot);
                    engine.set_slot(call.out, thrown);
                    return Ok(Fill::Thrown(next));
                }
            }
        }
        typecheck_arg(engine, label, &tw, slot)?;
        lead += 1;
    }

    // Path refinements, in the order the path named them. Out-of-order
    // requests replay the parameter list to find their section.
    for &rsym in refines {
        let mut found = None;
        for (p, cell) in params.iter().enumerate().skip(lead) {
            if let Some(tw) = param_of(cell) {
                if tw.class == ParamClass::Refinement && engine.symbols.case_eq(tw.sym, rsym) {
                    found = Some(p);
                    break;
                }
            }
        }
        let Some(rp) = found else {
            let name = Cell::new(Value::Refinement(Word::unbound(rsym)));
            return Err(raise(engine, ErrKind::NoRefine, &[label_cell(label), name]));
        };
        engine.set_slot(Slot(call.args.0 + rp), Cell::TRUE);
        let mut q = rp + 1;
        while q < params.len() {
            let Some(tw) = param_of(&params[q]) else { break };
            if tw.class == ParamClass::Refinement {
                break;
            }
            let slot = Slot(call.args.0 + q);
            match fill_param(engine, &tw, block, idx, slot, !as_infix, label)? {
                Fill::At(next) => idx = next,
                Fill::End => {
                    let param = Cell::new(Value::Word(Word::unbound(tw.sym)));
                    return Err(raise(engine, ErrKind::NoArg, &[label_cell(label), param]));
                }
                Fill::Thrown(next) => {
                    let thrown = engine.slot(slot);
                    engine.set_slot(call.out, thrown);
                    return Ok(Fill::Thrown(next));
                }
            }
            typecheck_arg(engine, label, &tw, slot)?;
            q += 1;
        }
    }
    Ok(Fill::At(idx))
}

/// Bind one argument according to its parameter class.
fn fill_param(
    engine: &mut Engine,
    tw: &TypedWord,
    block: SeriesId,
    idx: usize,
    slot: Slot,
    lookahead: bool,
    _label: Option<Sym>,
) -> Eval<Fill> {
    match tw.class {
        ParamClass::Normal => match eval_next(engine, block, idx, slot, lookahead)? {
            Some(next) => {
                if engine.slot(slot).is_thrown() {
                    Ok(Fill::Thrown(next))
                } else {
                    Ok(Fill::At(next))
                }
            }
            None => Ok(Fill::End),
        },
        ParamClass::Literal => {
            let cell = engine.arena.cell_at(block, idx);
            match cell.value {
                Value::End => {
                    engine.set_slot(slot, Cell::UNSET);
                    Ok(Fill::At(idx))
                }
                // The soft-quote escape hatch: these still evaluate.
                Value::Paren(_) | Value::GetWord(_) | Value::GetPath(_) => {
                    match eval_next(engine, block, idx, slot, false)? {
                        Some(next) => {
                            if engine.slot(slot).is_thrown() {
                                Ok(Fill::Thrown(next))
                            } else {
                                Ok(Fill::At(next))
                            }
                        }
                        None => Ok(Fill::End),
                    }
                }
                _ => {
                    engine.set_slot(slot, cell.stored());
                    Ok(Fill::At(idx + 1))
                }
            }
        }
        ParamClass::Get => {
            let cell = engine.arena.cell_at(block, idx);
            if cell.is_end() {
                engine.set_slot(slot, Cell::UNSET);
                Ok(Fill::At(idx))
            } else {
                engine.set_slot(slot, cell.stored());
                Ok(Fill::At(idx + 1))
            }
        }
        ParamClass::Refinement => unreachable!("refinement slots are set, not filled"),
    }
}

fn typecheck_arg(
    engine: &mut Engine,
    label: Option<Sym>,
    tw: &TypedWord,
    slot: Slot,
) -> Eval<()> {
    let arg = engine.slot(slot);
    if tw.types.has(arg.value.kind()) {
        return Ok(());
    }
    let param = Cell::new(Value::Word(Word::unbound(tw.sym)));
    let got = Cell::new(Value::Datatype(arg.value.kind()));
    Err(raise(engine, ErrKind::ExpectArg, &[label_cell(label), param, got]))
}

/// Run the body (or native) of the youngest, fully-bound call.
fn dispatch_call(engine: &mut Engine) -> Eval<()> {
    let call = *engine.calls.last().expect("dispatch without a call");
    debug_assert!(call.ready);
    match call.func.value {
        Value::Native(n) | Value::Action(n) => crate::natives::run_native(engine, n.id, &call),
        Value::Function(f) => {
            do_block(engine, f.body, call.out)?;
            absorb_function_exit(engine, call.out);
            Ok(())
        }
        Value::Closure(f) => {
            let frame = instantiate_closure(engine, &call, f)?;
            let keep = engine.arena.keep_mark();
            engine.arena.keep_push(frame);
            let body = match engine.arena.cell_at(frame, 0).value {
                Value::FrameHead { spec: Some(body), .. } => body,
                _ => unreachable!("closure frame carries its body as spec"),
            };
            let ran = do_block(engine, body, call.out);
            engine.arena.keep_truncate(keep);
            ran?;
            absorb_function_exit(engine, call.out);
            Ok(())
        }
        other => Err(raise(engine, ErrKind::Internal, &[Cell::new(other)])),
    }
}

/// Closures re-instantiate per call: a persistent frame takes the bound
/// arguments, the body is deep-copied and rebound from stack-relative
/// indices to that frame, and the copy runs. The frame id rides in the
/// descriptor's spec slot so the body stays reachable while it runs.
fn instantiate_closure(
    engine: &mut Engine,
    call: &CallFrame,
    f: crate::value::FuncRef,
) -> Eval<SeriesId> {
    let frame = crate::frame::make_frame(&mut engine.arena, &mut engine.symbols, call.nargs as usize, false)
        .map_err(|e| crate::error::raise_mem(engine, e))?;
    let params: Vec<Cell> = engine.arena.cells(f.words)[1..].to_vec();
    for (i, cell) in params.iter().enumerate() {
        let Some(tw) = param_of(cell) else { continue };
        let slot = crate::frame::append_frame(
            &mut engine.arena,
            frame,
            TypedWord::new(tw.sym, ParamClass::Normal, tw.types),
            crate::value::CellFlags::empty(),
        )
        .map_err(|e| crate::error::raise_mem(engine, e))?;
        let arg = engine.ds[call.args.0 + i];
        engine
            .arena
            .set_cell(frame, slot as usize, arg)
            .map_err(|e| crate::error::raise_series(engine, e))?;
    }
    let body = engine
        .arena
        .copy_block(f.body, 0, true)
        .map_err(|e| crate::error::raise_series(engine, e))?;
    rebind_relative(engine, f.words, frame, body);
    crate::frame::set_frame_spec(&mut engine.arena, frame, Some(body));
    engine.arena.manage_deep(frame);
    let words = crate::frame::frame_words(&engine.arena, frame);
    engine.arena.manage(words);
    Ok(frame)
}

/// Rewrite stack-relative words (bound to `words`) as persistent slots of
/// `frame`, recursing through the copied body.
fn rebind_relative(engine: &mut Engine, words: SeriesId, frame: SeriesId, body: SeriesId) {
    for i in 0..engine.arena.get(body).len() {
        let mut cell = engine.arena.cell_at(body, i);
        if let Some(w) = cell.value.word_mut() {
            if w.binding == Some(words) && w.index < 0 {
                w.binding = Some(frame);
                w.index = -w.index;
                engine
                    .arena
                    .set_cell(body, i, cell)
                    .expect("fresh body copy is writable");
            }
        } else if cell.value.is_block_like() {
            if let Some(r) = cell.value.series_ref() {
                rebind_relative(engine, words, frame, r.series);
            }
        }
    }
}

/// Absorb a function-level escape at the invocation boundary: `return`
/// delivers its argument, `exit` delivers unset. Everything else keeps
/// propagating.
fn absorb_function_exit(engine: &mut Engine, out: Slot) {
    if !engine.slot(out).is_thrown() {
        return;
    }
    match engine.thrown {
        Some(ThrownInfo { kind: ThrownKind::Return, arg }) => {
            engine.thrown = None;
            engine.set_slot(out, arg.stored());
        }
        Some(ThrownInfo { kind: ThrownKind::Exit, .. }) => {
            engine.thrown = None;
            engine.set_slot(out, Cell::UNSET);
        }
        _ => {}
    }
}

/// Apply a function to pre-computed values.
///
/// Values map to parameters positionally, refinement slots included: a
/// truthy value turns the refinement on, a falsy one forces it and its
/// following arguments to none. The `apply` native reduces its block
/// *before* calling here, so an arity excess is only reported after every
/// reduction side effect already ran.
pub fn apply_func(engine: &mut Engine, func: Cell, vals: &[Cell], out: Slot) -> Eval<()> {
    let call_index = push_call(engine, func, None, out, None, 0)?;
    let call = engine.calls[call_index];
    let words = call.func_words().expect("checked by push_call");
    let params: Vec<Cell> = engine.arena.cells(words)[1..].to_vec();

    if vals.len() > params.len() {
        pop_call(engine);
        return Err(raise(engine, ErrKind::TooMany, &[func]));
    }

    let mut forced_none = false;
    for (i, cell) in params.iter().enumerate() {
        let Some(tw) = param_of(cell) else { continue };
        let given = vals.get(i).copied().unwrap_or(Cell::NONE);
        let slot = Slot(call.args.0 + i);
        if tw.class == ParamClass::Refinement {
            forced_none = !given.truthy();
            engine.set_slot(slot, if forced_none { Cell::NONE } else { Cell::TRUE });
            continue;
        }
        if forced_none {
            engine.set_slot(slot, Cell::NONE);
            continue;
        }
        engine.set_slot(slot, given.stored());
        if let Err(e) = typecheck_arg(engine, None, &tw, slot) {
            pop_call(engine);
            return Err(e);
        }
    }

    engine.calls.last_mut().expect("call just pushed").ready = true;
    let ran = dispatch_call(engine);
    pop_call(engine);
    ran
}

/// A scoped trap region: evaluation state is snapshotted on entry and
/// restored on any error exit, freeing manual series made inside.
///
/// `Ok(Ok(v))` is a normal result, `Ok(Err(cell))` a caught error, and the
/// outer `Err` a halt passing through a halt-unaware trap.
pub fn trap<F>(engine: &mut Engine, halt_aware: bool, f: F) -> Eval<Result<Cell, Cell>>
where
    F: FnOnce(&mut Engine) -> Eval<Cell>,
{
    let ds_mark = engine.ds_mark();
    let calls_mark = engine.calls.len();
    let manuals_mark = engine.arena.manuals_mark();
    let keep_mark = engine.arena.keep_mark();
    match f(engine) {
        Ok(value) => {
            debug_assert_eq!(engine.calls.len(), calls_mark, "call chain unbalanced");
            Ok(Ok(value))
        }
        Err(e) => {
            engine.ds_truncate(ds_mark);
            engine.calls.truncate(calls_mark);
            engine.arena.keep_truncate(keep_mark);
            engine.arena.manuals_unwind(manuals_mark);
            engine.thrown = None;
            if !halt_aware && crate::error::is_halt(engine, &e.0) {
                // Only specific outermost traps may catch a halt.
                return Err(e);
            }
            Ok(Err(e.0))
        }
    }
}

/// Scan, bind into the user context, and evaluate host source text.
pub fn do_string(engine: &mut Engine, source: &str) -> Result<Cell, Cell> {
    let pre_scan = engine.arena.manuals_mark();
    let block = match crate::scan::scan_source(engine, source) {
        Ok(block) => block,
        Err(err) => {
            let near = Cell::new(Value::Integer(err.line as i64));
            let arg = match crate::scan::scan_error_text(engine, &err) {
                Ok(cell) => cell,
                Err(_) => Cell::NONE,
            };
            let cell = crate::error::make_error(engine, ErrKind::Syntax, &[arg, near])
                .unwrap_or(engine.oom_error);
            return Err(cell);
        }
    };

    let lib = engine.lib;
    let user = engine.user;
    let outcome = trap(engine, true, |engine| {
        // Lib first, user second: the user pass only rewrites words that
        // exist (or are added) in the user frame, so user definitions
        // shadow lib and everything else reaches the natives.
        crate::bind::bind_block(engine, lib, block, BindOpts::deep())?;
        crate::bind::bind_block(engine, user, block, BindOpts::deep_set())?;
        engine.arena.manage_deep(block);
        let out = engine.push_slot();
        do_block(engine, block, out)?;
        let result = engine.slot(out);
        engine.ds_truncate(out.0);
        Ok(result)
    });
    let value = match outcome {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            // Scan output not yet transferred to the collector dies here.
            engine.arena.manuals_unwind(pre_scan);
            return Err(e);
        }
        Err(e) => {
            engine.arena.manuals_unwind(pre_scan);
            return Err(e.0);
        }
    };

    if value.is_thrown() {
        // Classify escapes that reached the top.
        let info = engine.thrown.take();
        return match info {
            Some(ThrownInfo { kind: ThrownKind::Quit, arg }) => {
                engine.quit_requested = Some(arg);
                Ok(arg.stored())
            }
            Some(ThrownInfo { kind: ThrownKind::Throw(name), arg }) => {
                let name_cell = match name {
                    Some(sym) => Cell::new(Value::Word(Word::unbound(sym))),
                    None => arg,
                };
                Err(crate::error::make_error(engine, ErrKind::ThrowUncaught, &[name_cell])
                    .unwrap_or(engine.oom_error))
            }
            Some(ThrownInfo { kind, arg: _ }) => {
                let what = match kind {
                    ThrownKind::Break => "break",
                    ThrownKind::Continue => "continue",
                    ThrownKind::Return | ThrownKind::Exit => "return",
                    _ => "throw",
                };
                let sym = engine.symbols.intern(what);
                let word = Cell::new(Value::Word(Word::unbound(sym)));
                Err(crate::error::make_error(engine, ErrKind::ThrowUncaught, &[word])
                    .unwrap_or(engine.oom_error))
            }
            None => Ok(value.stored()),
        };
    }
    Ok(value)
}

/// Look up a function by name in the user context (then lib) and apply it.
pub fn call_named(engine: &mut Engine, name: &str, args: &[Cell]) -> Result<Cell, Cell> {
    let sym = engine.symbols.intern(name);
    let found = find_word(&engine.arena, &engine.symbols, engine.user, sym)
        .map(|slot| (engine.user, slot))
        .or_else(|| {
            find_word(&engine.arena, &engine.symbols, engine.lib, sym).map(|slot| (engine.lib, slot))
        });
    let Some((frame, slot)) = found else {
        let word = Cell::new(Value::Word(Word::unbound(sym)));
        let cell = crate::error::make_error(engine, ErrKind::NotDefined, &[word])
            .unwrap_or(engine.oom_error);
        return Err(cell);
    };
    let func = engine.arena.cell_at(frame, slot as usize);
    if !func.value.is_function_like() {
        if args.is_empty() {
            return Ok(func);
        }
        let cell = crate::error::make_error(engine, ErrKind::ExpectArg, &[func])
            .unwrap_or(engine.oom_error);
        return Err(cell);
    }

    let args = args.to_vec();
    let outcome = trap(engine, true, move |engine| {
        let out = engine.push_slot();
        apply_func(engine, func, &args, out)?;
        let result = engine.slot(out);
        engine.ds_truncate(out.0);
        Ok(result)
    });
    match outcome {
        Ok(Ok(v)) => {
            engine.thrown = None;
            Ok(v.stored())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e.0),
    }
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
    fn test_literals_self_evaluate() {
        assert_eq!(eval("42").value, Value::Integer(42));
        assert_eq!(eval("1.5").value, Value::Decimal(1.5));
        assert_eq!(eval("true").value, Value::Logic(true));
        assert_eq!(eval("none").value, Value::NoneVal);
    }

    #[test]
    fn test_block_value_is_last_expression() {
        assert_eq!(eval("1 2 3").value, Value::Integer(3));
        assert_eq!(eval("").value, Value::Unset);
    }

    #[test]
    fn test_set_word_and_lookup() {
        assert_eq!(eval("x: 10 x").value, Value::Integer(10));
    }

    #[test]
    fn test_infix_is_left_to_right_single_precedence() {
        // One precedence level, strictly left to right: (1 + 2) * 3.
        assert_eq!(eval("1 + 2 * 3").value, Value::Integer(9));
        // Parens override the order.
        assert_eq!(eval("1 + (2 * 3)").value, Value::Integer(7));
    }

    #[test]
    fn test_set_word_takes_the_whole_expression() {
        assert_eq!(eval("x: 1 + 2 x").value, Value::Integer(3));
    }

    #[test]
    fn test_infix_without_left_argument_fails() {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str("* 3").unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::NoOpArg));
    }

    #[test]
    fn test_unset_word_errors() {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str("no-such-word-here").unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::NotDefined));
    }

    #[test]
    fn test_set_word_needs_a_value() {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str("x:").unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::NeedValue));
    }

    #[test]
    fn test_cycle_limit_halts() {
        let mut e = Engine::new(Config::new().with_cycle_limit(EVAL_BUDGET as u64));
        let err = e.eval_str("forever [1]").unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::Halt));
    }

    #[test]
    fn test_deep_recursion_is_a_stack_overflow_error() {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str("f: func [] [f] f").unwrap_err();
        assert_eq!(crate::error::error_kind(&e, &err), Some(ErrKind::StackOverflow));
        // The engine survives and keeps working.
        assert_eq!(e.eval_str("1 + 1").unwrap().value, Value::Integer(2));
    }
}
