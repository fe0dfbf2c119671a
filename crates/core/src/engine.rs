//! The engine handle
//!
//! Every process-wide structure of the design - series arena and pools,
//! symbol table, bind table, data stack, call chain, contexts, signal bits -
//! hangs off one `Engine` value that is threaded into every core entry
//! point. Nothing is a true global, so tests run parallel engines freely.
//!
//! The data stack doubles as the GC root for every intermediate value: the
//! evaluator writes results into stack slots, call frames address their
//! arguments as stack ranges, and a collection walks the whole vector.
//!
//! # Embedding
//!
//! ```ignore
//! let mut engine = Engine::new(Config::default());
//! let result = engine.eval_str("x: 10  x + 32")?;
//! assert_eq!(result.value, Value::Integer(42));
//! ```

use crate::bind::BindTable;
use crate::error::ErrKind;
use crate::eval::{CallFrame, ThrownInfo};
use crate::gc::{GcStats, collect};
use crate::pool::Pools;
use crate::series::{Arena, SeriesId};
use crate::signals::SignalFlags;
use crate::symbol::{Sym, SymbolTable};
use crate::value::{Cell, Value, Word};

/// Index of a data-stack slot. Slots are positions, not borrows, so the
/// evaluator can hold one across arbitrary engine mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub usize);

/// How much of the engine the boot phase assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootLevel {
    /// Natives and contexts only.
    Core,
    /// Also builds the `system` object.
    #[default]
    Full,
}

/// Operations the host policy hook may veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    /// Evaluation of host-supplied source.
    Eval,
}

pub type PolicyFn = fn(PolicyOp) -> bool;

/// Engine construction options (builder style).
#[derive(Clone)]
pub struct Config {
    pub boot: BootLevel,
    /// Allocation budget between collections, in bytes.
    pub ballast: i64,
    /// Hard cap on evaluation cycles; exceeding it halts.
    pub cycle_limit: Option<u64>,
    /// Historical semantics switch; defaults to the `TARN_LEGACY` env var.
    pub legacy: Option<bool>,
    /// Pool bypass; defaults to the `TARN_ALWAYS_MALLOC` env var.
    pub always_malloc: Option<bool>,
    pub policy: Option<PolicyFn>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            boot: BootLevel::default(),
            ballast: 2 * 1024 * 1024,
            cycle_limit: None,
            legacy: None,
            always_malloc: None,
            policy: None,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_boot(mut self, level: BootLevel) -> Config {
        self.boot = level;
        self
    }

    pub fn with_ballast(mut self, bytes: i64) -> Config {
        self.ballast = bytes;
        self
    }

    pub fn with_cycle_limit(mut self, cycles: u64) -> Config {
        self.cycle_limit = Some(cycles);
        self
    }

    pub fn with_legacy(mut self, on: bool) -> Config {
        self.legacy = Some(on);
        self
    }

    pub fn with_policy(mut self, policy: PolicyFn) -> Config {
        self.policy = Some(policy);
        self
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

/// Steps between signal polls; the per-step budget refill value.
pub const EVAL_BUDGET: i32 = 512;

pub struct Engine {
    pub arena: Arena,
    pub symbols: SymbolTable,
    pub binds: BindTable,
    /// The data stack: output slots and call arguments. A GC root.
    pub ds: Vec<Cell>,
    /// Live call chain, youngest last.
    pub calls: Vec<CallFrame>,
    /// Engine-wide scratch for word collection. A GC root.
    pub buf_words: Vec<Cell>,
    /// Word-collection reentrancy latch.
    pub collecting: bool,
    pub signals: SignalFlags,
    /// Signal bits currently deliverable; bits are masked while serviced.
    pub sigmask: u32,
    pub budget: i32,
    pub cycles: u64,
    pub cycle_limit: Option<u64>,
    /// Evaluator nesting depth, guarding the host stack.
    pub depth: u32,
    pub booting: bool,
    pub legacy: bool,
    /// Side data for the cell currently travelling with the thrown flag.
    pub thrown: Option<ThrownInfo>,
    /// Set when evaluation ended in `quit`; the host maps it to an exit.
    pub quit_requested: Option<Cell>,
    /// The library context natives are bound into.
    pub lib: SeriesId,
    /// The context host scripts evaluate in.
    pub user: SeriesId,
    /// The `system` object, when boot level builds it.
    pub system: Option<SeriesId>,
    /// Shared empty block singleton (locked).
    pub empty_block: SeriesId,
    pub halt_error: Cell,
    pub stack_error: Cell,
    pub oom_error: Cell,
    pub sym_self: Sym,
    policy: Option<PolicyFn>,
}

impl Engine {
    /// Build and boot an engine.
    ///
    /// # Panics
    ///
    /// Any failure before bootstrap completes is fatal by design; the host
    /// maps the panic to its fatal exit status.
    pub fn new(config: Config) -> Engine {
        let signals = SignalFlags::new();
        let always_malloc =
            config.always_malloc.unwrap_or_else(|| env_flag("TARN_ALWAYS_MALLOC"));
        let legacy = config.legacy.unwrap_or_else(|| env_flag("TARN_LEGACY"));
        let pools = Pools::new(always_malloc, config.ballast, signals.clone());
        let mut arena = Arena::new(pools);
        let mut symbols = SymbolTable::new();

        // Cell geometry is load-bearing for the whole memory model.
        #[cfg(target_pointer_width = "64")]
        debug_assert_eq!(std::mem::size_of::<Cell>(), 32, "cell layout drifted");
        debug_assert_eq!(std::mem::align_of::<Cell>(), 8);

        let empty_block = arena
            .make(crate::series::SeriesClass::Cells, 0)
            .expect("bootstrap allocation");
        arena.manage(empty_block);
        arena.get_mut(empty_block).flags |=
            crate::series::SeriesFlags::LOCKED | crate::series::SeriesFlags::PROTECTED;

        let lib = crate::frame::make_frame(&mut arena, &mut symbols, 96, false)
            .expect("bootstrap allocation");
        let user = crate::frame::make_frame(&mut arena, &mut symbols, 32, false)
            .expect("bootstrap allocation");
        let sym_self = symbols.intern(crate::frame::SELF_NAME);

        let mut engine = Engine {
            arena,
            symbols,
            binds: BindTable::new(),
            ds: Vec::with_capacity(256),
            calls: Vec::new(),
            buf_words: Vec::new(),
            collecting: false,
            signals,
            sigmask: !0,
            budget: EVAL_BUDGET,
            cycles: 0,
            cycle_limit: config.cycle_limit,
            depth: 0,
            booting: true,
            legacy,
            thrown: None,
            quit_requested: None,
            lib,
            user,
            system: None,
            empty_block,
            halt_error: Cell::NONE,
            stack_error: Cell::NONE,
            oom_error: Cell::NONE,
            sym_self,
            policy: config.policy,
        };
        crate::boot::startup(&mut engine, config.boot);
        engine.booting = false;
        engine
    }

    // ----- data stack ----------------------------------------------------

    /// Open a fresh output slot.
    pub fn push_slot(&mut self) -> Slot {
        self.ds.push(Cell::UNSET);
        Slot(self.ds.len() - 1)
    }

    pub fn slot(&self, slot: Slot) -> Cell {
        self.ds[slot.0]
    }

    pub fn set_slot(&mut self, slot: Slot, cell: Cell) {
        self.ds[slot.0] = cell;
    }

    pub fn ds_mark(&self) -> usize {
        self.ds.len()
    }

    pub fn ds_truncate(&mut self, mark: usize) {
        self.ds.truncate(mark);
    }

    // ----- garbage collection -------------------------------------------

    /// Run a collection now, regardless of ballast.
    pub fn recycle_now(&mut self) -> GcStats {
        debug_assert!(!self.booting, "no collection during bootstrap");
        debug_assert!(!self.binds.in_use(), "no collection inside a binding pass");
        let mut cells: Vec<Cell> =
            Vec::with_capacity(self.ds.len() + self.buf_words.len() + 8);
        cells.extend_from_slice(&self.ds);
        cells.extend_from_slice(&self.buf_words);
        cells.push(self.halt_error);
        cells.push(self.stack_error);
        cells.push(self.oom_error);
        if let Some(t) = &self.thrown {
            cells.push(t.arg);
        }
        if let Some(q) = &self.quit_requested {
            cells.push(*q);
        }
        let mut series = vec![self.lib, self.user, self.empty_block];
        if let Some(sys) = self.system {
            series.push(sys);
        }
        for call in &self.calls {
            cells.push(call.func);
            if let Some(block) = call.block {
                series.push(block);
            }
        }
        collect(&mut self.arena, &cells, &series)
    }

    /// Collection checkpoint; a no-op while collection is gated off.
    pub fn maybe_recycle(&mut self) {
        if self.booting || self.binds.in_use() {
            return;
        }
        self.recycle_now();
    }

    // ----- embedding API -------------------------------------------------

    /// Scan, bind, and evaluate source text against the user context.
    /// The error arm carries an `error!` cell (`form_error` renders it).
    pub fn eval_str(&mut self, source: &str) -> Result<Cell, Cell> {
        if let Some(policy) = self.policy {
            if !policy(PolicyOp::Eval) {
                let denied = crate::error::make_error(self, ErrKind::Protected, &[])
                    .unwrap_or(self.oom_error);
                return Err(denied);
            }
        }
        crate::eval::do_string(self, source)
    }

    /// Invoke a function bound in the user or lib context by name.
    pub fn call_by_name(&mut self, name: &str, args: &[Cell]) -> Result<Cell, Cell> {
        crate::eval::call_named(self, name, args)
    }

    /// Intern a name, returning its symbol.
    pub fn sym(&mut self, name: &str) -> Sym {
        self.symbols.intern(name)
    }

    /// An unbound word cell for a symbol.
    pub fn word_for(&self, sym: Sym) -> Cell {
        Cell::new(Value::Word(Word::unbound(sym)))
    }

    pub fn series_length(&self, id: SeriesId) -> usize {
        self.arena.get(id).len()
    }

    pub fn series_cell(&self, id: SeriesId, index: usize) -> Cell {
        self.arena.cell_at(id, index)
    }

    pub fn series_char(&self, id: SeriesId, index: usize) -> Option<char> {
        self.arena.char_at(id, index)
    }

    /// Render a value as readable source text.
    pub fn mold_value(&self, cell: &Cell) -> String {
        crate::mold::mold_cell(self, cell)
    }

    /// Render a value for humans.
    pub fn form_value(&self, cell: &Cell) -> String {
        crate::mold::form_cell(self, cell)
    }

    /// Render an error! cell as the standard two-line report.
    pub fn form_error(&self, cell: &Cell) -> String {
        crate::mold::form_error(self, cell)
    }

    /// The shared signal handle; hosts raise `SIG_ESCAPE` from interrupt
    /// handlers to request a halt.
    pub fn signal_handle(&self) -> SignalFlags {
        self.signals.clone()
    }

    /// Map a `quit` value to a process exit status: integers clamp, none
    /// and true are success, false is failure.
    pub fn exit_status(&self, cell: &Cell) -> i32 {
        match cell.value {
            Value::Integer(n) => n.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            Value::NoneVal | Value::Logic(true) | Value::Unset => 0,
            Value::Logic(false) => 1,
            _ => 0,
        }
    }

    /// Orderly teardown. Dropping does the same; this exists so hosts have
    /// an explicit point to log final statistics.
    pub fn shutdown(self) {
        let stats = self.arena.pools.stats();
        tracing::debug!(?stats, cycles = self.cycles, "engine shutdown");
    }

    /// True once an escape request is pending but not yet serviced.
    pub fn escape_requested(&self) -> bool {
        self.signals.pending(crate::signals::SIG_ESCAPE)
    }

    /// Consume a pending `quit`, if the last evaluation requested one.
    pub fn take_quit(&mut self) -> Option<Cell> {
        self.quit_requested.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_engines_are_independent() {
        let mut a = Engine::new(Config::default());
        let mut b = Engine::new(Config::default());
        let sym_a = a.sym("only-in-a");
        assert_eq!(b.symbols.lookup("only-in-a"), None);
        let _ = b.sym("only-in-b");
        assert_eq!(a.symbols.name(sym_a), "only-in-a");
    }

    #[test]
    fn test_exit_status_mapping() {
        let e = Engine::new(Config::default());
        assert_eq!(e.exit_status(&Cell::new(Value::Integer(3))), 3);
        assert_eq!(e.exit_status(&Cell::new(Value::Integer(1 << 40))), i32::MAX);
        assert_eq!(e.exit_status(&Cell::NONE), 0);
        assert_eq!(e.exit_status(&Cell::TRUE), 0);
        assert_eq!(e.exit_status(&Cell::FALSE), 1);
    }

    #[test]
    fn test_policy_hook_can_veto_eval() {
        fn deny(_op: PolicyOp) -> bool {
            false
        }
        let mut e = Engine::new(Config::new().with_policy(deny));
        assert!(e.eval_str("1 + 1").is_err());
    }

    #[test]
    fn test_slot_roundtrip() {
        let mut e = Engine::new(Config::default());
        let slot = e.push_slot();
        assert_eq!(e.slot(slot), Cell::UNSET);
        e.set_slot(slot, Cell::TRUE);
        assert_eq!(e.slot(slot), Cell::TRUE);
    }
}
