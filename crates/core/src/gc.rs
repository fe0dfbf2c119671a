//! Mark-sweep garbage collection
//!
//! Collection is stop-the-world and runs only at evaluator checkpoints (or
//! on an explicit `recycle`), so nothing here needs to tolerate concurrent
//! mutation. The mark phase walks series ids from the root set with an
//! explicit work list; cells store ids rather than pointers, so cyclic
//! object graphs terminate naturally on the mark flag.
//!
//! Manual series are *kept*: they are marked as roots (anything they
//! reference survives) and never swept, because their lifetime belongs to
//! the manuals list and its trap-unwind discipline. The sweep frees only
//! unmarked **managed** series. External series give up their header; the
//! borrowed payload is the caller's problem.
//!
//! Callers gate collection: it must not run during bootstrap, nor while the
//! bind table holds live entries (a binding pass is in progress and the
//! table's integers would be misread as meaningful by nothing - but the
//! frames it refers to may be mid-rewrite).

use crate::series::{Arena, SeriesData, SeriesFlags, SeriesId};
use crate::value::{Cell, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Series reached from the roots.
    pub marked: usize,
    /// Managed series reclaimed by the sweep.
    pub freed: usize,
}

/// Push every series id a cell refers to.
fn cell_refs(value: &Value, out: &mut Vec<SeriesId>) {
    match value {
        Value::Word(w)
        | Value::SetWord(w)
        | Value::GetWord(w)
        | Value::LitWord(w)
        | Value::Refinement(w)
        | Value::Issue(w) => {
            if let Some(frame) = w.binding {
                out.push(frame);
            }
        }
        Value::Binary(r)
        | Value::Str(r)
        | Value::File(r)
        | Value::Email(r)
        | Value::Url(r)
        | Value::Tag(r)
        | Value::Block(r)
        | Value::Paren(r)
        | Value::Path(r)
        | Value::SetPath(r)
        | Value::GetPath(r)
        | Value::LitPath(r) => out.push(r.series),
        Value::Object(f) | Value::Module(f) | Value::ErrorVal(f) => out.push(*f),
        Value::FrameHead { words, spec } => {
            out.push(*words);
            if let Some(spec) = spec {
                out.push(*spec);
            }
        }
        Value::Native(n) | Value::Action(n) => {
            out.push(n.spec);
            out.push(n.words);
        }
        Value::Function(f) | Value::Closure(f) => {
            out.push(f.spec);
            out.push(f.words);
            out.push(f.body);
        }
        // Inline payloads reference nothing.
        _ => {}
    }
}

/// One full collection over the arena.
///
/// `root_cells` are cells living outside any series (data stack, call
/// frames, singletons); `root_series` are ids held directly (context
/// frames, scratch buffers). The manuals and keep lists are implicit roots.
pub fn collect(arena: &mut Arena, root_cells: &[Cell], root_series: &[SeriesId]) -> GcStats {
    let mut work: Vec<SeriesId> = Vec::with_capacity(64);

    for cell in root_cells {
        cell_refs(&cell.value, &mut work);
    }
    work.extend_from_slice(root_series);
    work.extend_from_slice(arena.manuals());
    work.extend_from_slice(arena.kept());

    // Mark phase: flag every reachable node, recursing into cell arrays.
    let mut marked = 0;
    while let Some(id) = work.pop() {
        let node = arena.get_mut(id);
        if node.flags.contains(SeriesFlags::MARKED) {
            continue;
        }
        node.flags |= SeriesFlags::MARKED;
        marked += 1;
        if let SeriesData::Cells(_) = node.data {
            for cell in arena.cells(id) {
                cell_refs(&cell.value, &mut work);
            }
        }
    }

    // Sweep phase: reclaim unmarked managed nodes via the kill path (they
    // are not on the manuals list); everything else just drops its mark.
    let mut freed = 0;
    let ids: Vec<SeriesId> = arena.live_ids().collect();
    for id in ids {
        let node = arena.get_mut(id);
        if node.flags.contains(SeriesFlags::MARKED) {
            node.flags.remove(SeriesFlags::MARKED);
        } else if node.is_managed() && !node.flags.contains(SeriesFlags::KEEP) {
            arena.kill(id);
            freed += 1;
        }
    }

    arena.pools.reset_ballast();
    let stats = GcStats { marked, freed };
    tracing::debug!(marked = stats.marked, freed = stats.freed, "recycle complete");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pools;
    use crate::series::SeriesClass;
    use crate::signals::SignalFlags;
    use crate::value::SeriesRef;

    fn arena() -> Arena {
        Arena::new(Pools::new(false, 1 << 20, SignalFlags::new()))
    }

    fn block_cell(id: SeriesId) -> Cell {
        Cell::new(Value::Block(SeriesRef::head(id)))
    }

    #[test]
    fn test_unreferenced_managed_series_is_reclaimed() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 4).unwrap();
        a.manage(id);
        let stats = collect(&mut a, &[], &[]);
        assert_eq!(stats.freed, 1);
        assert_eq!(a.live_count(), 0);
    }

    #[test]
    fn test_root_cell_keeps_series_alive() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 4).unwrap();
        a.manage(id);
        let root = block_cell(id);
        let stats = collect(&mut a, &[root], &[]);
        assert_eq!(stats.freed, 0);
        assert_eq!(a.live_count(), 1);
    }

    #[test]
    fn test_reachability_is_transitive() {
        let mut a = arena();
        let inner = a.make(SeriesClass::Bytes, 8).unwrap();
        let outer = a.make(SeriesClass::Cells, 2).unwrap();
        a.push_cell(outer, Cell::new(Value::Str(SeriesRef::head(inner)))).unwrap();
        a.manage(inner);
        a.manage(outer);

        let root = block_cell(outer);
        collect(&mut a, &[root], &[]);
        assert_eq!(a.live_count(), 2, "inner string reachable through outer block");

        collect(&mut a, &[], &[]);
        assert_eq!(a.live_count(), 0, "both reclaimed once the root is gone");
    }

    #[test]
    fn test_cycles_are_harmless() {
        let mut a = arena();
        let x = a.make(SeriesClass::Cells, 2).unwrap();
        let y = a.make(SeriesClass::Cells, 2).unwrap();
        a.push_cell(x, block_cell(y)).unwrap();
        a.push_cell(y, block_cell(x)).unwrap();
        a.manage(x);
        a.manage(y);

        collect(&mut a, &[block_cell(x)], &[]);
        assert_eq!(a.live_count(), 2);

        let stats = collect(&mut a, &[], &[]);
        assert_eq!(stats.freed, 2, "a dead cycle is fully reclaimed");
    }

    #[test]
    fn test_manual_series_survive_without_roots() {
        let mut a = arena();
        let manual = a.make(SeriesClass::Cells, 2).unwrap();
        let child = a.make(SeriesClass::Bytes, 8).unwrap();
        a.push_cell(manual, Cell::new(Value::Binary(SeriesRef::head(child)))).unwrap();
        a.manage(child); // child is managed but only reachable via the manual

        collect(&mut a, &[], &[]);
        assert_eq!(a.live_count(), 2, "manuals are kept and keep their referents");
    }

    #[test]
    fn test_keep_list_guards_a_managed_series() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        a.manage(id);
        a.keep_push(id);
        collect(&mut a, &[], &[]);
        assert_eq!(a.live_count(), 1);

        a.keep_truncate(0);
        collect(&mut a, &[], &[]);
        assert_eq!(a.live_count(), 0);
    }

    #[test]
    fn test_mark_flags_are_cleared_after_collection() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        a.manage(id);
        collect(&mut a, &[block_cell(id)], &[]);
        assert!(!a.get(id).flags.contains(SeriesFlags::MARKED));
    }

    #[test]
    fn test_frame_references_are_traced() {
        let mut a = arena();
        let words = a.make(SeriesClass::Cells, 2).unwrap();
        let values = a.make(SeriesClass::Cells, 2).unwrap();
        a.push_cell(values, Cell::new(Value::FrameHead { words, spec: None })).unwrap();
        a.manage(words);
        a.manage(values);

        collect(&mut a, &[Cell::new(Value::Object(values))], &[]);
        assert_eq!(a.live_count(), 2, "word list reachable through the frame head");
    }

    #[test]
    fn test_ballast_reset_after_collection() {
        let sig = SignalFlags::new();
        let mut a = Arena::new(Pools::new(false, 128, sig.clone()));
        let id = a.make(SeriesClass::Bytes, 256).unwrap();
        a.manage(id);
        assert!(sig.pending(crate::signals::SIG_RECYCLE));
        sig.take(crate::signals::SIG_RECYCLE);
        collect(&mut a, &[], &[]);
        assert_eq!(a.pools.stats().ballast, 128);
    }
}
