//! Bootstrap: from the embedded boot block to a working library context
//!
//! The boot block travels inside the binary as a zlib blob produced by the
//! build script. Startup decompresses it, checks the uncompressed length
//! against the build-time constant, scans it, and walks the result:
//!
//! 1. the first element must be a block of datatype names in tag order,
//!    terminated by an `end!` symbol - each becomes a lib word holding its
//!    datatype value (plus the pseudo-typeset group words);
//! 2. the second element pairs native names with spec blocks, in the same
//!    order as the native dispatch table; each becomes a lib word holding
//!    a native (or infix action) value.
//!
//! Everything here runs with `Engine::booting` set: the collector stays
//! off and any failure is a panic, which the host reports as a fatal exit.
//! No error may be raised before the pre-made error values exist.

use crate::engine::{BootLevel, Engine};
use crate::error::{ErrKind, make_error};
use crate::frame::{append_frame, frame_words};
use crate::series::SeriesId;
use crate::symbol::Sym;
use crate::value::{
    Cell, CellFlags, Kind, NativeRef, ParamClass, Tuple, Typeset, TypedWord, Value,
};
use std::io::Read;

/// The compressed boot block, embedded by `build.rs`.
static BOOT_BLOB: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/boot.tarn.z"));

/// Pseudo-typeset group names installed beside the datatypes.
const TYPE_GROUPS: [&str; 10] = [
    "any-type!",
    "any-value!",
    "any-word!",
    "any-block!",
    "any-path!",
    "any-string!",
    "any-function!",
    "any-object!",
    "number!",
    "series!",
];

/// Assemble the engine's library context from the embedded boot block.
pub fn startup(engine: &mut Engine, level: BootLevel) {
    debug_assert!(engine.booting);

    // The lib and user frames were born manual; root them for good.
    for frame in [engine.lib, engine.user] {
        let words = frame_words(&engine.arena, frame);
        engine.arena.manage(frame);
        engine.arena.manage(words);
    }

    let boot = load_boot_block(engine);
    let types = match engine.arena.cell_at(boot, 0).value {
        Value::Block(r) => r.series,
        other => panic!("boot block must start with the type block, found {other:?}"),
    };
    install_datatypes(engine, types);

    let natives = match engine.arena.cell_at(boot, 1).value {
        Value::Block(r) => r.series,
        other => panic!("boot block missing the native specs, found {other:?}"),
    };
    install_natives(engine, natives);
    install_constants(engine);

    // Pre-made errors: deliverable without allocating, forever.
    engine.halt_error =
        make_error(engine, ErrKind::Halt, &[]).expect("bootstrap allocation");
    engine.stack_error =
        make_error(engine, ErrKind::StackOverflow, &[]).expect("bootstrap allocation");
    engine.oom_error =
        make_error(engine, ErrKind::OutOfMemory, &[]).expect("bootstrap allocation");

    if level == BootLevel::Full {
        engine.system = Some(build_system_object(engine));
    }
    engine.arena.manage_deep(boot);
    tracing::debug!(symbols = engine.symbols.count(), "bootstrap complete");
}

/// Decompress, length-check, and scan the embedded boot block.
fn load_boot_block(engine: &mut Engine) -> SeriesId {
    let expected: usize = env!("TARN_BOOT_LEN")
        .parse()
        .expect("build script exports the boot length");
    let mut text = Vec::with_capacity(expected);
    flate2::read::ZlibDecoder::new(BOOT_BLOB)
        .read_to_end(&mut text)
        .expect("boot block decompression failed");
    assert_eq!(text.len(), expected, "boot block length check failed");
    let source = std::str::from_utf8(&text).expect("boot block is not UTF-8");
    match crate::scan::scan_source(engine, source) {
        Ok(block) => block,
        Err(e) => panic!("boot block does not scan: {e}"),
    }
}

/// Walk the datatype name block; names must match the kind table exactly
/// and close with the `end!` terminator.
fn install_datatypes(engine: &mut Engine, types: SeriesId) {
    let len = engine.arena.get(types).len();
    assert_eq!(len, Kind::COUNT + 1, "datatype block arity drifted");
    for tag in 0..Kind::COUNT {
        let kind = Kind::from_u8(tag as u8).expect("dense kinds");
        let cell = engine.arena.cell_at(types, tag);
        let sym = cell.value.word_sym().expect("datatype names are words");
        let name = engine.symbols.name(sym);
        assert_eq!(name, kind.name(), "boot type list out of order at {tag}");
        define_lib(engine, sym, Cell::new(Value::Datatype(kind)), CellFlags::LOCK);
    }
    let terminator = engine.arena.cell_at(types, Kind::COUNT);
    let sym = terminator.value.word_sym().expect("terminator is a word");
    assert_eq!(engine.symbols.name(sym), "end!", "boot type list is unterminated");

    for group in TYPE_GROUPS {
        let set = Typeset::group_by_name(group).expect("group names are known");
        let sym = engine.symbols.intern(group);
        define_lib(engine, sym, Cell::new(Value::Typeset(set)), CellFlags::LOCK);
    }
}

/// Walk the `name: [spec]` pairs and wire them to the dispatch table.
fn install_natives(engine: &mut Engine, natives: SeriesId) {
    let table = crate::natives::NATIVES;
    let len = engine.arena.get(natives).len();
    assert_eq!(len, table.len() * 2, "boot natives and dispatch table drifted");
    for (id, def) in table.iter().enumerate() {
        let name_cell = engine.arena.cell_at(natives, id * 2);
        let sym = match name_cell.value {
            Value::SetWord(w) => w.sym,
            other => panic!("native {id} name is not a set-word: {other:?}"),
        };
        assert_eq!(
            engine.symbols.name(sym),
            def.name,
            "native table order does not match the boot block"
        );
        let spec = match engine.arena.cell_at(natives, id * 2 + 1).value {
            Value::Block(r) => r,
            other => panic!("native {} has no spec block: {other:?}", def.name),
        };
        let words = crate::natives::make_params(engine, spec)
            .expect("boot native specs must parse");
        engine.arena.manage(words);
        engine.arena.manage_deep(spec.series);
        let nref = NativeRef { id: id as u32, spec: spec.series, words };
        let mut cell = Cell::new(if def.infix {
            Value::Action(nref)
        } else {
            Value::Native(nref)
        });
        if def.infix {
            cell.flags |= CellFlags::INFIX;
        }
        define_lib(engine, sym, cell, CellFlags::empty());
    }
}

/// The words every script assumes exist.
fn install_constants(engine: &mut Engine) {
    let entries: [(&str, Cell); 5] = [
        ("true", Cell::TRUE),
        ("false", Cell::FALSE),
        ("none", Cell::NONE),
        ("yes", Cell::TRUE),
        ("no", Cell::FALSE),
    ];
    for (name, value) in entries {
        let sym = engine.symbols.intern(name);
        define_lib(engine, sym, value, CellFlags::LOCK);
    }
}

fn define_lib(engine: &mut Engine, sym: Sym, value: Cell, flags: CellFlags) {
    let lib = engine.lib;
    let slot = append_frame(
        &mut engine.arena,
        lib,
        TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
        flags,
    )
    .expect("bootstrap allocation");
    engine
        .arena
        .set_cell(lib, slot as usize, value)
        .expect("lib frame is writable during boot");
}

/// The `system` object: engine identity and a few live counters.
fn build_system_object(engine: &mut Engine) -> SeriesId {
    let frame = crate::frame::make_frame(&mut engine.arena, &mut engine.symbols, 3, true)
        .expect("bootstrap allocation");
    let fields: [(&str, Cell); 3] = [
        ("version", Cell::new(Value::Tuple(Tuple::new(&[0, 3, 0])))),
        ("product", {
            let sym = engine.symbols.intern("tarn");
            Cell::new(Value::Word(crate::value::Word::unbound(sym)))
        }),
        ("legacy", Cell::new(Value::Logic(engine.legacy))),
    ];
    for (name, value) in fields {
        let sym = engine.symbols.intern(name);
        let slot = append_frame(
            &mut engine.arena,
            frame,
            TypedWord::new(sym, ParamClass::Normal, Typeset::any_type()),
            CellFlags::empty(),
        )
        .expect("bootstrap allocation");
        engine
            .arena
            .set_cell(frame, slot as usize, value)
            .expect("system frame is writable during boot");
    }
    let words = frame_words(&engine.arena, frame);
    engine.arena.manage_deep(frame);
    engine.arena.manage(words);
    let sym = engine.symbols.intern("system");
    define_lib(engine, sym, Cell::new(Value::Object(frame)), CellFlags::empty());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;

    #[test]
    fn test_boot_installs_datatypes_and_natives() {
        let mut e = Engine::new(Config::default());
        assert_eq!(e.eval_str("integer!").unwrap().value, Value::Datatype(Kind::Integer));
        assert_eq!(e.eval_str("type? :print").unwrap().value, Value::Datatype(Kind::Native));
        assert_eq!(e.eval_str("type? :+").unwrap().value, Value::Datatype(Kind::Action));
    }

    #[test]
    fn test_boot_constants() {
        let mut e = Engine::new(Config::default());
        assert_eq!(e.eval_str("true").unwrap().value, Value::Logic(true));
        assert_eq!(e.eval_str("no").unwrap().value, Value::Logic(false));
        assert_eq!(e.eval_str("none").unwrap().value, Value::NoneVal);
    }

    #[test]
    fn test_system_object_present_at_full_boot() {
        let mut e = Engine::new(Config::default());
        assert_eq!(
            e.eval_str("system/product").unwrap().value.kind(),
            Kind::Word
        );
        assert_eq!(e.eval_str("system/version").unwrap().value.kind(), Kind::Tuple);
    }

    #[test]
    fn test_core_boot_skips_system() {
        let mut e = Engine::new(Config::new().with_boot(BootLevel::Core));
        assert!(e.system.is_none());
        assert!(e.eval_str("system").is_err());
        // Everything else still works.
        assert_eq!(e.eval_str("1 + 1").unwrap().value, Value::Integer(2));
    }

    #[test]
    fn test_premade_errors_exist() {
        let e = Engine::new(Config::default());
        assert!(crate::error::is_halt(&e, &e.halt_error));
        assert_eq!(
            crate::error::error_kind(&e, &e.stack_error),
            Some(ErrKind::StackOverflow)
        );
        assert_eq!(
            crate::error::error_kind(&e, &e.oom_error),
            Some(ErrKind::OutOfMemory)
        );
    }
}
