//! Tagged value cells and the datatype taxonomy
//!
//! A `Cell` is the unit the evaluator moves around: a small `Copy` struct
//! holding option flags plus a `Value` enum whose discriminant is the type
//! tag. Cells never own heap memory directly; anything variable-sized lives
//! in a series and the cell stores the series id and an index.
//!
//! Key rules:
//! - Assignment is a plain bit copy. There is no per-kind clone; deep copies
//!   are explicit operations on series.
//! - `End` cells only terminate array series and must never be read as data.
//! - "Thrown" is a flag on the cell, not a kind: control-flow escapes travel
//!   as ordinary values with the thrown bit set until something catches them.
//! - `Unset` is a real value produced by real expressions, not absence.

use crate::series::SeriesId;
use crate::symbol::Sym;
use bitflags::bitflags;

/// Type tags for every datatype the engine knows about.
///
/// The discriminant doubles as the bit number in a [`Typeset`], so the order
/// is frozen: appending is fine, reordering is not. The boot block lists the
/// canonical names in exactly this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Kind {
    End = 0,
    Unset,
    NoneVal,
    Logic,
    Integer,
    Decimal,
    Percent,
    Money,
    Char,
    Pair,
    Tuple,
    Time,
    Date,
    Datatype,
    Typeset,
    Word,
    SetWord,
    GetWord,
    LitWord,
    Refinement,
    Issue,
    Binary,
    Str,
    File,
    Email,
    Url,
    Tag,
    Block,
    Paren,
    Path,
    SetPath,
    GetPath,
    LitPath,
    Object,
    Module,
    ErrorVal,
    Frame,
    Native,
    Action,
    Function,
    Closure,
    Handle,
}

/// Canonical datatype names, indexed by `Kind` discriminant.
const KIND_NAMES: [&str; Kind::COUNT] = [
    "end!",
    "unset!",
    "none!",
    "logic!",
    "integer!",
    "decimal!",
    "percent!",
    "money!",
    "char!",
    "pair!",
    "tuple!",
    "time!",
    "date!",
    "datatype!",
    "typeset!",
    "word!",
    "set-word!",
    "get-word!",
    "lit-word!",
    "refinement!",
    "issue!",
    "binary!",
    "string!",
    "file!",
    "email!",
    "url!",
    "tag!",
    "block!",
    "paren!",
    "path!",
    "set-path!",
    "get-path!",
    "lit-path!",
    "object!",
    "module!",
    "error!",
    "frame!",
    "native!",
    "action!",
    "function!",
    "closure!",
    "handle!",
];

impl Kind {
    /// Number of datatypes. Must stay below 64 so a `Typeset` covers them.
    pub const COUNT: usize = 42;

    /// The canonical datatype name, with the trailing `!`.
    pub fn name(self) -> &'static str {
        KIND_NAMES[self as usize]
    }

    /// Recover a kind from its discriminant, if valid.
    pub fn from_u8(tag: u8) -> Option<Kind> {
        if (tag as usize) < Kind::COUNT {
            // Discriminants are dense starting at zero.
            Some(unsafe { std::mem::transmute::<u8, Kind>(tag) })
        } else {
            None
        }
    }

    /// Look up a kind by its canonical name.
    pub fn from_name(name: &str) -> Option<Kind> {
        KIND_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|i| Kind::from_u8(i as u8))
    }

    /// The typeset bit for this kind.
    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

/// A 64-bit set of datatype kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Typeset(pub u64);

impl Typeset {
    pub const EMPTY: Typeset = Typeset(0);

    /// Every real datatype (excludes the end marker).
    pub fn any_type() -> Typeset {
        let all = (1u64 << Kind::COUNT) - 1;
        Typeset(all & !Kind::End.bit())
    }

    /// Like [`Typeset::any_type`] but without `unset!`; the default for
    /// function parameters that did not name their types.
    pub fn any_value() -> Typeset {
        Typeset(Typeset::any_type().0 & !Kind::Unset.bit())
    }

    pub fn of(kinds: &[Kind]) -> Typeset {
        let mut bits = 0;
        for k in kinds {
            bits |= k.bit();
        }
        Typeset(bits)
    }

    pub fn with(self, kind: Kind) -> Typeset {
        Typeset(self.0 | kind.bit())
    }

    pub fn union(self, other: Typeset) -> Typeset {
        Typeset(self.0 | other.0)
    }

    pub fn has(self, kind: Kind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    // Pseudo-type groups used by parameter specs and path dispatch.

    pub fn any_word() -> Typeset {
        Typeset::of(&[
            Kind::Word,
            Kind::SetWord,
            Kind::GetWord,
            Kind::LitWord,
            Kind::Refinement,
            Kind::Issue,
        ])
    }

    pub fn any_block() -> Typeset {
        Typeset::of(&[
            Kind::Block,
            Kind::Paren,
            Kind::Path,
            Kind::SetPath,
            Kind::GetPath,
            Kind::LitPath,
        ])
    }

    pub fn any_path() -> Typeset {
        Typeset::of(&[Kind::Path, Kind::SetPath, Kind::GetPath, Kind::LitPath])
    }

    pub fn any_string() -> Typeset {
        Typeset::of(&[Kind::Str, Kind::File, Kind::Email, Kind::Url, Kind::Tag])
    }

    pub fn any_function() -> Typeset {
        Typeset::of(&[Kind::Native, Kind::Action, Kind::Function, Kind::Closure])
    }

    pub fn any_object() -> Typeset {
        Typeset::of(&[Kind::Object, Kind::Module, Kind::ErrorVal])
    }

    pub fn number() -> Typeset {
        Typeset::of(&[Kind::Integer, Kind::Decimal, Kind::Percent, Kind::Money])
    }

    pub fn series() -> Typeset {
        Typeset::any_block().union(Typeset::any_string()).with(Kind::Binary)
    }

    /// Resolve a pseudo-typeset name (`any-block!`, `number!`, ...).
    pub fn group_by_name(name: &str) -> Option<Typeset> {
        match name {
            "any-type!" => Some(Typeset::any_type()),
            "any-value!" => Some(Typeset::any_value()),
            "any-word!" => Some(Typeset::any_word()),
            "any-block!" => Some(Typeset::any_block()),
            "any-path!" => Some(Typeset::any_path()),
            "any-string!" => Some(Typeset::any_string()),
            "any-function!" => Some(Typeset::any_function()),
            "any-object!" => Some(Typeset::any_object()),
            "number!" => Some(Typeset::number()),
            "series!" => Some(Typeset::series()),
            _ => None,
        }
    }
}

bitflags! {
    /// Option bits carried by every cell, orthogonal to its kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CellFlags: u8 {
        /// The scanner saw a line break before this value.
        const LINE = 1 << 0;
        /// A function value that takes its first argument from the left.
        const INFIX = 1 << 1;
        /// Re-dispatch marker used when a path lands on a function.
        const REDO = 1 << 2;
        /// Frame slot hidden from binding and reflection.
        const HIDE = 1 << 3;
        /// Frame slot that rejects writes.
        const LOCK = 1 << 4;
        /// The cell is an unwinding control transfer, not a data value.
        const THROWN = 1 << 5;
    }
}

/// How a function parameter consumes its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ParamClass {
    /// Evaluate the next expression.
    #[default]
    Normal,
    /// Take the next value literally, except parens/get-words ("soft quote").
    Literal,
    /// Take the next value exactly as it appears ("hard quote").
    Get,
    /// Optional flag supplied through the call path.
    Refinement,
}

/// A word cell payload: interned symbol plus its binding.
///
/// `index > 0` selects a slot in a persistent frame, `index < 0` a relative
/// slot in a function's argument frame (resolved against the live call
/// chain), and `index == 0` is the frame self-reference. `binding == None`
/// means the word is unbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    pub sym: Sym,
    pub binding: Option<SeriesId>,
    pub index: i32,
}

impl Word {
    pub fn unbound(sym: Sym) -> Word {
        Word { sym, binding: None, index: 0 }
    }

    pub fn bound(sym: Sym, frame: SeriesId, index: i32) -> Word {
        Word { sym, binding: Some(frame), index }
    }
}

/// A frame word-list entry: the binding is replaced by a typeset of the
/// value kinds the slot accepts, plus the parameter class for argument
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedWord {
    pub sym: Sym,
    pub class: ParamClass,
    pub types: Typeset,
}

impl TypedWord {
    pub fn new(sym: Sym, class: ParamClass, types: Typeset) -> TypedWord {
        TypedWord { sym, class, types }
    }
}

/// A position inside a series: the unit of every block/string/path value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesRef {
    pub series: SeriesId,
    pub index: u32,
}

impl SeriesRef {
    pub fn head(series: SeriesId) -> SeriesRef {
        SeriesRef { series, index: 0 }
    }
}

/// Payload of interpreted function kinds: spec block, word list, body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRef {
    pub spec: SeriesId,
    pub words: SeriesId,
    pub body: SeriesId,
}

/// Payload of native function kinds: an index into the native dispatch
/// table plus the scanned spec block and the collected word list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeRef {
    pub id: u32,
    pub spec: SeriesId,
    pub words: SeriesId,
}

/// Tuple payload: up to seven byte-sized components, stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tuple {
    pub len: u8,
    pub bytes: [u8; 7],
}

impl Tuple {
    pub fn new(parts: &[u8]) -> Tuple {
        let mut t = Tuple::default();
        t.len = parts.len().min(7) as u8;
        t.bytes[..t.len as usize].copy_from_slice(&parts[..t.len as usize]);
        t
    }

    pub fn parts(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// The tagged union itself. Everything is `Copy`; series payloads are ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    End,
    Unset,
    NoneVal,
    Logic(bool),
    Integer(i64),
    Decimal(f64),
    Percent(f64),
    /// Fixed-point, in milli-units (three decimal places).
    Money(i64),
    Char(char),
    Pair(i32, i32),
    Tuple(Tuple),
    /// Nanoseconds since midnight.
    Time(i64),
    /// Packed year/month/day: (year << 9) | (month << 5) | day.
    Date(u32),
    Datatype(Kind),
    Typeset(Typeset),
    Word(Word),
    SetWord(Word),
    GetWord(Word),
    LitWord(Word),
    Refinement(Word),
    Issue(Word),
    TypedWord(TypedWord),
    Binary(SeriesRef),
    Str(SeriesRef),
    File(SeriesRef),
    Email(SeriesRef),
    Url(SeriesRef),
    Tag(SeriesRef),
    Block(SeriesRef),
    Paren(SeriesRef),
    Path(SeriesRef),
    SetPath(SeriesRef),
    GetPath(SeriesRef),
    LitPath(SeriesRef),
    /// The frame (values series) of an object.
    Object(SeriesId),
    Module(SeriesId),
    ErrorVal(SeriesId),
    /// Frame self-descriptor stored at values[0]: word list + spec.
    FrameHead { words: SeriesId, spec: Option<SeriesId> },
    Native(NativeRef),
    Action(NativeRef),
    Function(FuncRef),
    Closure(FuncRef),
    Handle(usize),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::End => Kind::End,
            Value::Unset => Kind::Unset,
            Value::NoneVal => Kind::NoneVal,
            Value::Logic(_) => Kind::Logic,
            Value::Integer(_) => Kind::Integer,
            Value::Decimal(_) => Kind::Decimal,
            Value::Percent(_) => Kind::Percent,
            Value::Money(_) => Kind::Money,
            Value::Char(_) => Kind::Char,
            Value::Pair(..) => Kind::Pair,
            Value::Tuple(_) => Kind::Tuple,
            Value::Time(_) => Kind::Time,
            Value::Date(_) => Kind::Date,
            Value::Datatype(_) => Kind::Datatype,
            Value::Typeset(_) => Kind::Typeset,
            Value::Word(_) => Kind::Word,
            Value::SetWord(_) => Kind::SetWord,
            Value::GetWord(_) => Kind::GetWord,
            Value::LitWord(_) => Kind::LitWord,
            Value::Refinement(_) => Kind::Refinement,
            Value::Issue(_) => Kind::Issue,
            // Typed words read back as words; the typed form is an option
            // of the representation, not a separate datatype.
            Value::TypedWord(_) => Kind::Word,
            Value::Binary(_) => Kind::Binary,
            Value::Str(_) => Kind::Str,
            Value::File(_) => Kind::File,
            Value::Email(_) => Kind::Email,
            Value::Url(_) => Kind::Url,
            Value::Tag(_) => Kind::Tag,
            Value::Block(_) => Kind::Block,
            Value::Paren(_) => Kind::Paren,
            Value::Path(_) => Kind::Path,
            Value::SetPath(_) => Kind::SetPath,
            Value::GetPath(_) => Kind::GetPath,
            Value::LitPath(_) => Kind::LitPath,
            Value::Object(_) => Kind::Object,
            Value::Module(_) => Kind::Module,
            Value::ErrorVal(_) => Kind::ErrorVal,
            Value::FrameHead { .. } => Kind::Frame,
            Value::Native(_) => Kind::Native,
            Value::Action(_) => Kind::Action,
            Value::Function(_) => Kind::Function,
            Value::Closure(_) => Kind::Closure,
            Value::Handle(_) => Kind::Handle,
        }
    }

    /// The symbol of any word-class value, typed words included.
    pub fn word_sym(&self) -> Option<Sym> {
        match self {
            Value::Word(w)
            | Value::SetWord(w)
            | Value::GetWord(w)
            | Value::LitWord(w)
            | Value::Refinement(w)
            | Value::Issue(w) => Some(w.sym),
            Value::TypedWord(tw) => Some(tw.sym),
            _ => None,
        }
    }

    /// The binding payload of any plain word-class value.
    pub fn word(&self) -> Option<&Word> {
        match self {
            Value::Word(w)
            | Value::SetWord(w)
            | Value::GetWord(w)
            | Value::LitWord(w)
            | Value::Refinement(w)
            | Value::Issue(w) => Some(w),
            _ => None,
        }
    }

    pub fn word_mut(&mut self) -> Option<&mut Word> {
        match self {
            Value::Word(w)
            | Value::SetWord(w)
            | Value::GetWord(w)
            | Value::LitWord(w)
            | Value::Refinement(w)
            | Value::Issue(w) => Some(w),
            _ => None,
        }
    }

    /// The series position of any series-backed value.
    pub fn series_ref(&self) -> Option<SeriesRef> {
        match self {
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
            | Value::LitPath(r) => Some(*r),
            _ => None,
        }
    }

    pub fn series_ref_mut(&mut self) -> Option<&mut SeriesRef> {
        match self {
            Value::Binary(r)
            | Value::Str(r)
            | Value::File(r)
            | Value::Email(r)
            | Value::Url(r)
            | Value::Tag(r)
            | Value::Block(r)
            | Value::Paren(r)
            | Value::SetPath(r)
            | Value::Path(r)
            | Value::GetPath(r)
            | Value::LitPath(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_block_like(&self) -> bool {
        Typeset::any_block().has(self.kind())
    }

    pub fn is_string_like(&self) -> bool {
        Typeset::any_string().has(self.kind())
    }

    pub fn is_word_like(&self) -> bool {
        self.word_sym().is_some()
    }

    pub fn is_function_like(&self) -> bool {
        Typeset::any_function().has(self.kind())
    }

    /// Everything is truthy except `none` and `false`. Unset is truthy by
    /// this rule but callers that care (conditionals) reject it first.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::NoneVal | Value::Logic(false))
    }
}

/// One 32-byte slot: option flags plus the tagged value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub flags: CellFlags,
    pub value: Value,
}

impl Cell {
    pub const END: Cell = Cell { flags: CellFlags::empty(), value: Value::End };
    pub const UNSET: Cell = Cell { flags: CellFlags::empty(), value: Value::Unset };
    pub const NONE: Cell = Cell { flags: CellFlags::empty(), value: Value::NoneVal };
    pub const TRUE: Cell = Cell { flags: CellFlags::empty(), value: Value::Logic(true) };
    pub const FALSE: Cell = Cell { flags: CellFlags::empty(), value: Value::Logic(false) };

    pub fn new(value: Value) -> Cell {
        Cell { flags: CellFlags::empty(), value }
    }

    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    pub fn is_end(&self) -> bool {
        matches!(self.value, Value::End)
    }

    pub fn is_thrown(&self) -> bool {
        self.flags.contains(CellFlags::THROWN)
    }

    pub fn set_thrown(&mut self, on: bool) {
        self.flags.set(CellFlags::THROWN, on);
    }

    pub fn is_infix(&self) -> bool {
        self.flags.contains(CellFlags::INFIX)
    }

    pub fn truthy(&self) -> bool {
        self.value.is_truthy()
    }

    /// Strip transient flags when a value is stored into a slot. Line and
    /// thrown markers belong to the position a cell came from, not to the
    /// data itself.
    pub fn stored(mut self) -> Cell {
        self.flags.remove(CellFlags::LINE | CellFlags::THROWN | CellFlags::REDO);
        self
    }
}

impl Default for Cell {
    fn default() -> Cell {
        Cell::END
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_cell_layout() {
        // The cell is the unit of every series copy and frame slot; the
        // whole memory model sizes around it.
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            size_of::<Cell>(),
            32,
            "Cell must be exactly 32 bytes on 64-bit hosts, got {}",
            size_of::<Cell>()
        );
        assert_eq!(align_of::<Cell>(), 8);
        // Bit-copy semantics require Copy; this is a compile-time check.
        fn assert_copy<T: Copy>() {}
        assert_copy::<Cell>();
    }

    #[test]
    fn test_kind_names_align_with_discriminants() {
        assert_eq!(Kind::End.name(), "end!");
        assert_eq!(Kind::SetWord.name(), "set-word!");
        assert_eq!(Kind::Handle.name(), "handle!");
        for tag in 0..Kind::COUNT as u8 {
            let kind = Kind::from_u8(tag).expect("dense discriminants");
            assert_eq!(kind as u8, tag);
            assert_eq!(Kind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(Kind::from_u8(Kind::COUNT as u8), None);
    }

    #[test]
    fn test_typeset_groups() {
        let words = Typeset::any_word();
        assert!(words.has(Kind::SetWord));
        assert!(!words.has(Kind::Block));

        let any = Typeset::any_type();
        assert!(!any.has(Kind::End), "end marker is not a real type");
        assert!(any.has(Kind::Unset));
        assert!(!Typeset::any_value().has(Kind::Unset));
    }

    #[test]
    fn test_truthiness() {
        assert!(Cell::TRUE.truthy());
        assert!(!Cell::FALSE.truthy());
        assert!(!Cell::NONE.truthy());
        assert!(Cell::new(Value::Integer(0)).truthy());
    }

    #[test]
    fn test_thrown_is_a_flag_not_a_kind() {
        let mut cell = Cell::UNSET;
        cell.set_thrown(true);
        assert!(cell.is_thrown());
        assert_eq!(cell.kind(), Kind::Unset);
        // Storing a thrown cell into a slot strips the marker.
        assert!(!cell.stored().is_thrown());
    }
}
