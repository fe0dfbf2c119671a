//! Molding: values back to text
//!
//! `mold` produces source-shaped text the scanner could read back; `form`
//! produces the human rendering (strings lose their quotes, words their
//! decorations stay). Both walk series through a visited set so
//! self-referential objects and blocks print `...` instead of recursing
//! forever.

use crate::engine::Engine;
use crate::error::{error_args, error_kind, error_near};
use crate::frame::frame_words;
use crate::series::SeriesId;
use crate::value::{Cell, CellFlags, Kind, Value};
use std::collections::HashSet;

/// Readable, scanner-shaped rendering.
pub fn mold_cell(engine: &Engine, cell: &Cell) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    mold_into(engine, cell, true, &mut seen, &mut out);
    out
}

/// Human rendering.
pub fn form_cell(engine: &Engine, cell: &Cell) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    mold_into(engine, cell, false, &mut seen, &mut out);
    out
}

fn mold_into(
    engine: &Engine,
    cell: &Cell,
    molded: bool,
    seen: &mut HashSet<SeriesId>,
    out: &mut String,
) {
    match cell.value {
        Value::End => out.push_str("#[end!]"),
        Value::Unset => {
            if molded {
                out.push_str("#[unset!]");
            }
        }
        Value::NoneVal => out.push_str("none"),
        Value::Logic(b) => out.push_str(if b { "true" } else { "false" }),
        Value::Integer(n) => out.push_str(&n.to_string()),
        Value::Decimal(f) => out.push_str(&format_decimal(f)),
        Value::Percent(f) => {
            out.push_str(&format_decimal(f * 100.0));
            out.push('%');
        }
        Value::Money(m) => {
            out.push('$');
            if m < 0 && m / 1000 == 0 {
                out.push('-');
            }
            let whole = m / 1000;
            let frac = (m % 1000).abs();
            if frac == 0 {
                out.push_str(&whole.to_string());
            } else {
                out.push_str(&format!("{whole}.{frac:03}"));
                while out.ends_with('0') {
                    out.pop();
                }
            }
        }
        Value::Char(ch) => {
            if molded {
                out.push_str("#\"");
                push_escaped(ch, out);
                out.push('"');
            } else {
                out.push(ch);
            }
        }
        Value::Pair(x, y) => out.push_str(&format!("{x}x{y}")),
        Value::Tuple(t) => {
            let parts: Vec<String> = t.parts().iter().map(|b| b.to_string()).collect();
            out.push_str(&parts.join("."));
        }
        Value::Time(nanos) => out.push_str(&format_time(nanos)),
        Value::Date(bits) => {
            let year = bits >> 9;
            let month = (bits >> 5) & 0xF;
            let day = bits & 0x1F;
            out.push_str(&format!("{day}-{month}-{year}"));
        }
        Value::Datatype(kind) => out.push_str(kind.name()),
        Value::Typeset(set) => {
            out.push_str("make typeset! [");
            let mut first = true;
            for tag in 0..Kind::COUNT as u8 {
                let kind = Kind::from_u8(tag).expect("dense");
                if set.has(kind) {
                    if !first {
                        out.push(' ');
                    }
                    out.push_str(kind.name());
                    first = false;
                }
            }
            out.push(']');
        }
        Value::Word(w) => out.push_str(engine.symbols.name(w.sym)),
        Value::SetWord(w) => {
            out.push_str(engine.symbols.name(w.sym));
            out.push(':');
        }
        Value::GetWord(w) => {
            out.push(':');
            out.push_str(engine.symbols.name(w.sym));
        }
        Value::LitWord(w) => {
            out.push('\'');
            out.push_str(engine.symbols.name(w.sym));
        }
        Value::Refinement(w) => {
            out.push('/');
            out.push_str(engine.symbols.name(w.sym));
        }
        Value::Issue(w) => {
            out.push('#');
            out.push_str(engine.symbols.name(w.sym));
        }
        Value::TypedWord(tw) => out.push_str(engine.symbols.name(tw.sym)),
        Value::Str(r) => {
            let text: String = string_tail(engine, r.series, r.index as usize);
            if molded {
                mold_string(&text, out);
            } else {
                out.push_str(&text);
            }
        }
        Value::File(r) => {
            out.push('%');
            out.push_str(&string_tail(engine, r.series, r.index as usize));
        }
        Value::Email(r) | Value::Url(r) => {
            out.push_str(&string_tail(engine, r.series, r.index as usize));
        }
        Value::Tag(r) => {
            out.push('<');
            out.push_str(&string_tail(engine, r.series, r.index as usize));
            out.push('>');
        }
        Value::Binary(r) => {
            out.push_str("#{");
            for b in engine.arena.bytes(r.series).iter().skip(r.index as usize) {
                out.push_str(&format!("{b:02X}"));
            }
            out.push('}');
        }
        Value::Block(r) => mold_list(engine, r.series, r.index as usize, molded, seen, out, "[", "]"),
        Value::Paren(r) => mold_list(engine, r.series, r.index as usize, molded, seen, out, "(", ")"),
        Value::Path(r) => mold_path(engine, r.series, r.index as usize, seen, out, "", ""),
        Value::SetPath(r) => mold_path(engine, r.series, r.index as usize, seen, out, "", ":"),
        Value::GetPath(r) => mold_path(engine, r.series, r.index as usize, seen, out, ":", ""),
        Value::LitPath(r) => mold_path(engine, r.series, r.index as usize, seen, out, "'", ""),
        Value::Object(frame) | Value::Module(frame) => {
            mold_frame(engine, frame, molded, seen, out)
        }
        Value::ErrorVal(_) => {
            if molded {
                out.push_str("make error! ");
            }
            out.push_str(&form_error(engine, cell));
        }
        Value::FrameHead { .. } => out.push_str("#[frame!]"),
        Value::Native(n) | Value::Action(n) => {
            out.push_str("make ");
            out.push_str(cell.value.kind().name());
            out.push(' ');
            mold_list(engine, n.spec, 0, true, seen, out, "[", "]");
        }
        Value::Function(f) | Value::Closure(f) => {
            out.push_str(if cell.value.kind() == Kind::Function { "func " } else { "closure " });
            mold_list(engine, f.spec, 0, true, seen, out, "[", "]");
            out.push(' ');
            mold_list(engine, f.body, 0, true, seen, out, "[", "]");
        }
        Value::Handle(_) => out.push_str("#[handle!]"),
    }
}

fn string_tail(engine: &Engine, id: SeriesId, index: usize) -> String {
    engine.arena.text(id).chars().skip(index).collect()
}

fn format_decimal(f: f64) -> String {
    if f.is_finite() && f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn format_time(nanos: i64) -> String {
    let sign = if nanos < 0 { "-" } else { "" };
    let n = nanos.abs();
    let hours = n / 3_600_000_000_000;
    let minutes = (n / 60_000_000_000) % 60;
    let secs = (n / 1_000_000_000) % 60;
    let frac = n % 1_000_000_000;
    if frac == 0 {
        format!("{sign}{hours}:{minutes:02}:{secs:02}")
    } else {
        let mut f = format!("{frac:09}");
        while f.ends_with('0') {
            f.pop();
        }
        format!("{sign}{hours}:{minutes:02}:{secs:02}.{f}")
    }
}

fn push_escaped(ch: char, out: &mut String) {
    match ch {
        '\n' => out.push_str("^/"),
        '\t' => out.push_str("^-"),
        '^' => out.push_str("^^"),
        '"' => out.push_str("^\""),
        _ => out.push(ch),
    }
}

/// Quoted form unless the text carries quotes or newlines; then braces.
fn mold_string(text: &str, out: &mut String) {
    if text.contains('"') || text.contains('\n') {
        out.push('{');
        for ch in text.chars() {
            match ch {
                '{' => out.push_str("^{"),
                '}' => out.push_str("^}"),
                '^' => out.push_str("^^"),
                _ => out.push(ch),
            }
        }
        out.push('}');
    } else {
        out.push('"');
        for ch in text.chars() {
            push_escaped(ch, out);
        }
        out.push('"');
    }
}

fn mold_list(
    engine: &Engine,
    id: SeriesId,
    from: usize,
    molded: bool,
    seen: &mut HashSet<SeriesId>,
    out: &mut String,
    open: &str,
    close: &str,
) {
    if !seen.insert(id) {
        out.push_str(open);
        out.push_str("...");
        out.push_str(close);
        return;
    }
    if molded {
        out.push_str(open);
    }
    let len = engine.arena.get(id).len();
    for i in from..len {
        let cell = engine.arena.cell_at(id, i);
        if i > from {
            if cell.flags.contains(CellFlags::LINE) {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        mold_into(engine, &cell, molded, seen, out);
    }
    if molded {
        out.push_str(close);
    }
    seen.remove(&id);
}

fn mold_path(
    engine: &Engine,
    id: SeriesId,
    from: usize,
    seen: &mut HashSet<SeriesId>,
    out: &mut String,
    prefix: &str,
    suffix: &str,
) {
    out.push_str(prefix);
    if !seen.insert(id) {
        out.push_str("...");
        return;
    }
    let len = engine.arena.get(id).len();
    for i in from..len {
        if i > from {
            out.push('/');
        }
        let cell = engine.arena.cell_at(id, i);
        mold_into(engine, &cell, true, seen, out);
    }
    seen.remove(&id);
    out.push_str(suffix);
}

fn mold_frame(
    engine: &Engine,
    frame: SeriesId,
    molded: bool,
    seen: &mut HashSet<SeriesId>,
    out: &mut String,
) {
    if !seen.insert(frame) {
        out.push_str("make object! [...]");
        return;
    }
    if molded {
        out.push_str("make object! [");
    }
    let words = frame_words(&engine.arena, frame);
    let len = engine.arena.get(frame).len();
    for slot in 1..len {
        let word = engine.arena.cell_at(words, slot);
        if word.flags.contains(CellFlags::HIDE) {
            continue;
        }
        if let Value::TypedWord(tw) = word.value {
            if slot > 1 {
                out.push(' ');
            }
            out.push_str(engine.symbols.name(tw.sym));
            out.push_str(": ");
            let value = engine.arena.cell_at(frame, slot);
            mold_into(engine, &value, molded, seen, out);
        }
    }
    if molded {
        out.push(']');
    }
    seen.remove(&frame);
}

/// The standard two-line error report.
pub fn form_error(engine: &Engine, cell: &Cell) -> String {
    let Some(kind) = error_kind(engine, cell) else {
        return "** Error: not an error value".to_string();
    };
    let args = error_args(engine, cell);
    let mut message = String::new();
    let template = kind.template();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            match chars.next() {
                Some(d @ '1'..='3') => {
                    let arg = &args[(d as u8 - b'1') as usize];
                    message.push_str(&form_cell(engine, arg));
                }
                Some(other) => {
                    message.push('$');
                    message.push(other);
                }
                None => message.push('$'),
            }
        } else {
            message.push(c);
        }
    }
    let mut report = format!("** {} error: {}", capitalize(kind.category()), message);
    if let Some(near) = error_near(engine, cell) {
        report.push_str("\n** Near: ");
        report.push_str(&mold_cell(engine, &near));
    }
    report
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};

    fn molded(src: &str) -> String {
        let mut e = Engine::new(Config::default());
        let v = e.eval_str(src).expect("evaluation failed");
        e.mold_value(&v)
    }

    #[test]
    fn test_mold_scalars() {
        assert_eq!(molded("42"), "42");
        assert_eq!(molded("-1.5"), "-1.5");
        assert_eq!(molded("3.0"), "3.0");
        assert_eq!(molded("true"), "true");
        assert_eq!(molded("none"), "none");
        assert_eq!(molded("50%"), "50.0%");
        assert_eq!(molded("1x2"), "1x2");
        assert_eq!(molded("$1.50"), "$1.5");
        assert_eq!(molded("10:30"), "10:30:00");
    }

    #[test]
    fn test_mold_strings_and_chars() {
        assert_eq!(molded(r#""hi there""#), r#""hi there""#);
        assert_eq!(molded(r#"#"x""#), r#"#"x""#);
        let mut e = Engine::new(Config::default());
        let v = e.eval_str(r#""hi""#).unwrap();
        assert_eq!(e.form_value(&v), "hi");
    }

    #[test]
    fn test_mold_blocks_and_paths() {
        assert_eq!(molded("[1 two \"three\"]"), "[1 two \"three\"]");
        assert_eq!(molded("'a/b/2"), "a/b/2");
        assert_eq!(molded("[a/b: :c/d 'e/f]"), "[a/b: :c/d 'e/f]");
    }

    #[test]
    fn test_mold_object() {
        assert_eq!(
            molded("make object! [a: 1 b: \"two\"]"),
            "make object! [a: 1 b: \"two\"]"
        );
    }

    #[test]
    fn test_cyclic_object_molds_finitely() {
        // The self slot makes every object cyclic; explicit cycles too.
        let text = molded("o: make object! [a: none] o/a: o o");
        assert!(text.contains("..."), "cycle must collapse to ...: {text}");
    }

    #[test]
    fn test_form_error_report() {
        let mut e = Engine::new(Config::default());
        let err = e.eval_str("boop").unwrap_err();
        let report = e.form_error(&err);
        assert!(report.starts_with("** Script error: boop has no value"), "{report}");
        assert!(report.contains("** Near:"), "{report}");
    }

    #[test]
    fn test_mold_unset_and_form_unset() {
        let mut e = Engine::new(Config::default());
        let v = e.eval_str("").unwrap();
        assert_eq!(e.mold_value(&v), "#[unset!]");
        assert_eq!(e.form_value(&v), "");
    }
}
