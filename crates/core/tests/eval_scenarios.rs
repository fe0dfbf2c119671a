//! End-to-end evaluation scenarios
//!
//! These drive the whole stack - scanner, binder, evaluator, natives, and
//! collector - through the public embedding API, the way a host would.

use tarn_core::{Cell, Config, Engine, ErrKind, Kind, SIG_ESCAPE, Value, error_kind};

fn eval(src: &str) -> Cell {
    let mut engine = Engine::new(Config::default());
    engine.eval_str(src).expect("evaluation failed")
}

fn eval_err(src: &str) -> (Engine, Cell) {
    let mut engine = Engine::new(Config::default());
    let err = engine.eval_str(src).expect_err("expected an error");
    (engine, err)
}

#[test]
fn infix_is_left_to_right_at_one_precedence() {
    // Lookahead is suppressed while an infix argument evaluates, so the
    // chain folds strictly left to right: (1 + 2) * 3.
    assert_eq!(eval("1 + 2 * 3").value, Value::Integer(9));
    assert_eq!(eval("2 * 3 + 4").value, Value::Integer(10));
    assert_eq!(eval("1 + (2 * 3)").value, Value::Integer(7));
    // Prefix argument evaluation does run the lookahead.
    assert_eq!(eval("negate 1 + 2").value, Value::Integer(-3));
}

#[test]
fn words_resolve_from_the_user_context() {
    assert_eq!(eval("x: 10 x").value, Value::Integer(10));
    assert_eq!(eval("x: 10 y: x + 1 y").value, Value::Integer(11));
}

#[test]
fn foreach_returns_the_last_iteration_value() {
    assert_eq!(eval("foreach i [1 2 3] [i]").value, Value::Integer(3));
}

#[test]
fn loop_variables_are_local_to_the_loop() {
    assert_eq!(eval("repeat n 3 [n]").value, Value::Integer(3));
    // Observing n outside finds nothing: the body copy bound privately.
    assert_eq!(eval("repeat n 3 [n] value? 'n").value, Value::Logic(false));
}

#[test]
fn object_spec_binds_before_it_evaluates() {
    // `a` inside the spec must resolve to the object's own slot.
    assert_eq!(eval("o: make object! [a: 1 b: a + 1] o/b").value, Value::Integer(2));
    // And `self` refers to the object under construction.
    assert_eq!(eval("o: make object! [a: 9 me: self] o/me/a").value, Value::Integer(9));
}

#[test]
fn steady_state_allocation_is_reclaimed() {
    // Thousands of unreferenced blocks must not accumulate: the ballast
    // keeps requesting collections and the collector keeps up.
    let mut engine = Engine::new(Config::new().with_ballast(64 * 1024));
    engine
        .eval_str("loop 20000 [append copy [] 1]")
        .expect("allocation loop failed");
    engine.recycle_now();
    assert!(
        engine.arena.live_count() < 2000,
        "dead generations survived: {} series live",
        engine.arena.live_count()
    );
}

#[test]
fn bind_table_is_clean_after_every_pass() {
    let mut engine = Engine::new(Config::default());
    engine
        .eval_str("o: make object! [a: 1] f: func [x] [x] loop 2 [f o/a]")
        .expect("evaluation failed");
    assert!(engine.binds.is_clear(), "bind table left dirty");
    // Failing passes restore the table too.
    let _ = engine.eval_str("func [x x] [x]").expect_err("duplicate params");
    assert!(engine.binds.is_clear());
}

#[test]
fn manuals_are_balanced_across_evaluations() {
    let mut engine = Engine::new(Config::default());
    assert!(engine.arena.manuals().is_empty(), "boot left manual series behind");
    engine.eval_str("b: reduce [1 + 1] o: make object! [a: b]").expect("evaluation failed");
    assert!(engine.arena.manuals().is_empty(), "evaluation leaked manual series");
    let _ = engine.eval_str("1 / 0").expect_err("division error");
    assert!(engine.arena.manuals().is_empty(), "error unwind leaked manual series");
}

#[test]
fn array_series_keep_their_end_marker() {
    let mut engine = Engine::new(Config::default());
    let value = engine
        .eval_str("b: copy [] loop 100 [append b 1] b")
        .expect("evaluation failed");
    let r = value.value.series_ref().expect("block result");
    let len = engine.series_length(r.series);
    assert_eq!(len, 100);
    assert!(engine.series_cell(r.series, len).is_end());
}

#[test]
fn cells_copy_by_value_and_alias_their_series() {
    // Assignment is a bit copy: both words see one series.
    assert_eq!(eval("b: [1 2] c: b append b 3 length? c").value, Value::Integer(3));
    // An explicit copy breaks the aliasing.
    assert_eq!(eval("b: [1 2] c: copy b append b 3 length? c").value, Value::Integer(2));
}

#[test]
fn closures_rebind_their_bodies_per_call() {
    // The returned inner function keeps the closure's argument alive.
    assert_eq!(eval("f: closure [x] [does [x]] g: f 7 g").value, Value::Integer(7));
    // A plain function's body is stack-relative: once the call is gone,
    // the word has no context.
    let (engine, err) = eval_err("f: func [x] [does [x]] g: f 7 g");
    assert_eq!(error_kind(&engine, &err), Some(ErrKind::NoRelative));
}

#[test]
fn thrown_values_cross_argument_evaluation() {
    // The throw happens while binding f's second argument; the half-built
    // call is discarded and the catch still sees it.
    assert_eq!(eval("f: func [a b] [a + b] catch [f 1 throw 5]").value, Value::Integer(5));
}

#[test]
fn set_word_result_flows_through() {
    assert_eq!(eval("x: y: 2 + 3 x").value, Value::Integer(5));
    // A set-path expression evaluates to the stored value as well.
    assert_eq!(eval("b: [1 2] x: b/2: 9 x").value, Value::Integer(9));
}

#[test]
fn get_path_refuses_refinements_on_functions() {
    let (engine, err) = eval_err(":append/only");
    assert_eq!(error_kind(&engine, &err), Some(ErrKind::BadPath));
}

#[test]
fn escape_signal_halts_evaluation() {
    let mut engine = Engine::new(Config::default());
    engine.signal_handle().raise(SIG_ESCAPE);
    let err = engine.eval_str("loop 100000000 [1 + 1]").expect_err("expected a halt");
    assert_eq!(error_kind(&engine, &err), Some(ErrKind::Halt));
    // The engine is intact afterwards.
    assert_eq!(engine.eval_str("1 + 1").unwrap().value, Value::Integer(2));
}

#[test]
fn attempt_does_not_catch_a_halt() {
    let mut engine = Engine::new(Config::default());
    engine.signal_handle().raise(SIG_ESCAPE);
    // attempt would turn an ordinary error into none; the halt must pass
    // through its halt-unaware trap and reach the top.
    let err = engine
        .eval_str("attempt [loop 100000000 [1 + 1]]")
        .expect_err("halt escapes attempt");
    assert_eq!(error_kind(&engine, &err), Some(ErrKind::Halt));
}

#[test]
fn uncaught_error_reports_and_engine_survives() {
    let mut engine = Engine::new(Config::default());
    let err = engine.eval_str("1 + \"no\"").expect_err("type error");
    let report = engine.form_error(&err);
    assert!(report.starts_with("** "), "unexpected report: {report}");
    assert_eq!(engine.eval_str("3 * 4").unwrap().value, Value::Integer(12));
}

#[test]
fn call_by_name_applies_user_functions() {
    let mut engine = Engine::new(Config::default());
    engine.eval_str("double: func [n] [n * 2]").expect("definition failed");
    let result = engine
        .call_by_name("double", &[Cell::new(Value::Integer(21))])
        .expect("call failed");
    assert_eq!(result.value, Value::Integer(42));
    // Non-functions read back as plain values.
    engine.eval_str("answer: 42").expect("definition failed");
    assert_eq!(engine.call_by_name("answer", &[]).unwrap().value, Value::Integer(42));
}

#[test]
fn deep_object_paths() {
    assert_eq!(
        eval("a: make object! [b: make object! [c: 5]] a/b/c").value,
        Value::Integer(5)
    );
    assert_eq!(
        eval("a: make object! [b: make object! [c: 5]] a/b/c: 6 a/b/c").value,
        Value::Integer(6)
    );
}

#[test]
fn quit_surfaces_to_the_host() {
    let mut engine = Engine::new(Config::default());
    engine.eval_str("quit/return 3").expect("quit is not an error");
    let quit = engine.take_quit().expect("quit value pending");
    assert_eq!(engine.exit_status(&quit), 3);
    assert!(engine.take_quit().is_none(), "quit is consumed once");
}

#[test]
fn scan_errors_become_syntax_errors() {
    let (engine, err) = eval_err("[1 2");
    assert_eq!(error_kind(&engine, &err), Some(ErrKind::Syntax));
}

#[test]
fn strings_widen_transparently() {
    assert_eq!(eval(r#"s: copy "ab" append s #"∆" length? s"#).value, Value::Integer(3));
    assert_eq!(eval(r#"s: copy "ab" append s #"∆" s/3"#).value, Value::Char('∆'));
}

mod env_switches {
    use super::*;
    use serial_test::serial;

    // Process environment is global state; these must not interleave.

    #[test]
    #[serial]
    fn always_malloc_engine_still_works() {
        unsafe { std::env::set_var("TARN_ALWAYS_MALLOC", "1") };
        let mut engine = Engine::new(Config::default());
        assert!(engine.arena.pools.always_malloc());
        assert_eq!(
            engine.eval_str("foreach i [1 2 3] [i * i]").unwrap().value,
            Value::Integer(9)
        );
        unsafe { std::env::remove_var("TARN_ALWAYS_MALLOC") };
    }

    #[test]
    #[serial]
    fn legacy_flag_reaches_the_system_object() {
        unsafe { std::env::set_var("TARN_LEGACY", "1") };
        let mut engine = Engine::new(Config::default());
        assert_eq!(engine.eval_str("system/legacy").unwrap().value, Value::Logic(true));
        unsafe { std::env::remove_var("TARN_LEGACY") };

        let mut engine = Engine::new(Config::default());
        assert_eq!(engine.eval_str("system/legacy").unwrap().value, Value::Logic(false));
    }
}
