use torus_core::engine::exp::Exp;
use torus_core::engine::value::Value;
use torus_frontend::{parse_program, SExp};

#[test]
fn program_reader_keeps_forms_in_order() {
    let forms = parse_program(
        "; a comment
         (assume x (normal 0 1))
         (observe (normal x 1) 0.5)",
    )
    .unwrap();
    assert_eq!(forms.len(), 2);
    assert_eq!(forms[0].as_list().unwrap()[0].as_symbol(), Some("assume"));
    assert_eq!(forms[1].as_list().unwrap()[2].as_number(), Some(0.5));
}

#[test]
fn special_forms_are_desugared() {
    let lambda = Exp::parse("(lambda (x) (+ x 1))").unwrap();
    match lambda {
        Exp::Apply(items) => {
            assert_eq!(items[0], Exp::sym("make_csp"));
            assert!(matches!(items[2], Exp::Value(Value::Exp(_))));
        }
        other => panic!("unexpected lowering {:?}", other),
    }

    let branch = Exp::parse("(if true 1 2)").unwrap();
    match branch {
        Exp::Apply(items) => assert_eq!(items[0], Exp::sym("branch")),
        other => panic!("unexpected lowering {:?}", other),
    }
}

#[test]
fn quoted_symbols_become_constants() {
    assert_eq!(Exp::parse("'h").unwrap(), Exp::Value(Value::symbol("h")));
    assert!(matches!(
        torus_frontend::parse_expr("'h").unwrap(),
        SExp::Quote(_)
    ));
}

#[test]
fn malformed_source_is_a_parse_error() {
    assert!(matches!(
        Exp::parse("(normal 0 1"),
        Err(torus_core::ExecError::ParseError(_))
    ));
    assert!(matches!(
        Exp::parse("(lambda x)"),
        Err(torus_core::ExecError::ValidationError(_))
    ));
}
