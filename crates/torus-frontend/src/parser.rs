//! # Torus Reader
//!
//! Parses s-expression source text into [`SExp`] values using the Pest parser
//! generator. The grammar lives in `grammar.pest` at the crate root.
//!
//! ```rust,ignore
//! use torus_frontend::parse_expr;
//!
//! let exp = parse_expr("(normal 0 1)")?;
//! assert_eq!(exp.as_list().map(|items| items.len()), Some(3));
//! ```

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::ast::SExp;
use crate::errors::{FrontendError, SourcePosition};

#[derive(Parser)]
#[grammar = "../grammar.pest"]
pub struct SExpParser;

/// Parses a sequence of top-level expressions.
pub fn parse_program(source: &str) -> Result<Vec<SExp>, FrontendError> {
    let mut pairs = SExpParser::parse(Rule::program, source)
        .map_err(|e| FrontendError::ParseError(e.to_string()))?;
    let mut out = Vec::new();
    if let Some(program) = pairs.next() {
        for inner in program.into_inner() {
            if inner.as_rule() == Rule::EOI {
                continue;
            }
            out.push(build_expr(inner)?);
        }
    }
    Ok(out)
}

/// Parses exactly one expression.
pub fn parse_expr(source: &str) -> Result<SExp, FrontendError> {
    let mut pairs = SExpParser::parse(Rule::single, source)
        .map_err(|e| FrontendError::ParseError(e.to_string()))?;
    let single = pairs
        .next()
        .ok_or_else(|| FrontendError::ParseError("empty input".into()))?;
    for inner in single.into_inner() {
        if inner.as_rule() != Rule::EOI {
            return build_expr(inner);
        }
    }
    Err(FrontendError::ParseError("empty input".into()))
}

fn position(pair: &Pair<Rule>) -> SourcePosition {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourcePosition {
        line: line as u32,
        column: column as u32,
    }
}

fn build_expr(pair: Pair<Rule>) -> Result<SExp, FrontendError> {
    match pair.as_rule() {
        Rule::number => {
            let text = pair.as_str();
            text.parse::<f64>()
                .map(SExp::Number)
                .map_err(|_| FrontendError::InvalidLiteral {
                    text: text.to_string(),
                    at: position(&pair),
                })
        }
        Rule::boolean => Ok(SExp::Bool(pair.as_str() == "true")),
        Rule::symbol => Ok(SExp::Symbol(pair.as_str().to_string())),
        Rule::quoted => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or_else(|| FrontendError::ParseError("quote without expression".into()))?;
            Ok(SExp::Quote(Box::new(build_expr(inner)?)))
        }
        Rule::list => {
            let items = pair
                .into_inner()
                .map(build_expr)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SExp::List(items))
        }
        other => Err(FrontendError::ParseError(format!(
            "unexpected rule {:?} at {}",
            other,
            position(&pair)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_application() {
        let exp = parse_expr("(normal (+ 1 2) 0.5)").unwrap();
        let items = exp.as_list().unwrap();
        assert_eq!(items[0], SExp::Symbol("normal".into()));
        assert_eq!(items[2], SExp::Number(0.5));
        assert_eq!(items[1].as_list().unwrap().len(), 3);
    }

    #[test]
    fn distinguishes_numbers_symbols_and_booleans() {
        let prog = parse_program("-3 - -x true truex 1e-3").unwrap();
        assert_eq!(
            prog,
            vec![
                SExp::Number(-3.0),
                SExp::Symbol("-".into()),
                SExp::Symbol("-x".into()),
                SExp::Bool(true),
                SExp::Symbol("truex".into()),
                SExp::Number(1e-3),
            ]
        );
    }

    #[test]
    fn quote_shorthand_and_long_form_unquote_alike() {
        let short = parse_expr("'(a b)").unwrap();
        let long = parse_expr("(quote (a b))").unwrap();
        assert_eq!(short.unquote(), long.unquote());
    }

    #[test]
    fn comments_are_ignored() {
        let prog = parse_program("; leading\n(flip 0.5) ; trailing\n").unwrap();
        assert_eq!(prog.len(), 1);
    }

    #[test]
    fn unbalanced_input_is_a_parse_error() {
        assert!(matches!(
            parse_expr("(normal 0 1"),
            Err(FrontendError::ParseError(_))
        ));
        assert!(parse_expr("1 2").is_err());
    }
}
