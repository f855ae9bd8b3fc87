//! This module implements the DoxRain line recognizer.
//!
//! DoxRain source is line oriented: every line is recognised on its own and yields at most one
//! statement. Recognition is prefix dispatch in a fixed order, first match wins:
//!
//! 1. blank lines yield nothing, lines starting with `#` are comments
//! 2. keyword lines (`show `, `var `, `function `, `if `, `loop `, `import `, `webserver `,
//!    `input `, `class `, `api `)
//! 3. a bare `end`
//! 4. a math line, found by searching for ` <op> ` with the operators tried in the order
//!    `+ - * / % ^`. This is list order, not precedence, and only the first occurrence of the
//!    winning operator splits the line
//! 5. anything else yields nothing
//!
//! Developer notes:
//!
//! * The math scan is substring based. A string literal that happens to contain ` - ` is
//!   recognised as a subtraction. Keywords are checked first so `show a - b` stays a `show`.
//!
//! * Block openers (`if`, `loop`, `function`, `class`) are flat by default: they get an empty
//!   body and `end` is a comment. `BlockMode::Nested` matches every `end` with the nearest
//!   open block instead and collects the lines in between into that block's body.
//!
//! * Literal conversion happens at parse time. `loop x` or `var n = 3.x` are parse errors,
//!   which is different from a line that is simply not recognised.

use std::convert::TryFrom;
use std::iter::FromIterator;
use std::str::FromStr;
use std::rc::Rc;

use log::debug;
use pom::parser::{end, is_a, list, none_of, one_of, sym, Parser};
use thiserror::Error;

#[cfg(test)]
use pretty_assertions::assert_eq;

use crate::lang::ast::*;
use crate::lang::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// A numeric literal was recognised by shape but failed to convert
    InvalidLiteral,
    /// A keyword line is missing a required part
    Malformed,
    /// Unbalanced `end` or an unterminated block
    Block,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{position}: {message}")]
pub struct ParseError {
    pub position: Position,
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    fn new(kind: ParseErrorKind, position: Position, message: impl Into<String>) -> Self {
        Self {
            position,
            kind,
            message: message.into(),
        }
    }
}

type ParseResult<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Every line is its own statement, `end` is a no-op
    Flat,
    /// `end` closes the nearest open block and lines in between form its body
    Nested,
}

impl Default for BlockMode {
    fn default() -> Self {
        BlockMode::Flat
    }
}

const BLOCK_KEYWORDS: [&str; 4] = ["if ", "loop ", "function ", "class "];

const MATH_OPERATORS: [MathOperator; 6] = [
    MathOperator::Plus,
    MathOperator::Minus,
    MathOperator::Multiply,
    MathOperator::Divide,
    MathOperator::Modulo,
    MathOperator::Power,
];

fn space<'a>() -> Parser<'a, char, ()> {
    one_of(" \t").repeat(0..).discard()
}

fn ident<'a>() -> Parser<'a, char, String> {
    (is_a(|c: char| c.is_ascii_alphabetic() || c == '_')
        + is_a(|c: char| c.is_ascii_alphanumeric() || c == '_').repeat(0..))
    .collect()
    .map(String::from_iter)
}

fn unsigned<'a>() -> Parser<'a, char, u64> {
    one_of("0123456789")
        .repeat(1..)
        .map(String::from_iter)
        .convert(|s| u64::from_str(&s))
}

/// `name(a, b)`, the header of a function definition in nested mode
fn function_header<'a>() -> Parser<'a, char, (String, Vec<String>)> {
    let param = space() * ident() - space();
    space() * ident() - space() - sym('(') + list(param, sym(',')) - space() - sym(')') - space()
        - end()
}

/// `name(arg, arg)`, a call line in nested mode
///
/// Arguments are raw text, trimmed. They are bound as strings when the call runs.
fn call_stmt<'a>() -> Parser<'a, char, (String, Vec<String>)> {
    let arg = none_of(",()")
        .repeat(1..)
        .map(String::from_iter)
        .map(|s| s.trim().to_string());
    let call = ident() - space() - sym('(') + list(arg, sym(',')) - sym(')') - space() - end();

    call.map(|(name, args)| (name, args.into_iter().filter(|a| !a.is_empty()).collect()))
}

fn parse_count(text: &str, position: Position) -> ParseResult<u64> {
    let input: Vec<char> = text.chars().collect();
    let result = (unsigned() - end()).parse(&input).map_err(|_| {
        ParseError::new(
            ParseErrorKind::InvalidLiteral,
            position,
            format!("Invalid loop count '{}': expected a non-negative integer", text),
        )
    });
    result
}

fn parse_port(text: &str, position: Position) -> ParseResult<u16> {
    let input: Vec<char> = text.chars().collect();
    let result = (unsigned().convert(u16::try_from) - end())
        .parse(&input)
        .map_err(|_| {
            ParseError::new(
                ParseErrorKind::InvalidLiteral,
                position,
                format!("Invalid port '{}': expected an integer in 0..=65535", text),
            )
        });
    result
}

fn parse_var(rest: &str, position: Position) -> ParseResult<StatementKind> {
    let idx = rest.find(" = ").ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::Malformed,
            position,
            "Variable declaration missing assignment",
        )
    })?;

    let name = rest[..idx].trim();
    if name.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            position,
            "Variable declaration missing a name",
        ));
    }

    let value = Value::from_literal(&rest[idx + 3..])
        .map_err(|e| ParseError::new(ParseErrorKind::InvalidLiteral, position, e.to_string()))?;

    Ok(StatementKind::VarDecl(name.into(), value))
}

fn parse_function(rest: &str, position: Position, mode: BlockMode) -> ParseResult<StatementKind> {
    let missing_params = || {
        ParseError::new(
            ParseErrorKind::Malformed,
            position,
            "Function declaration missing parameters",
        )
    };

    let (name, params) = match mode {
        // Only the name is taken, parameters need the nested form
        BlockMode::Flat => {
            let idx = rest.find('(').ok_or_else(missing_params)?;
            (rest[..idx].trim().to_string(), Vec::new())
        }
        BlockMode::Nested => {
            if !rest.contains('(') {
                return Err(missing_params());
            }
            let input: Vec<char> = rest.chars().collect();
            let header = function_header().parse(&input).map_err(|_| {
                ParseError::new(
                    ParseErrorKind::Malformed,
                    position,
                    format!("Invalid function header '{}'", rest),
                )
            })?;
            header
        }
    };

    if name.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            position,
            "Function declaration missing a name",
        ));
    }

    Ok(StatementKind::FunctionDef(Rc::new(FunctionDef {
        name: Identifier(name),
        params: params.into_iter().map(Identifier).collect(),
        body: Vec::new(),
    })))
}

fn parse_api(rest: &str, position: Position) -> ParseResult<StatementKind> {
    match rest.split_once(' ') {
        Some((method, url)) if !method.is_empty() && !url.trim().is_empty() => Ok(
            StatementKind::ApiCall(url.trim().to_string(), method.to_string()),
        ),
        _ => Err(ParseError::new(
            ParseErrorKind::Malformed,
            position,
            "API call requires a method and a url",
        )),
    }
}

fn parse_keyword(
    line: &str,
    position: Position,
    mode: BlockMode,
) -> ParseResult<Option<StatementKind>> {
    let kind = if let Some(rest) = line.strip_prefix("show ") {
        StatementKind::Show(rest.to_string())
    } else if let Some(rest) = line.strip_prefix("var ") {
        parse_var(rest, position)?
    } else if let Some(rest) = line.strip_prefix("function ") {
        parse_function(rest, position, mode)?
    } else if let Some(rest) = line.strip_prefix("if ") {
        StatementKind::If(rest.to_string(), Vec::new())
    } else if let Some(rest) = line.strip_prefix("loop ") {
        StatementKind::Loop(parse_count(rest, position)?, Vec::new())
    } else if let Some(rest) = line.strip_prefix("import ") {
        StatementKind::Import(rest.to_string())
    } else if let Some(rest) = line.strip_prefix("webserver ") {
        StatementKind::WebServer(parse_port(rest, position)?)
    } else if let Some(rest) = line.strip_prefix("input ") {
        StatementKind::Input(rest.to_string())
    } else if let Some(rest) = line.strip_prefix("class ") {
        StatementKind::ClassDef(rest.into(), Vec::new())
    } else if let Some(rest) = line.strip_prefix("api ") {
        parse_api(rest, position)?
    } else {
        return Ok(None);
    };

    Ok(Some(kind))
}

fn parse_math(line: &str) -> Option<StatementKind> {
    MATH_OPERATORS.iter().find_map(|op| {
        let needle = format!(" {} ", op);
        line.find(&needle).map(|idx| {
            StatementKind::MathOp(
                *op,
                line[..idx].to_string(),
                line[idx + needle.len()..].to_string(),
            )
        })
    })
}

fn parse_call(line: &str) -> Option<StatementKind> {
    let input: Vec<char> = line.chars().collect();
    let call = call_stmt()
        .parse(&input)
        .ok()
        .map(|(name, args)| StatementKind::FunctionCall(Identifier(name), args));
    call
}

fn parse_statement(
    line: &str,
    position: Position,
    mode: BlockMode,
) -> ParseResult<Option<Statement>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let kind = if line.starts_with('#') {
        Some(StatementKind::Comment(line.to_string()))
    } else if let Some(kind) = parse_keyword(line, position, mode)? {
        Some(kind)
    } else if line == "end" {
        Some(StatementKind::Comment("end".to_string()))
    } else if mode == BlockMode::Nested {
        parse_call(line).or_else(|| parse_math(line))
    } else {
        parse_math(line)
    };

    Ok(kind.map(|k| Statement::new(k, position)))
}

/// Parse a single line into at most one statement
///
/// `Ok(None)` means the line was not recognised (or blank). Callers may skip or warn.
pub fn parse_line(line: &str, position: Position) -> ParseResult<Option<Statement>> {
    parse_statement(line, position, BlockMode::Flat)
}

/// Parse a whole program
///
/// Failures are returned in place, in source order, so the caller can report them and keep
/// going with the statements that did parse. Unrecognised lines are dropped.
pub fn parse(source: &str, mode: BlockMode) -> Vec<ParseResult<Statement>> {
    let mut out = Vec::new();
    let mut open: Vec<Statement> = Vec::new();

    for (idx, raw) in source.lines().enumerate() {
        let line = raw.trim();
        let position = Position::new(idx, raw.len() - raw.trim_start().len());

        if mode == BlockMode::Nested && line == "end" {
            match open.pop() {
                Some(block) => push_statement(&mut open, &mut out, block),
                None => out.push(Err(ParseError::new(
                    ParseErrorKind::Block,
                    position,
                    "'end' without an open block",
                ))),
            }
            continue;
        }

        match parse_statement(line, position, mode) {
            Ok(Some(stmt)) if mode == BlockMode::Nested && stmt.is_block() => open.push(stmt),
            Ok(Some(stmt)) => push_statement(&mut open, &mut out, stmt),
            Ok(None) => {
                if !line.is_empty() {
                    debug!("{}: skipping unrecognised line: {}", position, line);
                }
            }
            Err(e) => out.push(Err(e)),
        }
    }

    for block in open {
        out.push(Err(ParseError::new(
            ParseErrorKind::Block,
            block.position,
            format!("Unterminated block '{}': missing 'end'", block),
        )));
    }

    out
}

fn push_statement(
    open: &mut Vec<Statement>,
    out: &mut Vec<ParseResult<Statement>>,
    stmt: Statement,
) {
    match open.last_mut().and_then(Statement::body_mut) {
        Some(body) => body.push(stmt),
        None => out.push(Ok(stmt)),
    }
}

/// Number of blocks left open at the end of `input`
///
/// The REPL uses this to keep reading lines until every nested block has its `end`.
pub fn block_depth(input: &str) -> usize {
    input.lines().map(str::trim).fold(0, |depth, line| {
        if line == "end" {
            depth.saturating_sub(1)
        } else if BLOCK_KEYWORDS.iter().any(|k| line.starts_with(k)) {
            depth + 1
        } else {
            depth
        }
    })
}

#[cfg(test)]
fn kind_of(line: &str) -> Option<StatementKind> {
    parse_line(line, Position::default())
        .expect("Failed to parse")
        .map(|s| s.kind)
}

#[cfg(test)]
fn parse_ok(source: &str, mode: BlockMode) -> Vec<Statement> {
    parse(source, mode)
        .into_iter()
        .map(|r| r.expect("Failed to parse"))
        .collect()
}

#[test]
fn test_keywords() {
    let data = vec![
        ("show hello world", StatementKind::Show("hello world".to_string())),
        ("show $x", StatementKind::Show("$x".to_string())),
        ("if $x == 5", StatementKind::If("$x == 5".to_string(), vec![])),
        ("loop 3", StatementKind::Loop(3, vec![])),
        ("loop 0", StatementKind::Loop(0, vec![])),
        ("import dox-core", StatementKind::Import("dox-core".to_string())),
        ("webserver 8080", StatementKind::WebServer(8080)),
        ("input Enter value:", StatementKind::Input("Enter value:".to_string())),
        ("class Point", StatementKind::ClassDef("Point".into(), vec![])),
        (
            "api GET http://example.com",
            StatementKind::ApiCall("http://example.com".to_string(), "GET".to_string()),
        ),
        ("# a comment", StatementKind::Comment("# a comment".to_string())),
        ("end", StatementKind::Comment("end".to_string())),
    ];

    for (input, expected) in data {
        assert_eq!(kind_of(input), Some(expected));
    }
}

#[test]
fn test_var_literals() {
    let data = vec![
        ("var x = 5", Value::Integer(5)),
        ("var x = -5", Value::Integer(-5)),
        ("var x = 5.0", Value::Float(5.0)),
        ("var x = true", Value::Boolean(true)),
        ("var x = false", Value::Boolean(false)),
        ("var x = hello", Value::String("hello".to_string())),
        ("var x = a = b", Value::String("a = b".to_string())),
    ];

    for (input, expected) in data {
        assert_eq!(
            kind_of(input),
            Some(StatementKind::VarDecl("x".into(), expected))
        );
    }
}

#[test]
fn test_function_flat() {
    // Flat mode never parses the parameter list
    match kind_of("function greet(name, other)") {
        Some(StatementKind::FunctionDef(def)) => {
            assert_eq!(def.name, Identifier::from("greet"));
            assert!(def.params.is_empty());
            assert!(def.body.is_empty());
        }
        other => panic!("Expected function definition, got {:?}", other),
    }
}

#[test]
fn test_math_scan() {
    let data = vec![
        ("5 + 3", (MathOperator::Plus, "5", "3")),
        ("$x * 2", (MathOperator::Multiply, "$x", "2")),
        ("10 / 0", (MathOperator::Divide, "10", "0")),
        ("7 % 2", (MathOperator::Modulo, "7", "2")),
        ("2 ^ 8", (MathOperator::Power, "2", "8")),
        // Operator list order, not precedence: `+` is tried before `*`
        ("2 * 3 + 4", (MathOperator::Plus, "2 * 3", "4")),
        // First occurrence of the winning operator splits the line
        ("1 - 2 - 3", (MathOperator::Minus, "1", "2 - 3")),
        // Spaced hyphen inside what was meant as text
        ("well - known", (MathOperator::Minus, "well", "known")),
    ];

    for (input, (op, lhs, rhs)) in data {
        assert_eq!(
            kind_of(input),
            Some(StatementKind::MathOp(op, lhs.to_string(), rhs.to_string()))
        );
    }
}

#[test]
fn test_unrecognised() {
    let data = vec!["", "   ", "show", "hello", "5+3", "-5", "greet(x)", "x = 5", "ending"];

    for input in data {
        assert_eq!(kind_of(input), None, "'{}' should not be recognised", input);
    }
}

#[test]
fn test_keyword_wins_over_math() {
    assert_eq!(
        kind_of("show 1 + 2"),
        Some(StatementKind::Show("1 + 2".to_string()))
    );
    assert_eq!(
        kind_of("var x = a + b"),
        Some(StatementKind::VarDecl(
            "x".into(),
            Value::String("a + b".to_string())
        ))
    );
}

#[test]
fn test_parse_errors() {
    let data = vec![
        ("loop abc", ParseErrorKind::InvalidLiteral),
        ("loop -3", ParseErrorKind::InvalidLiteral),
        ("loop 3 times", ParseErrorKind::InvalidLiteral),
        ("webserver http", ParseErrorKind::InvalidLiteral),
        ("webserver 70000", ParseErrorKind::InvalidLiteral),
        ("var x = 3.x", ParseErrorKind::InvalidLiteral),
        ("var x = 12abc", ParseErrorKind::InvalidLiteral),
        ("var x = 1 + 2", ParseErrorKind::InvalidLiteral),
        ("var x = 1.5e400", ParseErrorKind::InvalidLiteral),
        ("var x", ParseErrorKind::Malformed),
        ("var  = 3", ParseErrorKind::Malformed),
        ("function greet", ParseErrorKind::Malformed),
        ("function (x)", ParseErrorKind::Malformed),
        ("api GET", ParseErrorKind::Malformed),
    ];

    for (input, kind) in data {
        let position = Position::new(4, 2);
        match parse_line(input, position) {
            Err(e) => {
                assert_eq!(e.kind, kind, "wrong error kind for '{}'", input);
                assert_eq!(e.position, position);
                assert!(e.to_string().starts_with("line 5: "));
            }
            Ok(s) => panic!("'{}' should fail to parse, got {:?}", input, s),
        }
    }
}

#[test]
fn test_var_round_trip() {
    let data = vec![
        "var v = 42",
        "var v = -3",
        "var v = 2.5",
        "var v = 0.1234567",
        "var v = 3.14159265",
        "var v = 123456789012345678901234567890.0",
        "var v = true",
        "var v = word",
    ];

    for input in data {
        let first = match kind_of(input) {
            Some(StatementKind::VarDecl(_, value)) => value,
            other => panic!("Expected var, got {:?}", other),
        };
        let rendered = format!("var v = {}", first.to_literal());
        match kind_of(&rendered) {
            Some(StatementKind::VarDecl(_, value)) => {
                assert_eq!(value.type_str(), first.type_str());
                assert_eq!(value, first, "{} rendered as {}", input, rendered);
            }
            other => panic!("Expected var, got {:?}", other),
        }
    }
}

#[test]
fn test_positions() {
    let stmts = parse_ok("show a\n\n    show b\n# note", BlockMode::Flat);
    let positions: Vec<Position> = stmts.iter().map(|s| s.position).collect();
    assert_eq!(
        positions,
        vec![Position::new(0, 0), Position::new(2, 4), Position::new(3, 0)]
    );
}

#[test]
fn test_flat_blocks() {
    let source = "loop 2\n    show tick\nend";
    let stmts = parse_ok(source, BlockMode::Flat);
    let kinds: Vec<StatementKind> = stmts.into_iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StatementKind::Loop(2, vec![]),
            StatementKind::Show("tick".to_string()),
            StatementKind::Comment("end".to_string()),
        ]
    );
}

#[test]
fn test_nested_blocks() {
    let source = "loop 2\n    if $x == 5\n        show hit\n    end\n    show tick\nend\nshow done";
    let stmts = parse_ok(source, BlockMode::Nested);
    assert_eq!(stmts.len(), 2);

    let inner = Statement::new(
        StatementKind::Show("hit".to_string()),
        Position::new(2, 8),
    );
    let cond = Statement::new(
        StatementKind::If("$x == 5".to_string(), vec![inner]),
        Position::new(1, 4),
    );
    let tick = Statement::new(
        StatementKind::Show("tick".to_string()),
        Position::new(4, 4),
    );
    assert_eq!(
        stmts[0],
        Statement::new(StatementKind::Loop(2, vec![cond, tick]), Position::new(0, 0))
    );
    assert_eq!(stmts[1].kind, StatementKind::Show("done".to_string()));
}

#[test]
fn test_nested_functions() {
    let source = "function greet(who, greeting)\n    show $greeting\nend\ngreet(World, hi)\nnoop()";
    let stmts = parse_ok(source, BlockMode::Nested);
    assert_eq!(stmts.len(), 3);

    match &stmts[0].kind {
        StatementKind::FunctionDef(def) => {
            assert_eq!(def.params, vec![Identifier::from("who"), Identifier::from("greeting")]);
            assert_eq!(def.body.len(), 1);
        }
        other => panic!("Expected function definition, got {:?}", other),
    }
    assert_eq!(
        stmts[1].kind,
        StatementKind::FunctionCall(
            "greet".into(),
            vec!["World".to_string(), "hi".to_string()]
        )
    );
    assert_eq!(stmts[2].kind, StatementKind::FunctionCall("noop".into(), vec![]));

    // Call lines are not part of the flat grammar
    assert!(parse_ok("greet(World)", BlockMode::Flat).is_empty());
}

#[test]
fn test_nested_errors() {
    let results = parse("show a\nend\nloop 2\nshow b\nloop x\n", BlockMode::Nested);
    let errors: Vec<(ParseErrorKind, usize)> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .map(|e| (e.kind, e.position.line))
        .collect();

    assert_eq!(
        errors,
        vec![
            (ParseErrorKind::Block, 1),
            (ParseErrorKind::InvalidLiteral, 4),
            (ParseErrorKind::Block, 2),
        ]
    );

    // Only `show a` makes it out: `show b` belonged to the unterminated loop
    let ok: Vec<&Statement> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].kind, StatementKind::Show("a".to_string()));
}

#[test]
fn test_block_depth() {
    let data = vec![
        ("show a", 0),
        ("loop 3", 1),
        ("loop 3\n  show a", 1),
        ("loop 3\n  if $x\n show a\n end", 1),
        ("function f(a)\nshow $a\nend", 0),
        ("end\nend", 0),
        ("class A\nfunction m()\n", 2),
    ];

    for (input, expected) in data {
        assert_eq!(block_depth(input), expected, "depth of {:?}", input);
    }
}
