use std::borrow::Borrow;
use std::fmt;
use std::rc::Rc;

use crate::lang::value::Value;

#[derive(Debug, PartialEq, Hash, PartialOrd, Ord, Eq, Clone)]
pub struct Identifier(pub String);

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Identifier(s.to_string())
    }
}

/// Location of a statement in its source text
///
/// Both fields are 0-based. `column` is the indentation of the line the statement came from.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.line + 1)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MathOperator {
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulo,
    /// `^`
    Power,
}

impl MathOperator {
    pub fn op_str(&self) -> &str {
        match self {
            MathOperator::Plus => "+",
            MathOperator::Minus => "-",
            MathOperator::Multiply => "*",
            MathOperator::Divide => "/",
            MathOperator::Modulo => "%",
            MathOperator::Power => "^",
        }
    }
}

impl fmt::Display for MathOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op_str())
    }
}

/// A user defined function
///
/// Stored in the function table behind an `Rc` so a call can run the body while the
/// environment is mutably borrowed.
#[derive(Debug, PartialEq, Clone)]
pub struct FunctionDef {
    pub name: Identifier,
    pub params: Vec<Identifier>,
    pub body: Vec<Statement>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum StatementKind {
    /// `show <operand>`
    Show(String),
    /// (name, value)
    VarDecl(Identifier, Value),
    FunctionDef(Rc<FunctionDef>),
    /// (name, args)
    FunctionCall(Identifier, Vec<String>),
    /// (condition, body)
    If(String, Vec<Statement>),
    /// (count, body)
    Loop(u64, Vec<Statement>),
    /// (name, methods)
    ClassDef(Identifier, Vec<Statement>),
    /// `import <module>`
    Import(String),
    /// `webserver <port>`
    WebServer(u16),
    /// (url, method)
    ApiCall(String, String),
    Comment(String),
    /// `input <prompt>`
    Input(String),
    /// (op, lhs, rhs)
    MathOp(MathOperator, String, String),
}

#[derive(Debug, PartialEq, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub position: Position,
}

/// Variable name referenced by a `$name` operand, if any
fn var_ref(operand: &str) -> Option<&str> {
    operand.strip_prefix('$')
}

impl Statement {
    pub fn new(kind: StatementKind, position: Position) -> Self {
        Self { kind, position }
    }

    /// Whether this statement opens a block that an `end` line closes
    pub fn is_block(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::FunctionDef(_)
                | StatementKind::If(_, _)
                | StatementKind::Loop(_, _)
                | StatementKind::ClassDef(_, _)
        )
    }

    pub fn body_mut(&mut self) -> Option<&mut Vec<Statement>> {
        match &mut self.kind {
            StatementKind::FunctionDef(def) => Some(&mut Rc::make_mut(def).body),
            StatementKind::If(_, body) => Some(body),
            StatementKind::Loop(_, body) => Some(body),
            StatementKind::ClassDef(_, methods) => Some(methods),
            _ => None,
        }
    }

    /// Statements nested under this one (block bodies and class methods)
    pub fn children(&self) -> &[Statement] {
        match &self.kind {
            StatementKind::FunctionDef(def) => &def.body,
            StatementKind::If(_, body) => body,
            StatementKind::Loop(_, body) => body,
            StatementKind::ClassDef(_, methods) => methods,
            _ => &[],
        }
    }

    /// Names of the variables this statement reads or writes, nested statements included
    ///
    /// Used by editor tooling for completion and undefined-variable checks.
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        match &self.kind {
            StatementKind::Show(operand) => vars.extend(var_ref(operand).map(String::from)),
            StatementKind::VarDecl(name, _) => vars.push(name.0.clone()),
            StatementKind::FunctionDef(def) => {
                vars.extend(def.params.iter().map(|p| p.0.clone()))
            }
            StatementKind::If(cond, _) => {
                let operands = match cond.find("==") {
                    Some(idx) => vec![cond[..idx].trim(), cond[idx + 2..].trim()],
                    None => vec![cond.trim()],
                };
                vars.extend(operands.into_iter().filter_map(var_ref).map(String::from));
            }
            StatementKind::Input(_) => vars.push("input".to_string()),
            StatementKind::MathOp(_, lhs, rhs) => {
                vars.extend(
                    [lhs.as_str(), rhs.as_str()]
                        .iter()
                        .copied()
                        .filter_map(var_ref)
                        .map(String::from),
                );
                vars.push("result".to_string());
            }
            _ => (),
        }

        for child in self.children() {
            vars.extend(child.variables());
        }

        vars
    }

    /// Names of the functions this statement defines or calls, nested statements included
    pub fn functions(&self) -> Vec<String> {
        let mut funcs = Vec::new();
        match &self.kind {
            StatementKind::FunctionDef(def) => funcs.push(def.name.0.clone()),
            StatementKind::FunctionCall(name, _) => funcs.push(name.0.clone()),
            _ => (),
        }

        for child in self.children() {
            funcs.extend(child.functions());
        }

        funcs
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StatementKind::Show(operand) => write!(f, "Show: {}", operand),
            StatementKind::VarDecl(name, value) => {
                write!(f, "Var: {} = {} ({})", name, value.to_literal(), value.type_str())
            }
            StatementKind::FunctionDef(def) => write!(f, "Function: {}", def.name),
            StatementKind::FunctionCall(name, _) => write!(f, "Call: {}", name),
            StatementKind::If(cond, _) => write!(f, "If: {}", cond),
            StatementKind::Loop(count, _) => write!(f, "Loop: {}", count),
            StatementKind::ClassDef(name, _) => write!(f, "Class: {}", name),
            StatementKind::Import(module) => write!(f, "Import: {}", module),
            StatementKind::WebServer(port) => write!(f, "WebServer: {}", port),
            StatementKind::ApiCall(url, method) => write!(f, "API: {} {}", method, url),
            StatementKind::Comment(text) => write!(f, "Comment: {}", text),
            StatementKind::Input(prompt) => write!(f, "Input: {}", prompt),
            StatementKind::MathOp(op, lhs, rhs) => write!(f, "Math: {} {} {}", lhs, op, rhs),
        }
    }
}

#[test]
fn test_introspection() {
    let show = Statement::new(StatementKind::Show("$x".to_string()), Position::default());
    assert_eq!(show.variables(), vec!["x".to_string()]);

    let literal = Statement::new(StatementKind::Show("x".to_string()), Position::default());
    assert!(literal.variables().is_empty());

    let cond = Statement::new(
        StatementKind::If("$a == $b".to_string(), vec![show.clone()]),
        Position::default(),
    );
    assert_eq!(
        cond.variables(),
        vec!["a".to_string(), "b".to_string(), "x".to_string()]
    );

    let math = Statement::new(
        StatementKind::MathOp(MathOperator::Plus, "$n".to_string(), "3".to_string()),
        Position::default(),
    );
    assert_eq!(math.variables(), vec!["n".to_string(), "result".to_string()]);

    let def = Statement::new(
        StatementKind::FunctionDef(Rc::new(FunctionDef {
            name: "greet".into(),
            params: vec!["who".into()],
            body: vec![Statement::new(
                StatementKind::FunctionCall("helper".into(), vec![]),
                Position::new(1, 4),
            )],
        })),
        Position::default(),
    );
    assert_eq!(
        def.functions(),
        vec!["greet".to_string(), "helper".to_string()]
    );
    assert_eq!(def.variables(), vec!["who".to_string()]);
}

#[test]
fn test_display() {
    let data = vec![
        (StatementKind::Show("hi".to_string()), "Show: hi"),
        (
            StatementKind::VarDecl("x".into(), Value::Integer(5)),
            "Var: x = 5 (integer)",
        ),
        (
            StatementKind::VarDecl("pi".into(), Value::Float(3.14159265)),
            "Var: pi = 3.14159265 (float)",
        ),
        (
            StatementKind::ApiCall("http://example.com".to_string(), "GET".to_string()),
            "API: GET http://example.com",
        ),
        (
            StatementKind::MathOp(MathOperator::Power, "2".to_string(), "8".to_string()),
            "Math: 2 ^ 8",
        ),
        (StatementKind::Loop(3, vec![]), "Loop: 3"),
    ];

    for (kind, expected) in data {
        assert_eq!(Statement::new(kind, Position::default()).to_string(), expected);
    }
}
