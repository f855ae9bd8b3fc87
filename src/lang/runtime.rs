use std::fmt;

use log::debug;

use crate::lang::ast::Position;
use crate::lang::eval::Eval;
use crate::lang::parse::{parse, parse_line, BlockMode, ParseError};

pub enum EvalResult {
    Ok,
    Quit,
    Err(String),
}

/// A statement that failed to parse or to execute
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub position: Option<Position>,
    pub message: String,
}

impl From<ParseError> for Failure {
    fn from(e: ParseError) -> Self {
        debug!("{:?} parse error at {}", e.kind, e.position);
        Self {
            position: Some(e.position),
            message: e.message,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "[ERROR] {}: {}", position, self.message),
            None => write!(f, "[ERROR] {}", self.message),
        }
    }
}

pub struct Runtime<'a> {
    eval: Eval<'a>,
    mode: BlockMode,
}

impl<'a> Runtime<'a> {
    /// Create a new `Runtime` instance
    ///
    /// `mode` decides how `end` lines and block openers are read, see `BlockMode`.
    pub fn new(eval: Eval<'a>, mode: BlockMode) -> Self {
        Self { eval, mode }
    }

    /// The environment statements run against
    pub fn env(&self) -> &Eval<'a> {
        &self.eval
    }

    pub fn mode(&self) -> BlockMode {
        self.mode
    }

    /// Run a whole program
    ///
    /// Every failure is handed to `report` and the program keeps going with the next
    /// statement. Returns how many statements parsed.
    pub fn run_source<F: FnMut(Failure)>(&mut self, source: &str, mut report: F) -> usize {
        let mut parsed = 0;

        for result in parse(source, self.mode) {
            let stmt = match result {
                Ok(s) => s,
                Err(e) => {
                    report(e.into());
                    continue;
                }
            };

            parsed += 1;
            debug!("{}: {}", stmt.position, stmt);
            if let Err(e) = self.eval.execute(&stmt) {
                report(Failure {
                    position: Some(stmt.position),
                    message: format!("{:#}", e),
                });
            }
        }

        parsed
    }

    /// Evaluate one REPL buffer
    ///
    /// Besides DoxRain statements this understands `help`, `quit` and `exit`. The first
    /// failure stops the buffer.
    pub fn eval(&mut self, cmd: &str) -> EvalResult {
        match cmd.trim() {
            "" => return EvalResult::Ok,
            "quit" | "exit" => return EvalResult::Quit,
            "help" => return self.print_help(),
            _ => (),
        }

        // Without nested blocks every line stands on its own
        let results: Vec<_> = match self.mode {
            BlockMode::Flat => cmd
                .lines()
                .enumerate()
                .filter_map(|(idx, line)| {
                    let column = line.len() - line.trim_start().len();
                    parse_line(line, Position::new(idx, column)).transpose()
                })
                .collect(),
            BlockMode::Nested => parse(cmd, self.mode),
        };
        if results.is_empty() {
            return EvalResult::Err(format!("Unknown command: {}", cmd.trim()));
        }

        for result in results {
            let stmt = match result {
                Ok(s) => s,
                Err(e) => return EvalResult::Err(Failure::from(e).to_string()),
            };

            if let Err(e) = self.eval.execute(&stmt) {
                let failure = Failure {
                    position: Some(stmt.position),
                    message: format!("{:#}", e),
                };
                return EvalResult::Err(failure.to_string());
            }
        }

        EvalResult::Ok
    }

    fn print_help(&mut self) -> EvalResult {
        let help = vec![
            ("Commands", ""),
            ("--------------------", ""),
            ("help", "Print help"),
            ("quit, exit", "Leave the REPL"),
            ("", ""),
            ("Statements", ""),
            ("--------------------", ""),
            ("show <text|$var>", "Print text or the value of a variable"),
            ("var <name> = <value>", "Bind a variable (integer, float, boolean or string)"),
            ("function <name>(<params>)", "Define a function, closed by `end`"),
            ("<name>(<args>)", "Call a function (nested blocks only)"),
            ("if <cond>", "Run the block if `$a == $b`, `$flag`, `true` or `1` holds"),
            ("loop <count>", "Run the block <count> times"),
            ("class <name>", "Define a class"),
            ("import <module>", "Import a module, installing it if needed"),
            ("webserver <port>", "Start a web server"),
            ("api <METHOD> <url>", "Make an API call"),
            ("input <prompt>", "Read a line into `$input`"),
            ("<a> <op> <b>", "Arithmetic with + - * / % ^, result in `$result`"),
            ("# <text>", "Comment"),
        ];

        let width = help
            .iter()
            .max_by_key(|p| p.0.len())
            .map_or(0, |p| p.0.len() + 4);
        let mut s = String::new();
        for (l, r) in help {
            s += &format!("{:width$}{}\n", l, r, width = width);
        }

        match write!(self.eval.sink(), "{}", s) {
            Ok(_) => EvalResult::Ok,
            Err(e) => EvalResult::Err(e.to_string()),
        }
    }
}

#[cfg(test)]
use std::path::PathBuf;

#[cfg(test)]
use anyhow::{bail, Result};

#[cfg(test)]
use crate::packages::Packages;

#[cfg(test)]
struct NoPackages;

#[cfg(test)]
impl Packages for NoPackages {
    fn is_installed(&self, _: &str) -> bool {
        false
    }

    fn install(&mut self, name: &str) -> Result<()> {
        bail!("Package {} not found in registry", name)
    }

    fn path_of(&self, _: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
fn run_program(source: &str, mode: BlockMode) -> (String, Vec<String>) {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    let mut failures = Vec::new();
    {
        let eval = Eval::new(&mut output, &mut input, Box::new(NoPackages));
        let mut runtime = Runtime::new(eval, mode);
        runtime.run_source(source, |f| failures.push(f.to_string()));
    }

    (
        String::from_utf8(output).expect("Output not utf-8"),
        failures,
    )
}

#[test]
fn test_run_source_keeps_going() {
    let source = "show first\nvar n = 3.x\n7 * oops\nloop many\nshow last";
    let (output, failures) = run_program(source, BlockMode::Flat);

    assert_eq!(output, "first\n[MATH] 7 * 0 = 0\nlast\n");
    assert_eq!(failures.len(), 2);
    assert!(failures[0].starts_with("[ERROR] line 2: '3.x' is not a valid float"));
    assert!(failures[1].starts_with("[ERROR] line 4: Invalid loop count"));
}

#[test]
fn test_run_source_modes() {
    let source = r#"# greet everyone
var name = DoxRain
function hello(who)
    show $who
end
loop 2
    hello($name)
end
if $name == DoxRain
    show match
end
5 + 3
show $result"#;

    let (flat, failures) = run_program(source, BlockMode::Flat);
    assert!(failures.is_empty());
    assert_eq!(flat, "undefined\nmatch\n[MATH] 5 + 3 = 8\n8.000000\n");

    let (nested, failures) = run_program(source, BlockMode::Nested);
    assert!(failures.is_empty());
    assert_eq!(nested, "$name\n$name\nmatch\n[MATH] 5 + 3 = 8\n8.000000\n");
}

#[test]
fn test_block_failures() {
    let (output, failures) = run_program("end\nshow a\nloop 2\nshow b", BlockMode::Nested);

    assert_eq!(output, "a\n");
    assert_eq!(
        failures,
        vec![
            "[ERROR] line 1: 'end' without an open block".to_string(),
            "[ERROR] line 3: Unterminated block 'Loop: 2': missing 'end'".to_string(),
        ]
    );
}

#[test]
fn test_repl_eval() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let eval = Eval::new(&mut output, &mut input, Box::new(NoPackages));
        let mut runtime = Runtime::new(eval, BlockMode::Nested);

        assert!(matches!(runtime.eval("var x = 2"), EvalResult::Ok));
        assert!(matches!(runtime.eval("   "), EvalResult::Ok));
        assert!(matches!(runtime.eval("loop 2\n  show $x\nend"), EvalResult::Ok));

        match runtime.eval("what is this") {
            EvalResult::Err(e) => assert_eq!(e, "Unknown command: what is this"),
            _ => panic!("Expected an unknown command"),
        }
        match runtime.eval("loop x") {
            EvalResult::Err(e) => assert!(e.starts_with("[ERROR] line 1: Invalid loop count")),
            _ => panic!("Expected a parse error"),
        }

        assert!(matches!(runtime.eval("quit"), EvalResult::Quit));
        assert!(matches!(runtime.eval(" exit "), EvalResult::Quit));
        assert_eq!(runtime.mode(), BlockMode::Nested);
        assert_eq!(
            runtime.env().get_variable("x"),
            crate::lang::value::Value::Integer(2)
        );
    }

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "2\n2\n"
    );
}

#[test]
fn test_repl_eval_flat() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let eval = Eval::new(&mut output, &mut input, Box::new(NoPackages));
        let mut runtime = Runtime::new(eval, BlockMode::Flat);

        assert!(matches!(runtime.eval("var y = 3"), EvalResult::Ok));
        assert!(matches!(runtime.eval("    show $y"), EvalResult::Ok));
        assert!(matches!(runtime.eval("loop 2"), EvalResult::Ok));
        assert!(matches!(runtime.eval("end"), EvalResult::Ok));

        // Call lines only exist with nested blocks
        match runtime.eval("greet(x)") {
            EvalResult::Err(e) => assert_eq!(e, "Unknown command: greet(x)"),
            _ => panic!("Expected an unknown command"),
        }
        match runtime.eval("webserver http") {
            EvalResult::Err(e) => assert!(e.starts_with("[ERROR] line 1: Invalid port")),
            _ => panic!("Expected a parse error"),
        }
    }

    assert_eq!(String::from_utf8(output).expect("Output not utf-8"), "3\n");
}

#[test]
fn test_help() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let eval = Eval::new(&mut output, &mut input, Box::new(NoPackages));
        let mut runtime = Runtime::new(eval, BlockMode::Flat);
        assert!(matches!(runtime.eval("help"), EvalResult::Ok));
    }

    let help = String::from_utf8(output).expect("Output not utf-8");
    assert!(help.starts_with("Commands"));
    assert!(help.contains("loop <count>"));
    assert!(help.lines().any(|l| l.starts_with("quit, exit") && l.ends_with("Leave the REPL")));
}
