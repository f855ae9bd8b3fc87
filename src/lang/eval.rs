use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::rc::Rc;

use anyhow::{bail, Result};
use log::{debug, warn};

use crate::lang::ast::*;
use crate::lang::functions::Functions;
use crate::lang::value::{format_number, leading_number, Value};
use crate::lang::variables::Variables;
use crate::packages::Packages;

/// Deepest chain of nested function calls before a call fails
const MAX_CALL_DEPTH: usize = 128;

/// The interpreter and the environment it runs against
///
/// One `Eval` lives for the whole program. Every statement reads and writes the same global
/// variable map, function table and module set.
pub struct Eval<'a> {
    sink: &'a mut dyn Write,
    input: &'a mut dyn BufRead,
    packages: Box<dyn Packages + 'a>,
    variables: Variables,
    functions: Functions,
    modules: BTreeSet<String>,
    last_input: String,
    web_server: Option<u16>,
    call_depth: usize,
}

impl<'a> Eval<'a> {
    /// Create a new `Eval` instance
    ///
    /// `sink` is where statement output goes, `input` is what `input` statements read from and
    /// `packages` resolves `import`s.
    pub fn new(
        sink: &'a mut dyn Write,
        input: &'a mut dyn BufRead,
        packages: Box<dyn Packages + 'a>,
    ) -> Self {
        Self {
            sink,
            input,
            packages,
            variables: Variables::new(),
            functions: Functions::new(),
            modules: BTreeSet::new(),
            last_input: String::new(),
            web_server: None,
            call_depth: 0,
        }
    }

    /// Look up a variable, `"undefined"` if it is not bound
    pub fn get_variable(&self, name: &str) -> Value {
        self.variables
            .get(name)
            .cloned()
            .unwrap_or_else(Value::undefined)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    /// Every module imported so far
    pub fn modules(&self) -> &BTreeSet<String> {
        &self.modules
    }

    pub fn last_input(&self) -> &str {
        &self.last_input
    }

    /// Port of the web server, if one was started
    pub fn web_server(&self) -> Option<u16> {
        self.web_server
    }

    pub fn sink(&mut self) -> &mut (dyn Write + 'a) {
        &mut *self.sink
    }

    /// `$name` operands read a variable, anything else is literal text
    fn resolve(&self, operand: &str) -> Value {
        match operand.strip_prefix('$') {
            Some(name) => self.get_variable(name),
            None => Value::String(operand.to_string()),
        }
    }

    fn eval_condition(&self, cond: &str) -> bool {
        if let Some(idx) = cond.find("==") {
            let lhs = self.resolve(cond[..idx].trim());
            let rhs = self.resolve(cond[idx + 2..].trim());

            return lhs.to_string() == rhs.to_string();
        }

        if let Some(name) = cond.strip_prefix('$') {
            let val = self.get_variable(name).to_string();
            return val != "undefined" && val != "false" && val != "0";
        }

        cond == "true" || cond == "1"
    }

    /// Operands never fail: text without a leading number counts as `0`
    fn math_operand(&self, operand: &str) -> f64 {
        match operand.strip_prefix('$') {
            Some(name) => self.get_variable(name).to_number(),
            None => leading_number(operand),
        }
    }

    fn eval_math(&mut self, op: MathOperator, lhs: &str, rhs: &str) -> Result<()> {
        let lhs_val = self.math_operand(lhs);
        let rhs_val = self.math_operand(rhs);

        let res = match op {
            MathOperator::Plus => lhs_val + rhs_val,
            MathOperator::Minus => lhs_val - rhs_val,
            MathOperator::Multiply => lhs_val * rhs_val,
            MathOperator::Divide => {
                if rhs_val == 0.0 {
                    warn!("Skipping {} / {}: division by zero", lhs, rhs);
                    writeln!(self.sink, "[ERROR] Division by zero")?;
                    return Ok(());
                }

                lhs_val / rhs_val
            }
            MathOperator::Modulo => lhs_val % rhs_val,
            MathOperator::Power => lhs_val.powf(rhs_val),
        };

        self.set_variable("result", Value::Float(res));
        writeln!(
            self.sink,
            "[MATH] {} {} {} = {}",
            format_number(lhs_val),
            op,
            format_number(rhs_val),
            format_number(res)
        )?;

        Ok(())
    }

    fn eval_import(&mut self, module: &str) -> Result<()> {
        if self.modules.contains(module) {
            writeln!(self.sink, "[IMPORT] Module already imported: {}", module)?;
        } else if self.packages.is_installed(module) {
            writeln!(self.sink, "[IMPORT] Module already installed: {}", module)?;
        } else {
            writeln!(self.sink, "[IMPORT] Installing module: {}", module)?;
            if let Err(e) = self.packages.install(module) {
                warn!("Failed to install {}: {:#}", module, e);
            }
        }

        if let Some(path) = self.packages.path_of(module) {
            writeln!(self.sink, "[IMPORT] Loading module from: {}", path.display())?;
        }

        self.modules.insert(module.to_string());

        Ok(())
    }

    fn eval_input(&mut self, prompt: &str) -> Result<()> {
        write!(self.sink, "{}", prompt)?;
        self.sink.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();

        self.set_variable("input", Value::String(line.clone()));
        self.last_input = line;

        Ok(())
    }

    /// Call a user defined function
    ///
    /// The whole variable map is checkpointed, parameters are bound position-wise as strings,
    /// the body runs against the shared map and the checkpoint is restored afterwards, even
    /// if the body failed. Calling an undefined function does nothing.
    pub fn call_function(&mut self, name: &str, args: &[String]) -> Result<()> {
        let def = match self.functions.get(name) {
            Some(def) => def,
            None => {
                debug!("Ignoring call to undefined function {}", name);
                return Ok(());
            }
        };

        if self.call_depth >= MAX_CALL_DEPTH {
            bail!(
                "Maximum call depth ({}) exceeded calling {}",
                MAX_CALL_DEPTH,
                name
            );
        }

        debug!("call {}({})", name, args.join(", "));

        let checkpoint = self.variables.checkpoint();
        for (param, arg) in def.params.iter().zip(args) {
            self.variables.insert(param.clone(), Value::String(arg.clone()));
        }

        self.call_depth += 1;
        let ret = self.eval_block(&def.body);
        self.call_depth -= 1;
        self.variables.restore(checkpoint);

        ret
    }

    fn eval_block(&mut self, stmts: &[Statement]) -> Result<()> {
        for stmt in stmts {
            self.execute(stmt)?;
        }

        Ok(())
    }

    /// Execute one statement
    pub fn execute(&mut self, stmt: &Statement) -> Result<()> {
        match &stmt.kind {
            StatementKind::Show(operand) => {
                let out = self.resolve(operand);
                writeln!(self.sink, "{}", out)?;
            }
            StatementKind::VarDecl(name, value) => {
                self.variables.insert(name.clone(), value.clone());
            }
            StatementKind::FunctionDef(def) => {
                debug!("define {}({} params)", def.name, def.params.len());
                self.functions.define(Rc::clone(def));
            }
            StatementKind::FunctionCall(name, args) => self.call_function(&name.0, args)?,
            StatementKind::If(cond, body) => {
                if self.eval_condition(cond) {
                    self.eval_block(body)?;
                }
            }
            StatementKind::Loop(count, body) => {
                for _ in 0..*count {
                    self.eval_block(body)?;
                }
            }
            StatementKind::ClassDef(name, _) => {
                writeln!(self.sink, "[CLASS] Defined class: {}", name)?;
            }
            StatementKind::Import(module) => self.eval_import(module)?,
            StatementKind::WebServer(port) => {
                self.web_server = Some(*port);
                writeln!(
                    self.sink,
                    "[WEB] Server is running at http://localhost:{}",
                    port
                )?;
            }
            StatementKind::ApiCall(url, method) => {
                writeln!(self.sink, "[API] {} {} -> 200 OK", method, url)?;
            }
            StatementKind::Comment(_) => (),
            StatementKind::Input(prompt) => self.eval_input(prompt)?,
            StatementKind::MathOp(op, lhs, rhs) => self.eval_math(*op, lhs, rhs)?,
        }

        Ok(())
    }
}

#[cfg(test)]
use std::cell::RefCell;

#[cfg(test)]
use std::path::PathBuf;

#[cfg(test)]
use crate::lang::parse::{parse, BlockMode};

/// Package store double that records every install request
#[cfg(test)]
#[derive(Clone, Default)]
struct FakePackages {
    installed: Rc<RefCell<BTreeSet<String>>>,
    requests: Rc<RefCell<Vec<String>>>,
}

#[cfg(test)]
impl Packages for FakePackages {
    fn is_installed(&self, name: &str) -> bool {
        self.installed.borrow().contains(name)
    }

    fn install(&mut self, name: &str) -> Result<()> {
        self.requests.borrow_mut().push(name.to_string());
        if name.starts_with("dox-") {
            self.installed.borrow_mut().insert(name.to_string());
            Ok(())
        } else {
            bail!("Package {} not found in registry", name)
        }
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        if self.is_installed(name) {
            Some(PathBuf::from("/pkgs").join(name))
        } else {
            None
        }
    }
}

#[cfg(test)]
fn eval_source(eval: &mut Eval, source: &str, mode: BlockMode) {
    for stmt in parse(source, mode) {
        eval.execute(&stmt.expect("Failed to parse"))
            .expect("Failed to eval");
    }
}

/// Run `source` in a fresh interpreter and return everything it printed
#[cfg(test)]
fn run(source: &str, mode: BlockMode) -> String {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
        eval_source(&mut eval, source, mode);
    }

    String::from_utf8(output).expect("Output not utf-8")
}

#[test]
fn test_show_var() {
    let tests = vec![
        ("var x = 5\nshow $x", "5\n"),
        ("var x = -5\nshow $x", "-5\n"),
        ("var x = 2.5\nshow $x", "2.500000\n"),
        ("var x = true\nshow $x", "true\n"),
        ("var x = hello world\nshow $x", "hello world\n"),
        ("show plain text", "plain text\n"),
        ("show $missing", "undefined\n"),
        ("show $PI", "3.141590\n"),
        ("show $VERSION", "3.0.0\n"),
        ("var x = 1\nvar x = two\nshow $x", "two\n"),
    ];

    for (input, expected) in tests {
        assert_eq!(run(input, BlockMode::Flat), expected, "source: {:?}", input);
    }
}

#[test]
fn test_loop() {
    let tests = vec![
        ("loop 0\n    show x\nend", ""),
        ("loop 1\n    show x\nend", "x\n"),
        ("loop 5\n    show x\nend", "x\nx\nx\nx\nx\n"),
        ("loop 2\n    loop 2\n        show y\n    end\nend", "y\ny\ny\ny\n"),
    ];

    for (input, expected) in tests {
        assert_eq!(run(input, BlockMode::Nested), expected, "source: {:?}", input);
    }

    // Flat blocks: the body line runs once at top level whatever the count
    assert_eq!(run("loop 5\n    show x\nend", BlockMode::Flat), "x\n");
    assert_eq!(run("loop 0\n    show x\nend", BlockMode::Flat), "x\n");
}

#[test]
fn test_if() {
    let tests = vec![
        ("var x = 5\nif $x == 5\n    show matched\nend", "matched\n"),
        ("var x = 6\nif $x == 5\n    show matched\nend", ""),
        ("var a = hi\nvar b = hi\nif $a == $b\nshow same\nend", "same\n"),
        ("if hello == hello\nshow same\nend", "same\n"),
        ("var x = 5\nif $x == 5.0\nshow same\nend", ""),
        ("var f = true\nif $f\nshow yes\nend", "yes\n"),
        ("var f = false\nif $f\nshow yes\nend", ""),
        ("var f = 0\nif $f\nshow yes\nend", ""),
        ("var f = word\nif $f\nshow yes\nend", "yes\n"),
        ("if $missing\nshow yes\nend", ""),
        ("if true\nshow yes\nend", "yes\n"),
        ("if 1\nshow yes\nend", "yes\n"),
        ("if yes\nshow yes\nend", ""),
        // Bodies run in the caller's environment
        ("var n = 1\nif true\nvar n = 2\nend\nshow $n", "2\n"),
    ];

    for (input, expected) in tests {
        assert_eq!(run(input, BlockMode::Nested), expected, "source: {:?}", input);
    }

    // Flat blocks: the condition has nothing to guard
    assert_eq!(
        run("var x = 6\nif $x == 5\n    show matched\nend", BlockMode::Flat),
        "matched\n"
    );
}

#[test]
fn test_math() {
    let tests = vec![
        ("5 + 3", "[MATH] 5 + 3 = 8\n"),
        ("5 - 8", "[MATH] 5 - 8 = -3\n"),
        ("2.5 * 4", "[MATH] 2.5 * 4 = 10\n"),
        ("1 / 4", "[MATH] 1 / 4 = 0.25\n"),
        ("7.5 % 2", "[MATH] 7.5 % 2 = 1.5\n"),
        ("-7 % 2", "[MATH] -7 % 2 = -1\n"),
        ("2 ^ 10", "[MATH] 2 ^ 10 = 1024\n"),
        ("var x = 4\n$x * $x", "[MATH] 4 * 4 = 16\n"),
        ("var t = true\n$t + 1", "[MATH] 1 + 1 = 2\n"),
        // Strings that do not coerce count as zero
        ("var s = abc\n$s + 2", "[MATH] 0 + 2 = 2\n"),
        ("$missing + 2", "[MATH] 0 + 2 = 2\n"),
        ("5 + 3\nshow $result", "[MATH] 5 + 3 = 8\n8.000000\n"),
    ];

    for (input, expected) in tests {
        assert_eq!(run(input, BlockMode::Flat), expected, "source: {:?}", input);
    }
}

#[test]
fn test_divide_by_zero() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
        eval_source(&mut eval, "var result = 7\n5 / 0\n10 / 4", BlockMode::Flat);
        assert_eq!(eval.get_variable("result"), Value::Float(2.5));

        eval_source(&mut eval, "1 / 0", BlockMode::Flat);
        assert_eq!(eval.get_variable("result"), Value::Float(2.5));
    }

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "[ERROR] Division by zero\n[MATH] 10 / 4 = 2.5\n[ERROR] Division by zero\n"
    );

    // Nothing was ever stored when the only division fails
    let mut output = Vec::new();
    let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
    eval_source(&mut eval, "var result = 7\n5 / 0", BlockMode::Flat);
    assert_eq!(eval.get_variable("result"), Value::Integer(7));
}

#[test]
fn test_math_lenient_operands() {
    let tests = vec![
        // Only the leading number of each side counts
        ("2 * 3 + 4", "[MATH] 2 + 4 = 6\n"),
        ("1 + 2 + 3", "[MATH] 1 + 2 = 3\n"),
        ("3.5kg * 2", "[MATH] 3.5 * 2 = 7\n"),
        // No number at all counts as zero
        ("7 * oops", "[MATH] 7 * 0 = 0\n"),
        ("well - known", "[MATH] 0 - 0 = 0\n"),
        ("5 / zero", "[ERROR] Division by zero\n"),
    ];

    for (input, expected) in tests {
        assert_eq!(run(input, BlockMode::Flat), expected, "source: {:?}", input);
    }

    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
    eval_source(&mut eval, "2 * 3 + 4", BlockMode::Flat);
    assert_eq!(eval.get_variable("result"), Value::Float(6.0));
}

#[test]
fn test_function_scoping() {
    let body = vec![
        Statement::new(StatementKind::Show("$p".to_string()), Position::new(1, 4)),
        Statement::new(StatementKind::Show("$existing".to_string()), Position::new(2, 4)),
        Statement::new(
            StatementKind::VarDecl("existing".into(), Value::Integer(99)),
            Position::new(3, 4),
        ),
        Statement::new(
            StatementKind::VarDecl("fresh".into(), Value::Boolean(true)),
            Position::new(4, 4),
        ),
        Statement::new(StatementKind::Show("$existing".to_string()), Position::new(5, 4)),
    ];
    let def = Statement::new(
        StatementKind::FunctionDef(Rc::new(FunctionDef {
            name: "f".into(),
            params: vec!["p".into()],
            body,
        })),
        Position::new(0, 0),
    );
    let call = Statement::new(
        StatementKind::FunctionCall("f".into(), vec!["a".to_string()]),
        Position::new(7, 0),
    );

    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
        eval.set_variable("existing", Value::Integer(1));
        eval.execute(&def).expect("Failed to define");
        eval.execute(&call).expect("Failed to call");

        assert_eq!(eval.get_variable("existing"), Value::Integer(1));
        assert_eq!(eval.get_variable("fresh"), Value::undefined());
        assert_eq!(eval.get_variable("p"), Value::undefined());
        assert!(eval.functions().get("f").is_some());
    }

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "a\n1\n99\n"
    );
}

#[test]
fn test_function_source() {
    let source = r#"var greeting = hello
function greet(who)
    show $greeting
    show $who
    var greeting = bye
end
greet(world)
show $greeting
greet()
show $who
missing(1, 2)"#;

    assert_eq!(
        run(source, BlockMode::Nested),
        "hello\nworld\nhello\nhello\nundefined\nundefined\n"
    );
}

#[test]
fn test_function_redefine() {
    let source = "function f()\nshow one\nend\nfunction f()\nshow two\nend\nf()";
    assert_eq!(run(source, BlockMode::Nested), "two\n");
}

/// Input that fails every read
#[cfg(test)]
struct ClosedInput;

#[cfg(test)]
impl std::io::Read for ClosedInput {
    fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "input closed"))
    }
}

#[cfg(test)]
impl BufRead for ClosedInput {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "input closed"))
    }

    fn consume(&mut self, _: usize) {}
}

#[test]
fn test_function_restores_on_error() {
    let bad = Statement::new(StatementKind::Input("Name:".to_string()), Position::new(2, 0));
    let def = FunctionDef {
        name: "f".into(),
        params: vec!["a".into()],
        body: vec![
            Statement::new(
                StatementKind::VarDecl("x".into(), Value::Integer(2)),
                Position::new(1, 0),
            ),
            bad,
        ],
    };

    let mut output = Vec::new();
    let mut input = ClosedInput;
    let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
    eval.set_variable("x", Value::Integer(1));
    eval.execute(&Statement::new(
        StatementKind::FunctionDef(Rc::new(def)),
        Position::default(),
    ))
    .expect("Failed to define");

    let err = eval
        .call_function("f", &["v".to_string()])
        .expect_err("Reading closed input should fail");
    assert!(err.to_string().contains("input closed"));
    assert_eq!(eval.get_variable("x"), Value::Integer(1));
    assert_eq!(eval.get_variable("a"), Value::undefined());
}

#[test]
fn test_recursion_limit() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
    eval.set_variable("x", Value::Integer(1));
    eval_source(
        &mut eval,
        "function forever()\nvar x = 2\nforever()\nend",
        BlockMode::Nested,
    );

    let err = eval
        .call_function("forever", &[])
        .expect_err("Recursion should be cut off");
    assert!(err.to_string().contains("Maximum call depth"));
    assert_eq!(eval.get_variable("x"), Value::Integer(1));
}

#[test]
fn test_import() {
    let packages = FakePackages::default();
    packages
        .installed
        .borrow_mut()
        .insert("dox-json".to_string());

    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(packages.clone()));
        eval_source(
            &mut eval,
            "import dox-web\nimport dox-web\nimport dox-json\nimport nowhere\nimport nowhere",
            BlockMode::Flat,
        );

        let modules: Vec<&str> = eval.modules().iter().map(String::as_str).collect();
        assert_eq!(modules, vec!["dox-json", "dox-web", "nowhere"]);
    }

    // Installed at most once per module, never for one already present
    assert_eq!(
        *packages.requests.borrow(),
        vec!["dox-web".to_string(), "nowhere".to_string()]
    );

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "[IMPORT] Installing module: dox-web\n\
         [IMPORT] Loading module from: /pkgs/dox-web\n\
         [IMPORT] Module already imported: dox-web\n\
         [IMPORT] Loading module from: /pkgs/dox-web\n\
         [IMPORT] Module already installed: dox-json\n\
         [IMPORT] Loading module from: /pkgs/dox-json\n\
         [IMPORT] Installing module: nowhere\n\
         [IMPORT] Module already imported: nowhere\n"
    );
}

#[test]
fn test_input() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"Alice\nBob\r\n";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
        eval_source(&mut eval, "input Name: \nshow $input", BlockMode::Flat);
        assert_eq!(eval.last_input(), "Alice");

        eval_source(&mut eval, "input Again:", BlockMode::Flat);
        assert_eq!(eval.last_input(), "Bob");
        assert_eq!(eval.get_variable("input"), Value::String("Bob".to_string()));

        // End of input reads as an empty line
        eval_source(&mut eval, "input More:", BlockMode::Flat);
        assert_eq!(eval.last_input(), "");
    }

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "Name:Alice\nAgain:More:"
    );
}

#[test]
fn test_side_effect_statements() {
    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    {
        let mut eval = Eval::new(&mut output, &mut input, Box::new(FakePackages::default()));
        assert_eq!(eval.web_server(), None);
        eval_source(
            &mut eval,
            "webserver 8080\napi POST http://example.com/items\nclass Point\n# comment\nend",
            BlockMode::Flat,
        );
        assert_eq!(eval.web_server(), Some(8080));
    }

    assert_eq!(
        String::from_utf8(output).expect("Output not utf-8"),
        "[WEB] Server is running at http://localhost:8080\n\
         [API] POST http://example.com/items -> 200 OK\n\
         [CLASS] Defined class: Point\n"
    );
}
