use std::collections::BTreeSet;

use rustyline::completion::{Completer, Pair};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Context, Helper, Highlighter, Hinter, Result};

use crate::lang::ast::Position;
use crate::lang::eval::Eval;
use crate::lang::parse::{block_depth, parse_line, BlockMode};

const KEYWORDS: [&str; 12] = [
    "show", "var", "function", "if", "loop", "class", "import", "webserver", "input", "api",
    "end", "help",
];

/// Helper that extends editor
///
/// The `Validator` keeps the buffer open while a nested block is missing its `end`. The
/// `Completer` offers keywords at the start of a line and `$names` for every variable bound in
/// the interpreter or mentioned earlier in the buffer being edited.
#[derive(Helper, Highlighter, Hinter)]
pub struct ReplHelper {
    mode: BlockMode,
    variables: BTreeSet<String>,
    functions: BTreeSet<String>,
}

impl ReplHelper {
    pub fn new(mode: BlockMode) -> Self {
        ReplHelper {
            mode,
            variables: BTreeSet::new(),
            functions: BTreeSet::new(),
        }
    }

    /// Take the variable and function names currently bound in `eval`
    pub fn refresh(&mut self, eval: &Eval) {
        self.variables = eval.variables().names().map(|n| n.0.clone()).collect();
        self.functions = eval.functions().names().map(|n| n.0.clone()).collect();
    }

    /// Names mentioned by the complete lines of a multi-line buffer
    fn pending(&self, buffer: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut variables = BTreeSet::new();
        let mut functions = BTreeSet::new();

        let done = buffer.rfind('\n').map_or("", |idx| &buffer[..idx]);
        for (idx, line) in done.lines().enumerate() {
            if let Ok(Some(stmt)) = parse_line(line, Position::new(idx, 0)) {
                variables.extend(stmt.variables());
                functions.extend(stmt.functions());
            }
        }

        (variables, functions)
    }

    /// Candidates for the word ending at the end of `line`
    ///
    /// Returns the byte offset where the word starts and the full replacement words.
    fn candidates(&self, line: &str) -> (usize, Vec<String>) {
        let start = line
            .rfind(|c: char| c.is_whitespace() || c == '(' || c == ',')
            .map_or(0, |i| i + 1);
        let word = &line[start..];
        let line_start = line.rfind('\n').map_or(0, |idx| idx + 1);
        let (mut variables, mut functions) = self.pending(line);
        variables.extend(self.variables.iter().cloned());
        functions.extend(self.functions.iter().cloned());

        let found = if let Some(prefix) = word.strip_prefix('$') {
            variables
                .iter()
                .filter(|v| v.starts_with(prefix))
                .map(|v| format!("${}", v))
                .collect()
        } else if line[line_start..start].trim().is_empty() && !word.is_empty() {
            let functions: Vec<&str> = match self.mode {
                BlockMode::Nested => functions.iter().map(String::as_str).collect(),
                BlockMode::Flat => Vec::new(),
            };
            KEYWORDS
                .iter()
                .copied()
                .chain(functions)
                .filter(|k| k.starts_with(word))
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };

        (start, found)
    }
}

impl Completer for ReplHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>)> {
        let (start, words) = self.candidates(&line[..pos]);
        let pairs = words
            .into_iter()
            .map(|w| Pair {
                display: w.clone(),
                replacement: w,
            })
            .collect();

        Ok((start, pairs))
    }
}

impl Validator for ReplHelper {
    fn validate(&self, ctx: &mut ValidationContext) -> Result<ValidationResult> {
        if self.mode == BlockMode::Nested && block_depth(ctx.input()) > 0 {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}

#[test]
fn test_keyword_candidates() {
    let helper = ReplHelper::new(BlockMode::Flat);
    let tests = vec![
        ("sh", (0, vec!["show"])),
        ("  i", (2, vec!["if", "import", "input"])),
        ("we", (0, vec!["webserver"])),
        ("show lo", (5, vec![])),
        ("", (0, vec![])),
    ];

    for (input, (start, expected)) in tests {
        let expected: Vec<String> = expected.into_iter().map(String::from).collect();
        assert_eq!(helper.candidates(input), (start, expected), "line: {:?}", input);
    }
}

#[cfg(test)]
fn helper_for(mode: BlockMode, source: &str) -> ReplHelper {
    use crate::lang::runtime::Runtime;
    use crate::packages::Packages;

    struct NoPackages;

    impl Packages for NoPackages {
        fn is_installed(&self, _: &str) -> bool {
            false
        }

        fn install(&mut self, name: &str) -> anyhow::Result<()> {
            anyhow::bail!("Package {} not found in registry", name)
        }

        fn path_of(&self, _: &str) -> Option<std::path::PathBuf> {
            None
        }
    }

    let mut output = Vec::new();
    let mut input: &[u8] = b"";
    let eval = Eval::new(&mut output, &mut input, Box::new(NoPackages));
    let mut runtime = Runtime::new(eval, mode);
    runtime.run_source(source, |f| panic!("{}", f));

    let mut helper = ReplHelper::new(mode);
    helper.refresh(runtime.env());
    helper
}

#[test]
fn test_variable_candidates() {
    let helper = helper_for(
        BlockMode::Nested,
        "var counter = 1\nfunction greet(who)\n    show $who\nend\n2 + 2",
    );

    let (start, found) = helper.candidates("show $c");
    assert_eq!(start, 5);
    assert_eq!(found, vec!["$counter".to_string()]);

    // Live bindings only: `who` was never bound outside a call
    let (_, found) = helper.candidates("if $");
    assert_eq!(
        found,
        vec!["$E", "$PI", "$VERSION", "$counter", "$result"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<String>>()
    );

    // Functions complete as call lines in nested mode only
    assert_eq!(helper.candidates("gr"), (0, vec!["greet".to_string()]));
    let flat = helper_for(BlockMode::Flat, "function greet(who)");
    assert!(flat.candidates("gr").1.is_empty());
}

#[test]
fn test_buffer_candidates() {
    let helper = helper_for(BlockMode::Nested, "");

    // Names from earlier lines of the buffer being edited
    let buffer = "loop 2\n    var step = 1\n    input Next:\n    show $s";
    let (start, found) = helper.candidates(buffer);
    assert_eq!(start, buffer.len() - 2);
    assert_eq!(found, vec!["$step".to_string()]);

    let (_, found) = helper.candidates("input Name:\nshow $i");
    assert_eq!(found, vec!["$input".to_string()]);

    // Keywords complete at the start of any line of the buffer
    let (start, found) = helper.candidates("loop 2\n  sh");
    assert_eq!(start, 9);
    assert_eq!(found, vec!["show".to_string()]);
}
