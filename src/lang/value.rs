use std::fmt;
use std::iter::FromIterator;
use std::str::FromStr;

use anyhow::{anyhow, ensure, Result};
use pom::parser::{one_of, sym, Parser};

/// String returned in place of a value when a variable lookup misses
pub const UNDEFINED: &str = "undefined";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl Value {
    pub fn undefined() -> Self {
        Value::String(UNDEFINED.to_string())
    }

    /// Infer a value from the raw text on the right hand side of `var name = ...`
    ///
    /// The checks run in a fixed order: `true`/`false`, anything containing a `.` is a float,
    /// a leading digit (or a `-` followed by anything) is an integer, the rest is a raw string.
    /// A literal that picks the float or integer path but does not convert is an error, and so
    /// is a float too large to represent.
    pub fn from_literal(text: &str) -> Result<Self> {
        if text == "true" || text == "false" {
            return Ok(Value::Boolean(text == "true"));
        }

        if text.contains('.') {
            let f = f64::from_str(text).map_err(|_| anyhow!("'{}' is not a valid float", text))?;
            ensure!(f.is_finite(), "'{}' is out of range for a float", text);
            return Ok(Value::Float(f));
        }

        let starts_with_digit = text.chars().next().map_or(false, |c| c.is_ascii_digit());
        if starts_with_digit || (text.starts_with('-') && text.len() > 1) {
            return i64::from_str(text)
                .map(Value::Integer)
                .map_err(|_| anyhow!("'{}' is not a valid integer", text));
        }

        Ok(Value::String(text.to_string()))
    }

    /// Numeric coercion used by math statements
    ///
    /// Strings coerce through `leading_number` and never fail.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Integer(i) => *i as f64,
            Value::Float(f) => *f,
            Value::String(s) => leading_number(s),
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Source text that `from_literal` reads back as the same value
    ///
    /// Differs from the display form for floats only: those keep every significant digit and
    /// always carry a `.`.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Float(f) => {
                let s = f.to_string();
                if s.contains('.') {
                    s
                } else {
                    s + ".0"
                }
            }
            _ => self.to_string(),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{:.6}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", if *b { "true" } else { "false" }),
        }
    }
}

fn digits<'a>() -> Parser<'a, char, ()> {
    one_of("0123456789").repeat(1..).discard()
}

/// Optional sign, mantissa and optional exponent, e.g. `-1.5e3`
fn number<'a>() -> Parser<'a, char, f64> {
    let mantissa = (digits() + (sym('.') + one_of("0123456789").repeat(0..)).opt()).discard()
        | (sym('.') + digits()).discard();
    let exponent = one_of("eE") + one_of("+-").opt() + digits();
    let number = one_of("+-").opt() + mantissa + exponent.opt();

    number
        .collect()
        .map(String::from_iter)
        .convert(|s| f64::from_str(&s))
}

/// Value of the number `text` starts with, ignoring leading whitespace and whatever follows
/// the number. `0.0` when there is no number at all.
pub fn leading_number(text: &str) -> f64 {
    let input: Vec<char> = text.trim_start().chars().collect();
    let value = number().parse(&input).unwrap_or(0.0);
    value
}

/// Render a number the way math summaries show it: at most six significant digits, no
/// trailing zeros (`8`, `0.3`, `3.14159`)
pub fn format_number(n: f64) -> String {
    if !n.is_finite() {
        return format!("{}", n);
    }

    let rounded = format!("{:.5e}", n)
        .parse::<f64>()
        .unwrap_or(n);

    if rounded == 0.0 {
        // Avoid printing "-0"
        return "0".to_string();
    }

    format!("{}", rounded)
}

#[test]
fn test_from_literal() {
    let data = vec![
        ("true", Value::Boolean(true)),
        ("false", Value::Boolean(false)),
        ("5", Value::Integer(5)),
        ("-12", Value::Integer(-12)),
        ("5.0", Value::Float(5.0)),
        ("-0.25", Value::Float(-0.25)),
        ("hello", Value::String("hello".to_string())),
        ("hello world", Value::String("hello world".to_string())),
        ("-", Value::String("-".to_string())),
        ("True", Value::String("True".to_string())),
    ];

    for (input, expected) in data {
        assert_eq!(Value::from_literal(input).expect("Failed to infer"), expected);
    }

    // Recognised as numbers by shape but fail conversion
    for input in vec!["3.x", "12abc", "-foo", "1.2.3", "99999999999999999999", "1.5e400"] {
        assert!(Value::from_literal(input).is_err(), "{} should not convert", input);
    }
}

#[test]
fn test_display() {
    let data = vec![
        (Value::Integer(42), "42"),
        (Value::Integer(-7), "-7"),
        (Value::Float(3.14159), "3.141590"),
        (Value::Float(8.0), "8.000000"),
        (Value::String("hi there".to_string()), "hi there"),
        (Value::Boolean(true), "true"),
        (Value::Boolean(false), "false"),
    ];

    for (input, expected) in data {
        assert_eq!(input.to_string(), expected);
    }
}

#[test]
fn test_to_number() {
    let data = vec![
        (Value::Integer(3), 3.0),
        (Value::Float(2.5), 2.5),
        (Value::Boolean(true), 1.0),
        (Value::Boolean(false), 0.0),
        (Value::String("4.5".to_string()), 4.5),
        (Value::String("abc".to_string()), 0.0),
        (Value::String("12abc".to_string()), 12.0),
        (Value::undefined(), 0.0),
    ];

    for (input, expected) in data {
        assert_eq!(input.to_number(), expected);
    }
}

#[test]
fn test_leading_number() {
    let data = vec![
        ("42", 42.0),
        ("  -2.5", -2.5),
        ("+3", 3.0),
        (".5", 0.5),
        ("7.", 7.0),
        ("1e3", 1000.0),
        ("2.5E-1x", 0.25),
        ("1e", 1.0),
        ("2 * 3", 2.0),
        ("3.5kg", 3.5),
        ("oops", 0.0),
        ("-", 0.0),
        (".", 0.0),
        ("", 0.0),
    ];

    for (input, expected) in data {
        assert_eq!(leading_number(input), expected, "input: {:?}", input);
    }
}

#[test]
fn test_to_literal() {
    let data = vec![
        (Value::Float(0.1234567), "0.1234567"),
        (Value::Float(3.14159265), "3.14159265"),
        (Value::Float(5.0), "5.0"),
        (Value::Float(-0.25), "-0.25"),
        (Value::Float(1e20), "100000000000000000000.0"),
        (Value::Integer(-3), "-3"),
        (Value::Boolean(false), "false"),
        (Value::String("word".to_string()), "word"),
    ];

    for (input, expected) in data {
        assert_eq!(input.to_literal(), expected);
    }
}

#[test]
fn test_format_number() {
    let data = vec![
        (8.0, "8"),
        (2.0, "2"),
        (0.1 + 0.2, "0.3"),
        (3.14159, "3.14159"),
        (2.0 / 3.0, "0.666667"),
        (-1.5, "-1.5"),
        (-0.0, "0"),
        (1024.0, "1024"),
    ];

    for (input, expected) in data {
        assert_eq!(format_number(input), expected);
    }
}
