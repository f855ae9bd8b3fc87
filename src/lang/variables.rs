use std::collections::BTreeMap;

use lazy_static::lazy_static;

use crate::lang::ast::Identifier;
use crate::lang::value::Value;

/// Version of the language itself, independent of this crate's version
pub const LANGUAGE_VERSION: &str = "3.0.0";

lazy_static! {
    /// Bindings every environment starts with
    pub static ref CONSTANTS: Vec<(&'static str, Value)> = vec![
        ("PI", Value::Float(3.14159)),
        ("E", Value::Float(2.71828)),
        ("VERSION", Value::String(LANGUAGE_VERSION.to_string())),
    ];
}

/// Copy of every binding taken before a function call
pub struct Checkpoint(BTreeMap<Identifier, Value>);

/// The single global variable map
///
/// There are no nested scopes. Function calls take a `checkpoint()` and `restore()` it on
/// return, so a call can read and write anything already bound by its caller but none of
/// its writes survive the call.
pub struct Variables {
    inner: BTreeMap<Identifier, Value>,
}

impl Variables {
    pub fn new() -> Self {
        let mut map = BTreeMap::default();

        for (name, value) in &*CONSTANTS {
            map.insert(Identifier(name.to_string()), value.clone());
        }

        Variables { inner: map }
    }

    pub fn get(&self, ident: &str) -> Option<&Value> {
        self.inner.get(ident)
    }

    /// Bind `ident`, replacing any previous value
    pub fn insert(&mut self, ident: Identifier, val: Value) {
        self.inner.insert(ident, val);
    }

    pub fn names(&self) -> impl Iterator<Item = &Identifier> {
        self.inner.keys()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.inner.clone())
    }

    /// Replace every binding with the ones saved in `checkpoint`
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.inner = checkpoint.0;
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_constants() {
    let vars = Variables::new();
    assert_eq!(vars.get("PI"), Some(&Value::Float(3.14159)));
    assert_eq!(vars.get("E"), Some(&Value::Float(2.71828)));
    assert_eq!(
        vars.get("VERSION"),
        Some(&Value::String("3.0.0".to_string()))
    );
    assert_eq!(vars.get("missing"), None);
}

#[test]
fn test_last_write_wins() {
    let mut vars = Variables::new();
    vars.insert("x".into(), Value::Integer(1));
    vars.insert("x".into(), Value::String("one".to_string()));
    assert_eq!(vars.get("x"), Some(&Value::String("one".to_string())));
    assert_eq!(vars.names().filter(|n| n.0 == "x").count(), 1);
}

#[test]
fn test_checkpoint_restore() {
    let mut vars = Variables::new();
    vars.insert("existing".into(), Value::Integer(1));

    let checkpoint = vars.checkpoint();
    vars.insert("existing".into(), Value::Integer(2));
    vars.insert("fresh".into(), Value::Boolean(true));
    assert_eq!(vars.get("existing"), Some(&Value::Integer(2)));

    vars.restore(checkpoint);
    assert_eq!(vars.get("existing"), Some(&Value::Integer(1)));
    assert_eq!(vars.get("fresh"), None);
}
