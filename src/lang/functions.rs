use std::collections::BTreeMap;
use std::rc::Rc;

use crate::lang::ast::{FunctionDef, Identifier};

/// User defined functions, keyed by name
///
/// Entries live until the name is defined again.
#[derive(Default)]
pub struct Functions {
    inner: BTreeMap<Identifier, Rc<FunctionDef>>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: Rc<FunctionDef>) {
        self.inner.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<Rc<FunctionDef>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &Identifier> {
        self.inner.keys()
    }
}

#[test]
fn test_redefine() {
    let mut funcs = Functions::new();
    let first = Rc::new(FunctionDef {
        name: "f".into(),
        params: vec!["a".into()],
        body: vec![],
    });
    let second = Rc::new(FunctionDef {
        name: "f".into(),
        params: vec![],
        body: vec![],
    });

    funcs.define(first);
    assert_eq!(funcs.get("f").map(|f| f.params.len()), Some(1));

    funcs.define(second);
    assert_eq!(funcs.get("f").map(|f| f.params.len()), Some(0));
    assert_eq!(funcs.names().count(), 1);
    assert!(funcs.get("g").is_none());
}
