pub mod ast;
pub mod eval;
pub mod functions;
pub mod parse;
pub mod runtime;
pub mod value;
pub mod variables;
