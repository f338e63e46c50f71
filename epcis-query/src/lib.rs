//! The dynamic query engine: the closed parameter grammar, the typed
//! predicate AST it compiles to, reference evaluation semantics, pagination
//! cursors, and the two-phase execution engine.

pub mod cursor;
pub mod engine;
pub mod eval;
pub mod params;
pub mod predicate;
