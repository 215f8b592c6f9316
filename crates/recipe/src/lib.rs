//! Recipe compiler for Factory.
//!
//! Expands a [`Recipe`](factory_core::Recipe) and a set of submission
//! arguments into a dependency-ordered list of [`Task`]s.

#![warn(missing_docs)]

pub mod error;
pub mod evaluator;
mod task;
mod task_set;

pub use error::{EvalError, RecipeError, Result};
pub use evaluator::{Coercion, Env, Operator, Range};
pub use task::Task;
pub use task_set::{compile, TaskSet};
