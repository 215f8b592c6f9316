//! Recipe compilation errors.

/// Result type for expression evaluation.
pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Result type for recipe compilation.
pub type Result<T> = std::result::Result<T, RecipeError>;

/// Errors raised while evaluating a single expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// Coercion name not recognized
    #[error("Unknown coercion type: {0}")]
    UnknownCoercion(String),

    /// Value can't be converted to the requested type
    #[error("Cannot convert {from} to {to}.")]
    Conversion {
        /// Source type name
        from: &'static str,
        /// Target type name
        to: &'static str,
    },

    /// String doesn't parse as a number
    #[error("Cannot convert string \"{0}\" to number.")]
    NotANumber(String),

    /// Array range with the wrong number of elements
    #[error("Range expression must have at least two and no more than three elements.")]
    RangeLength,

    /// Range whose step would never terminate
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Range that would expand to too many values
    #[error("Range has {count} values, more than the limit of {max}")]
    RangeTooLarge {
        /// Values the range would produce
        count: f64,
        /// Largest allowed count
        max: u64,
    },

    /// Template field references an undefined variable
    #[error("Unknown name \"{0}\"")]
    UnknownName(String),

    /// Width specifier too large to parse
    #[error("Invalid format width specifier: {0}")]
    InvalidWidth(String),

    /// Object carries more than one operator key
    #[error("Conflicting operators: {0} and {1}")]
    ConflictingOperators(String, String),

    /// Value that can't be evaluated
    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    /// Operator called with bad arguments
    #[error("{0}")]
    InvalidArguments(String),

    /// List context produced a non-list
    #[error("Expected an array: {0}")]
    ExpectedArray(String),
}

/// Errors raised while expanding a recipe into tasks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecipeError {
    /// Expression failed to evaluate
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Step declares `multiplicity` with no variables
    #[error("Empty multiplicity specification")]
    EmptyMultiplicity,

    /// Two tasks evaluated to the same id
    #[error("Task id \"{0}\" is not unique.")]
    DuplicateTask(String),

    /// Dependency names no task
    #[error("Task \"{task}\" depends on non-existent task \"{depends}\".")]
    MissingDependency {
        /// Dependent task
        task: String,
        /// Missing dependency
        depends: String,
    },

    /// Dependency comes from a later step
    #[error("Task \"{task}\" cannot depend on subsequent task \"{depends}\".")]
    ForwardDependency {
        /// Dependent task
        task: String,
        /// Later task
        depends: String,
    },

    /// Dependency comes from the same step
    #[error("Task \"{task}\" cannot depend on task \"{depends}\" which is in the same step.")]
    SameStepDependency {
        /// Dependent task
        task: String,
        /// Sibling task
        depends: String,
    },
}
