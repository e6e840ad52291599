//! Host command execution for the host agent.
//!
//! Provides:
//! - Command building and placeholder templates
//! - Shell and executable resolution
//! - Bounded, cancellable command execution
//! - Mutation executors (compile-and-load, byte patch)

pub mod command;
pub mod mutation;
pub mod runner;
pub mod shell;

pub use command::{CommandBuildError, CommandBuilder, CommandParts, CommandTemplate};
pub use mutation::{BytePatchExecutor, CompileLoadExecutor, MutationExecutors};
pub use runner::{
    CommandExecution, CommandExecutor, DEFAULT_TIMEOUT, ExecutionError, ExecutionHandle,
    ExecutionState, ExecutorConfig,
};
