//! Front end for the GAL language: lexing, parsing, AST optimization and
//! bytecode codegen, composed into one `compile` entry point that turns
//! source bytes into a `gal_core::Chunk` ready for the runtime to load.

pub mod ast;
pub mod compiler;
pub mod diagnostics;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod token;

use gal_core::Chunk;

pub use ast::Ast;
pub use diagnostics::{CompileError, Diagnostic, Location, Position};
pub use parser::ParseResult;

/// Compiles a complete source unit to a `Chunk`. Parse errors are fatal
/// here (unlike `parser::parse`, which collects and keeps going) because
/// there is no sound bytecode to hand the runtime once any statement
/// failed to parse; callers that want the partial AST and diagnostics
/// for tooling (a language server, say) should call `parser::parse`
/// directly instead.
pub fn compile(source: &[u8], debug_name: Option<&str>) -> Result<Chunk, CompileUnitError> {
    let mut result = parser::parse(source);
    if !result.errors.is_empty() {
        tracing::debug!(errors = result.errors.len(), ?debug_name, "parse failed");
        return Err(CompileUnitError::Parse(result.errors));
    }
    optimizer::optimize(&mut result.ast, result.root);
    let chunk = compiler::compile(&result.ast, result.root, debug_name).map_err(CompileUnitError::Compile)?;
    tracing::debug!(prototypes = chunk.prototypes.len(), ?debug_name, "compiled a chunk");
    Ok(chunk)
}

/// Everything that can go wrong turning source into a `Chunk`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileUnitError {
    #[error("{} syntax error(s)", .0.len())]
    Parse(Vec<Diagnostic>),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_minimal_program() {
        let chunk = compile(b"return 1 + 2", Some("inline")).expect("compiles");
        assert_eq!(chunk.main_prototype as usize, chunk.prototypes.len() - 1);
    }

    #[test]
    fn reports_syntax_errors_without_panicking() {
        let err = compile(b"local = ", None).unwrap_err();
        assert!(matches!(err, CompileUnitError::Parse(_)));
    }
}
