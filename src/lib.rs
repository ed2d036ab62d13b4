pub mod ast;
pub mod config;
pub mod error;
pub mod executor;
pub mod lexer;
pub mod logger;
pub mod parser;
pub mod storage;
pub mod value;

use storage::database::GlobalManager;

/// Tokenizes, parses, and executes one statement against `global`/`session`.
/// The one-shot pipeline shape of the teacher's own `process_query`,
/// threaded through explicit state instead of a process-wide database.
/// Lexer/parser failures are plain strings (spec §6 treats that front end as
/// an external collaborator outside the closed `error::Error` kind list);
/// both are folded into `anyhow::Error` at this boundary, per the CLI's
/// top-level error convention.
pub fn process_statement(
    global: &mut GlobalManager,
    session: &mut executor::Session,
    input: &str,
) -> anyhow::Result<String> {
    let tokens = lexer::tokenize(input).map_err(|e| anyhow::anyhow!(e))?;
    let statement = parser::parse(tokens).map_err(|e| anyhow::anyhow!(e))?;
    Ok(executor::execute(global, session, statement)?)
}
