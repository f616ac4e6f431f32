//! Command resolution: runtime label + raw start command → executable invocation.
//!
//! Owners type start commands inconsistently (`node index.js` vs `index.js`).
//! For known runtimes the interpreter is forced unless the command already
//! names an accepted launcher, so `npm start` is honored as written.

use crate::error::{Result, SupervisorError};

const NODE_LAUNCHERS: &[&str] = &["node", "npm", "yarn"];
const PYTHON_LAUNCHERS: &[&str] = &["python", "python3"];

/// Program plus argument list, ready for spawning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn forced(program: &str, script: &str) -> Self {
        Self {
            program: program.to_string(),
            args: vec![script.to_string()],
        }
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Resolve a bot's start command for its runtime.
///
/// Node runtimes without a `node`/`npm`/`yarn` launcher run as
/// `node <command>`, Python runtimes without `python`/`python3` run as
/// `python3 <command>`; the whole command is passed as one argument.
/// Any other runtime is split on whitespace and passed through.
pub fn resolve(runtime: &str, start_command: &str) -> Result<Invocation> {
    let command = start_command.trim();
    let mut tokens = command.split_whitespace();
    let Some(first) = tokens.next() else {
        return Err(SupervisorError::InvalidCommand(format!(
            "empty start command for runtime '{}'",
            runtime
        )));
    };

    if runtime.contains("Node") && !NODE_LAUNCHERS.contains(&first) {
        return Ok(Invocation::forced("node", command));
    }

    if runtime.contains("Python") && !PYTHON_LAUNCHERS.contains(&first) {
        return Ok(Invocation::forced("python3", command));
    }

    Ok(Invocation {
        program: first.to_string(),
        args: tokens.map(str::to_string).collect(),
    })
}
