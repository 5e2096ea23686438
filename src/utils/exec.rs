//! Executable lookup

use crate::error::{Result, SandboxError};
use std::path::{Path, PathBuf};

/// Check if a command exists on PATH
pub fn command_exists(command: &str) -> bool {
    get_command_path(command).is_ok()
}

/// Get command path
pub fn get_command_path(command: &str) -> Result<PathBuf> {
    which::which(command).map_err(|_| SandboxError::CommandNotFound(command.to_string()))
}

/// Resolve a configured program: paths are used as given, bare names are looked up on PATH
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(SandboxError::CommandNotFound(program.to_string()));
    }

    get_command_path(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("nonexistent_command_12345"));
    }

    #[test]
    fn test_resolve_bare_name() {
        let path = resolve_program("sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_resolve_missing_path() {
        let err = resolve_program("/definitely/not/here/server").unwrap_err();
        assert!(matches!(err, SandboxError::CommandNotFound(_)));
    }
}
