//! External round-trip validation
//!
//! Feeds the emitted source back through an external NSS compiler and
//! byte-compares the result against the original input. The comparison is
//! strictly lock-step; there is no read-ahead.

use ncs_actions::Game;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Bridge failures
#[derive(Debug, Error)]
pub enum RoundTripError {
    /// The external compiler could not be spawned
    #[error("Failed to run compiler {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The compiler exited unsuccessfully
    #[error("Compiler exited with {status}: {stderr}")]
    CompileFailed { status: String, stderr: String },

    /// Scratch files could not be written or read
    #[error("Round-trip I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-compare outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Bitwise identical
    Identical,
    /// Different bytes but lengths within one MOVSP of each other
    SameLengthClass,
    /// Different beyond the tolerated drift
    Different,
}

/// One MOVSP instruction: opcode + qualifier + i32 operand
const MOVSP_LEN: usize = 6;

/// Lock-step byte comparison
pub fn compare_bytes(original: &[u8], recompiled: &[u8]) -> Comparison {
    if original == recompiled {
        return Comparison::Identical;
    }
    let drift = original.len().abs_diff(recompiled.len());
    if drift <= MOVSP_LEN {
        Comparison::SameLengthClass
    } else {
        Comparison::Different
    }
}

static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Recompile `source` with the external compiler, returning the bytes
///
/// Blocking; the core treats the external process as a synchronous
/// collaborator. Scratch files land in the system temp directory and are
/// removed on success.
pub fn recompile(compiler: &Path, source: &str, game: Game) -> Result<Vec<u8>, RoundTripError> {
    let stamp = format!(
        "ncsdc-{}-{}",
        std::process::id(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let dir = std::env::temp_dir();
    let nss_path = dir.join(format!("{stamp}.nss"));
    let ncs_path = dir.join(format!("{stamp}.ncs"));
    std::fs::write(&nss_path, source)?;

    let game_flag = match game {
        Game::K1 => "1",
        Game::K2 => "2",
    };
    let output = Command::new(compiler)
        .arg("-c")
        .arg("-g")
        .arg(game_flag)
        .arg(&nss_path)
        .arg(&ncs_path)
        .output()
        .map_err(|source| RoundTripError::Spawn {
            path: compiler.to_path_buf(),
            source,
        })?;

    let _ = std::fs::remove_file(&nss_path);
    if !output.status.success() {
        let _ = std::fs::remove_file(&ncs_path);
        return Err(RoundTripError::CompileFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let bytes = std::fs::read(&ncs_path)?;
    let _ = std::fs::remove_file(&ncs_path);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical() {
        assert_eq!(compare_bytes(b"abc", b"abc"), Comparison::Identical);
    }

    #[test]
    fn test_same_length_class() {
        // One extra MOVSP's worth of bytes still counts as the same class.
        let original = vec![0u8; 100];
        let longer = vec![0u8; 106];
        assert_eq!(
            compare_bytes(&original, &longer),
            Comparison::SameLengthClass
        );
        let mut tweaked = original.clone();
        tweaked[50] = 1;
        assert_eq!(
            compare_bytes(&original, &tweaked),
            Comparison::SameLengthClass
        );
    }

    #[test]
    fn test_different() {
        let original = vec![0u8; 100];
        let far = vec![0u8; 120];
        assert_eq!(compare_bytes(&original, &far), Comparison::Different);
    }

    #[test]
    fn test_missing_compiler_is_spawn_error() {
        let result = recompile(
            Path::new("/nonexistent/nwnnsscomp"),
            "void main() {}",
            Game::K1,
        );
        assert!(matches!(result, Err(RoundTripError::Spawn { .. })));
    }
}
