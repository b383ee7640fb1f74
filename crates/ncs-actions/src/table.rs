//! Action table parsing and lookup
//!
//! The table format is a line-oriented prototype listing in NSS spelling:
//!
//! ```text
//! // 0: Get the module.
//! object GetModule();
//! void PrintString(string sString);
//! int GetLocalBoolean(object oObject, int nIndex);
//! void SetListening(object oObject, int bValue = TRUE);
//! ```
//!
//! Ids are assigned by prototype order: the first prototype is action 0.
//! Comment and blank lines are skipped. Parameter defaults may themselves
//! contain parenthesized constructor calls, so splitting respects nesting.

use crate::Game;
use ncs_bytecode::NssType;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while locating or parsing an action table
#[derive(Debug, Error)]
pub enum ActionsError {
    /// No table file found for the selected game
    #[error("No action table found for {game}; searched {searched:?}")]
    TableNotFound { game: Game, searched: Vec<PathBuf> },

    /// Table file could not be read
    #[error("Failed to read action table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A prototype line did not parse
    #[error("Malformed prototype at line {line}: {text}")]
    MalformedPrototype { line: usize, text: String },

    /// A prototype used a type keyword the VM does not know
    #[error("Unknown type \"{word}\" at line {line}")]
    UnknownType { line: usize, word: String },
}

/// One parameter of an action
#[derive(Debug, Clone, PartialEq)]
pub struct ActionParam {
    pub ty: NssType,
    pub name: String,
    /// Default value, verbatim source text
    pub default: Option<String>,
}

/// One engine action
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: u16,
    pub name: String,
    pub returns: NssType,
    pub params: Vec<ActionParam>,
}

impl Action {
    /// Parameters without a default; the VM always pushes at least these
    pub fn required_params(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }
}

/// A loaded action table
#[derive(Debug, Clone)]
pub struct ActionsData {
    pub game: Game,
    actions: Vec<Action>,
}

static PROTOTYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([a-z]+)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*;\s*(?://.*)?$").unwrap()
});

impl ActionsData {
    /// Parse a table from its text form
    pub fn parse(game: Game, text: &str) -> Result<Self, ActionsError> {
        let mut actions = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let line_no = idx + 1;
            let caps = PROTOTYPE
                .captures(line)
                .ok_or_else(|| ActionsError::MalformedPrototype {
                    line: line_no,
                    text: line.to_string(),
                })?;
            let returns = NssType::from_keyword(&caps[1]).ok_or_else(|| {
                ActionsError::UnknownType {
                    line: line_no,
                    word: caps[1].to_string(),
                }
            })?;
            let name = caps[2].to_string();
            let params = parse_params(&caps[3], line_no)?;
            actions.push(Action {
                id: actions.len() as u16,
                name,
                returns,
                params,
            });
        }
        Ok(Self { game, actions })
    }

    /// Load a table from a file on disk
    pub fn load(game: Game, path: &Path) -> Result<Self, ActionsError> {
        let text = std::fs::read_to_string(path).map_err(|source| ActionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(game, &text)
    }

    /// Locate and load the table for a game
    ///
    /// Search order: the explicit override, then each extra directory, then
    /// the directory of the running executable. The searched paths are kept
    /// in the error so the failure stub can report them.
    pub fn locate(
        game: Game,
        override_path: Option<&Path>,
        extra_dirs: &[PathBuf],
    ) -> Result<Self, ActionsError> {
        let mut searched = Vec::new();
        if let Some(path) = override_path {
            searched.push(path.to_path_buf());
            if path.is_file() {
                return Self::load(game, path);
            }
        }
        for dir in extra_dirs {
            let candidate = dir.join(game.table_file_name());
            if candidate.is_file() {
                return Self::load(game, &candidate);
            }
            searched.push(candidate);
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join(game.table_file_name());
                if candidate.is_file() {
                    return Self::load(game, &candidate);
                }
                searched.push(candidate);
            }
        }
        Err(ActionsError::TableNotFound { game, searched })
    }

    /// Look up an action by id; absent ids are an expected failure mode
    pub fn get(&self, id: u16) -> Option<&Action> {
        self.actions.get(id as usize)
    }

    /// All actions in id order
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Number of actions in the table
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Split a parameter list on commas, respecting nesting and quotes
fn parse_params(text: &str, line_no: usize) -> Result<Vec<ActionParam>, ActionsError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut params = Vec::new();
    for piece in split_top_level(trimmed) {
        params.push(parse_param(piece.trim(), line_no)?);
    }
    Ok(params)
}

fn parse_param(text: &str, line_no: usize) -> Result<ActionParam, ActionsError> {
    let (decl, default) = match split_once_top_level(text, '=') {
        Some((lhs, rhs)) => (lhs.trim(), Some(rhs.trim().to_string())),
        None => (text, None),
    };
    let mut words = decl.split_whitespace();
    let ty_word = words.next().ok_or_else(|| ActionsError::MalformedPrototype {
        line: line_no,
        text: text.to_string(),
    })?;
    let ty = NssType::from_keyword(ty_word).ok_or_else(|| ActionsError::UnknownType {
        line: line_no,
        word: ty_word.to_string(),
    })?;
    let name = words
        .next()
        .ok_or_else(|| ActionsError::MalformedPrototype {
            line: line_no,
            text: text.to_string(),
        })?
        .to_string();
    Ok(ActionParam { ty, name, default })
}

/// Split on top-level commas only
fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '(' | '[' if !in_string => depth += 1,
            ')' | ']' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Split at the first top-level occurrence of `sep`
fn split_once_top_level(text: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, ch) in text.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '(' | '[' if !in_string => depth += 1,
            ')' | ']' if !in_string => depth = depth.saturating_sub(1),
            c if c == sep && !in_string && depth == 0 => {
                return Some((&text[..i], &text[i + 1..]));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
// Action table excerpt
object GetModule();
void PrintString(string sString);
int GetLocalBoolean(object oObject, int nIndex);

// defaults with nested calls
void ApplyEffectAtLocation(int nDurationType, effect eEffect, location lLocation, float fDuration = 0.0);
object GetNearestCreature(int nFirstCriteriaType, int nFirstCriteriaValue, object oTarget = OBJECT_SELF, int nNth = 1);
"#;

    #[test]
    fn test_ids_follow_prototype_order() {
        let table = ActionsData::parse(Game::K1, SAMPLE).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get(0).unwrap().name, "GetModule");
        assert_eq!(table.get(1).unwrap().name, "PrintString");
        assert_eq!(table.get(4).unwrap().name, "GetNearestCreature");
        assert!(table.get(5).is_none());
    }

    #[test]
    fn test_return_and_param_types() {
        let table = ActionsData::parse(Game::K1, SAMPLE).unwrap();
        let action = table.get(2).unwrap();
        assert_eq!(action.returns, NssType::Int);
        assert_eq!(action.params.len(), 2);
        assert_eq!(action.params[0].ty, NssType::Object);
        assert_eq!(action.params[1].ty, NssType::Int);
        assert_eq!(action.params[1].name, "nIndex");
    }

    #[test]
    fn test_defaults() {
        let table = ActionsData::parse(Game::K1, SAMPLE).unwrap();
        let nearest = table.get(4).unwrap();
        assert_eq!(nearest.params[2].default.as_deref(), Some("OBJECT_SELF"));
        assert_eq!(nearest.params[3].default.as_deref(), Some("1"));
        assert_eq!(nearest.required_params(), 2);
    }

    #[test]
    fn test_default_with_nested_parens() {
        let text = "void Foo(location lLoc = Location(GetModule(), [0.0,0.0,0.0], 0.0), int n = 2);";
        let table = ActionsData::parse(Game::K2, text).unwrap();
        let action = table.get(0).unwrap();
        assert_eq!(action.params.len(), 2);
        assert_eq!(
            action.params[0].default.as_deref(),
            Some("Location(GetModule(), [0.0,0.0,0.0], 0.0)")
        );
    }

    #[test]
    fn test_malformed_line() {
        let err = ActionsData::parse(Game::K1, "not a prototype").unwrap_err();
        assert!(matches!(err, ActionsError::MalformedPrototype { line: 1, .. }));
    }

    #[test]
    fn test_unknown_type() {
        let err = ActionsData::parse(Game::K1, "number Foo();").unwrap_err();
        assert!(matches!(err, ActionsError::UnknownType { .. }));
    }
}
