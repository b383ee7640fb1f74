//! Engine action tables
//!
//! Every built-in function the game engine exposes to scripts ("action") is
//! identified by a numeric id. The VM's `ACTION` opcode carries that id; the
//! decompiler needs the action's name, return type and parameter list to
//! rebuild a call expression. Tables are line-oriented prototype listings,
//! one per supported game.

pub mod table;

pub use table::{Action, ActionParam, ActionsData, ActionsError};

/// Which game's action table to use
///
/// K1 is the original Knights of the Old Republic; K2 is The Sith Lords
/// (often called TSL). The two engines share most ids but K2 extends the
/// table, so the choice matters for any id past the shared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Game {
    K1,
    K2,
}

impl Game {
    /// Parse a configuration spelling; `TSL` is an accepted alias for K2
    pub fn from_str_loose(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "k1" | "kotor" | "kotor1" => Some(Game::K1),
            "k2" | "tsl" | "kotor2" => Some(Game::K2),
            _ => None,
        }
    }

    /// File name of the bundled table for this game
    pub fn table_file_name(self) -> &'static str {
        match self {
            Game::K1 => "nwscript-k1.txt",
            Game::K2 => "nwscript-k2.txt",
        }
    }
}

impl std::fmt::Display for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Game::K1 => f.write_str("K1"),
            Game::K2 => f.write_str("K2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_aliases() {
        assert_eq!(Game::from_str_loose("K1"), Some(Game::K1));
        assert_eq!(Game::from_str_loose("tsl"), Some(Game::K2));
        assert_eq!(Game::from_str_loose("K2"), Some(Game::K2));
        assert_eq!(Game::from_str_loose("nwn"), None);
    }
}
