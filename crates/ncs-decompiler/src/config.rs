//! Decompiler configuration
//!
//! One `Config` value is passed into `FileDecompiler` at construction.
//! Nothing here is process-global; two decompilers with different configs
//! can coexist.

use ncs_actions::Game;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Full decompiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Which game's action table applies
    #[serde(with = "game_serde")]
    pub game: Game,
    /// Emit `switch` even for single-arm equality chains
    pub prefer_switches: bool,
    /// Report unresolved subroutine signatures as errors instead of warnings
    pub strict_signatures: bool,
    /// Post-emission repair passes
    pub repairs: RepairOptions,
    /// External round-trip compiler; `None` caps the outcome at
    /// partial-compile
    pub compiler_path: Option<PathBuf>,
    /// Explicit action table file, overriding the search paths
    pub actions_path: Option<PathBuf>,
    /// Extra directories searched for action tables
    pub actions_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game: Game::K1,
            prefer_switches: true,
            strict_signatures: false,
            repairs: RepairOptions::default(),
            compiler_path: None,
            actions_path: None,
            actions_dirs: Vec::new(),
        }
    }
}

/// Output repair toggles
///
/// Repairs run only when validation of the emitted tree fails, and at most
/// `max_passes` times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RepairOptions {
    /// Master switch
    pub enabled: bool,
    /// Synthesize declarations for placeholder variables invented during
    /// recovery
    pub declare_missing: bool,
    /// Disambiguate duplicate identifiers
    pub rename_collisions: bool,
    /// Comment out calls to actions absent from the table
    pub stub_unknown_actions: bool,
    /// Upper bound on repair passes
    pub max_passes: u32,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            declare_missing: true,
            rename_collisions: true,
            stub_unknown_actions: true,
            max_passes: 3,
        }
    }
}

mod game_serde {
    use ncs_actions::Game;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(game: &Game, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&game.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Game, D::Error> {
        let text = String::deserialize(de)?;
        Game::from_str_loose(&text)
            .ok_or_else(|| de::Error::custom(format!("unknown game \"{text}\"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.game, Game::K1);
        assert!(config.prefer_switches);
        assert!(config.repairs.enabled);
        assert_eq!(config.repairs.max_passes, 3);
        assert!(config.compiler_path.is_none());
    }

    #[test]
    fn test_game_accepts_tsl_alias() {
        use serde::de::value::{Error, StrDeserializer};
        use serde::de::IntoDeserializer;
        let de: StrDeserializer<Error> = "tsl".into_deserializer();
        assert_eq!(super::game_serde::deserialize(de).unwrap(), Game::K2);
        let de: StrDeserializer<Error> = "nwn".into_deserializer();
        assert!(super::game_serde::deserialize(de).is_err());
    }
}
