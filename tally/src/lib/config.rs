//! Process-wide configuration, read from the environment once at init.

use std::env;
use std::path::PathBuf;

pub const STRATEGY_VAR: &str = "PACKRAT_STRATEGY";
pub const DIR_VAR: &str = "PACKRAT_DIR";
pub const ARENA_BASE_VAR: &str = "PACKRAT_ARENA_BASE";
pub const ARENA_SIZE_VAR: &str = "PACKRAT_ARENA_SIZE";

pub const DEFAULT_DIR: &str = "packrat";
pub const DEFAULT_ARENA_BASE: usize = 0x0500_0000;
pub const DEFAULT_ARENA_SIZE: usize = 0x8000_0000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrategyKind {
    /// One file-backed mapping per allocation (the default).
    Files,
    /// Single fixed-address bump arena.
    Arena,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub strategy: StrategyKind,
    /// Diagnostic directory for the files strategy.
    pub dir: PathBuf,
    /// Base address hint for the arena mapping; `None` lets the kernel pick.
    pub arena_base: Option<usize>,
    pub arena_size: usize,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            strategy: StrategyKind::Files,
            dir: PathBuf::from(DEFAULT_DIR),
            arena_base: Some(DEFAULT_ARENA_BASE),
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl Settings {
    pub fn from_env() -> Settings {
        let mut settings = Settings::default();

        if let Ok(kind) = env::var(STRATEGY_VAR) {
            if kind.eq_ignore_ascii_case("arena") {
                settings.strategy = StrategyKind::Arena;
            }
        }
        if let Some(dir) = env::var_os(DIR_VAR) {
            if !dir.is_empty() {
                settings.dir = PathBuf::from(dir);
            }
        }
        if let Some(base) = env::var(ARENA_BASE_VAR).ok().as_deref().and_then(parse_number) {
            // An explicit zero means "anywhere".
            settings.arena_base = if base == 0 { None } else { Some(base) };
        }
        if let Some(size) = env::var(ARENA_SIZE_VAR).ok().as_deref().and_then(parse_number) {
            if size > 0 {
                settings.arena_size = size;
            }
        }

        settings
    }
}

fn parse_number(text: &str) -> Option<usize> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_parse_in_both_bases() {
        assert_eq!(parse_number("0x5000000"), Some(0x0500_0000));
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("junk"), None);
    }
}
