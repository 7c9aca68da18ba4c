// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::path::Path;

use config::{Config, File};

mod error;
mod player;
mod score;

pub use self::error::ConfigError;
pub use self::player::{Link, Player};

/// Loads the player configuration. The format follows the file extension.
pub fn load_player(path: &Path) -> Result<Player, ConfigError> {
    Ok(Config::builder()
        .add_source(File::from(path))
        .build()?
        .try_deserialize()?)
}

/// Loads and validates a score file. The format follows the file extension.
pub fn load_score(path: &Path) -> Result<crate::score::Score, ConfigError> {
    let score: score::Score = Config::builder()
        .add_source(File::from(path))
        .build()?
        .try_deserialize()?;
    score.to_score()
}
