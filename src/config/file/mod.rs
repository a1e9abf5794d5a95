//! The configuration file.

use std::io::Write as _;
use std::{fs, io};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::policy::PolicyDb;

pub mod v1;

//----------- Spec -------------------------------------------------------------

/// A configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "version")]
pub enum Spec {
    /// The version 1 format.
    V1(v1::Spec),
}

//--- Conversion

impl Spec {
    /// Parse into the runtime configuration and the policy database.
    pub fn parse(self) -> Result<(Config, PolicyDb), ConfigError> {
        match self {
            Self::V1(spec) => spec.parse(),
        }
    }

    /// Build into this specification.
    pub fn build(config: &Config, db: &PolicyDb) -> Self {
        Self::V1(v1::Spec::build(config, db))
    }
}

//--- Loading / Saving

impl Spec {
    /// Load and parse this specification from a file.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Build and save this specification to a file.
    ///
    /// The text is staged in a temporary file next to the target and moved
    /// into place, so an interrupted save never leaves a half-written
    /// configuration behind.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(text.as_bytes())?;
        staged.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}
