/// Catalog records handed to the launcher core
///
/// Catalog readers produce plain serde records; [`GameDetail::resolve`]
/// binds a record's URIs to cache resources.
use crate::cache::{Cache, Resource};
use crate::config::types::{LauncherError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where a game's catalog entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Embedded in a page; launched applet-style.
    #[default]
    MarkupHosted,
    /// Described by a launch descriptor; launched as a standalone app.
    DescriptorHosted,
}

/// Launch style a configuration is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStyle {
    Applet,
    Standalone,
}

impl From<SourceKind> for GameStyle {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::MarkupHosted => GameStyle::Applet,
            SourceKind::DescriptorHosted => GameStyle::Standalone,
        }
    }
}

impl GameStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStyle::Applet => "applet",
            GameStyle::Standalone => "standalone",
        }
    }
}

impl fmt::Display for GameStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GameStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "applet" => Ok(GameStyle::Applet),
            "standalone" => Ok(GameStyle::Standalone),
            other => Err(format!("unknown game style {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub text: String,
}

/// Catalog metadata for one game
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameDescription {
    pub name: String,
    pub id: String,
    pub author: String,
    pub description: String,
    pub submitted: Option<DateTime<Utc>>,
    pub icon: Option<String>,
    pub source: SourceKind,
    pub comments: Vec<Comment>,
}

/// Width and height of an applet-style game area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSize {
    pub width: u32,
    pub height: u32,
}

/// Launch record as produced by a detail reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDetailRecord {
    pub description: GameDescription,
    pub entry: String,
    pub archive: String,
    pub document_base: String,
    #[serde(default)]
    pub size: Option<GameSize>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Resolved launch artifact for one game
#[derive(Debug, Clone)]
pub struct GameDetail {
    pub description: GameDescription,
    /// Archive entry started as the game's main unit.
    pub entry: String,
    pub archive: Resource,
    pub document_base: Resource,
    pub size: Option<GameSize>,
    pub parameters: BTreeMap<String, String>,
}

impl GameDetail {
    /// Bind a record to resources of `cache`. Archives are static, the
    /// document base is volatile.
    pub fn resolve(record: GameDetailRecord, cache: &Cache) -> Result<Self> {
        if record.entry.trim().is_empty() {
            return Err(LauncherError::Config(format!(
                "game {} has no entry point",
                record.description.name
            )));
        }
        let archive = cache.get_resource(cache.uri(&record.archive)?, true)?;
        let document_base = cache.get_resource(cache.uri(&record.document_base)?, false)?;
        Ok(Self {
            description: record.description,
            entry: record.entry,
            archive,
            document_base,
            size: record.size,
            parameters: record.parameters,
        })
    }

    pub fn name(&self) -> &str {
        if self.description.name.is_empty() {
            &self.entry
        } else {
            &self.description.name
        }
    }

    pub fn style(&self) -> GameStyle {
        self.description.source.into()
    }
}
