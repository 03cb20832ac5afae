//! Data structures used throughout the unit agent.
//!
//! These types are serialised using [`serde`](https://serde.rs/) so a
//! model can be seeded from a document.  They describe the units,
//! applications and relations the remote-state tracker follows.  Network
//! types live in [`crate::network`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::network::SpaceId;

/// Identity of a single unit, written `application/N`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId {
    application: String,
    number: u32,
}

impl UnitId {
    pub fn new(application: impl Into<String>, number: u32) -> Self {
        Self {
            application: application.into(),
            number,
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.number)
    }
}

impl std::str::FromStr for UnitId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, num) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid unit name {s:?}"))?;
        if app.is_empty() {
            return Err(format!("invalid unit name {s:?}"));
        }
        let number = num
            .parse()
            .map_err(|_| format!("invalid unit name {s:?}"))?;
        Ok(Self::new(app, number))
    }
}

impl TryFrom<String> for UnitId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.to_string()
    }
}

/// Lifecycle of a model entity.  Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// Returns the later of the two lives.
    pub fn advance(self, next: Life) -> Life {
        self.max(next)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedMode {
    #[default]
    None,
    RetryHooks,
    NoHooks,
}

pub type RelationId = i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    #[default]
    Global,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Requirer,
    Peer,
}

/// One side of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub application: String,
    pub role: Role,
    pub name: String,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    #[serde(default)]
    pub life: Life,
    #[serde(default)]
    pub scope: RelationScope,
    pub endpoints: Vec<Endpoint>,
}

impl Relation {
    /// The endpoint of `application` in this relation, if it takes part.
    pub fn endpoint(&self, application: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.application == application)
    }

    /// A human readable key such as `wordpress:db mysql:server`.
    pub fn key(&self) -> String {
        self.endpoints
            .iter()
            .map(|ep| format!("{}:{}", ep.application, ep.name))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Application-level endpoint bindings.  The empty key is the default
/// binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(BTreeMap<String, SpaceId>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, endpoint: impl Into<String>, space: impl Into<SpaceId>) -> Self {
        self.0.insert(endpoint.into(), space.into());
        self
    }

    /// Space bound to `endpoint`: explicit binding, then the default
    /// binding, then alpha.
    pub fn space_for(&self, endpoint: &str) -> SpaceId {
        self.0
            .get(endpoint)
            .or_else(|| self.0.get(""))
            .cloned()
            .unwrap_or_else(SpaceId::alpha)
    }
}

/// Delta produced by a relation-units source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationUnitsChange {
    /// Units that joined or changed settings, with their change version.
    pub changed: BTreeMap<String, i64>,
    /// Whether the remote application's settings changed.
    pub app_changed: bool,
    pub departed: BTreeSet<String>,
}

impl RelationUnitsChange {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && !self.app_changed && self.departed.is_empty()
    }
}
