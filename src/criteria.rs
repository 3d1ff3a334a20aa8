//! Series selection by description.
//!
//! Criteria map a role name (`"CT"`, `"PET"`, ...) to the series descriptions
//! accepted for it. The object is shared by every patient of a run and only
//! grows: a description registered while processing one patient is matched
//! for every patient after it.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// Role reported for every series when no criteria were supplied.
pub const UNFILTERED_ROLE: &str = "unfiltered";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Role {
    name: String,
    descriptions: Vec<String>,
}

/// Role name to accepted series descriptions, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    roles: Vec<Role>,
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the criteria back to disk. Never called implicitly.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// First role, in registration order, listing `description`.
    /// Comparison is exact but case-insensitive.
    pub fn matches(&self, description: &str) -> Option<&str> {
        let wanted = description.to_lowercase();
        self.roles
            .iter()
            .find(|role| role.descriptions.iter().any(|d| d.to_lowercase() == wanted))
            .map(|role| role.name.as_str())
    }

    /// Adds `description` under `role`, creating the role if needed.
    /// Returns `false` when the role already listed it.
    pub fn register(&mut self, role: &str, description: &str) -> bool {
        let wanted = description.to_lowercase();
        match self.roles.iter_mut().find(|r| r.name == role) {
            Some(existing) => {
                if existing.descriptions.iter().any(|d| d.to_lowercase() == wanted) {
                    return false;
                }
                existing.descriptions.push(description.to_string());
            }
            None => self.roles.push(Role {
                name: role.to_string(),
                descriptions: vec![description.to_string()],
            }),
        }
        true
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(|r| r.name.as_str())
    }

    pub fn descriptions(&self, role: &str) -> Option<&[String]> {
        self.roles
            .iter()
            .find(|r| r.name == role)
            .map(|r| r.descriptions.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Role for a series under optional criteria. Absent criteria keep
/// everything under [`UNFILTERED_ROLE`]; a series without a description
/// never matches present criteria.
pub fn role_for(criteria: Option<&SelectionCriteria>, description: Option<&str>) -> Option<String> {
    match criteria {
        None => Some(UNFILTERED_ROLE.to_string()),
        Some(criteria) => description
            .and_then(|d| criteria.matches(d))
            .map(str::to_string),
    }
}

impl<const N: usize> From<[(&str, &[&str]); N]> for SelectionCriteria {
    fn from(entries: [(&str, &[&str]); N]) -> Self {
        let mut criteria = SelectionCriteria::new();
        for (role, descriptions) in entries {
            for description in descriptions {
                criteria.register(role, description);
            }
        }
        criteria
    }
}

impl Serialize for SelectionCriteria {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.roles.len()))?;
        for role in &self.roles {
            map.serialize_entry(&role.name, &role.descriptions)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SelectionCriteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CriteriaVisitor;

        impl<'de> Visitor<'de> for CriteriaVisitor {
            type Value = SelectionCriteria;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of role names to lists of series descriptions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut criteria = SelectionCriteria::new();
                while let Some((role, descriptions)) = access.next_entry::<String, Vec<String>>()? {
                    if descriptions.is_empty() && criteria.descriptions(&role).is_none() {
                        criteria.roles.push(Role {
                            name: role,
                            descriptions,
                        });
                        continue;
                    }
                    for description in &descriptions {
                        criteria.register(&role, description);
                    }
                }
                Ok(criteria)
            }
        }

        deserializer.deserialize_map(CriteriaVisitor)
    }
}
