//! Custom lists: user-defined named groups of locations.

use crate::constraints::GeographicLocationConstraint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Longest accepted custom list name (in characters)
pub const CUSTOM_LIST_NAME_MAX_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomListId(Uuid);

impl CustomListId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CustomListId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CustomListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomList {
    pub id: CustomListId,
    pub name: String,
    pub locations: Vec<GeographicLocationConstraint>,
}

impl CustomList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CustomListId::new(),
            name: name.into(),
            locations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomListsSettings {
    pub custom_lists: Vec<CustomList>,
}

impl CustomListsSettings {
    pub fn find(&self, id: &CustomListId) -> Option<&CustomList> {
        self.custom_lists.iter().find(|list| list.id == *id)
    }

    pub fn find_mut(&mut self, id: &CustomListId) -> Option<&mut CustomList> {
        self.custom_lists.iter_mut().find(|list| list.id == *id)
    }

    pub fn contains(&self, id: &CustomListId) -> bool {
        self.find(id).is_some()
    }

    /// Returns the removed list, if any
    pub fn remove(&mut self, id: &CustomListId) -> Option<CustomList> {
        let index = self.custom_lists.iter().position(|list| list.id == *id)?;
        Some(self.custom_lists.remove(index))
    }

    /// Check names and ids: non-empty, bounded, unique
    pub fn validate(&self) -> Result<(), CustomListError> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();

        for list in &self.custom_lists {
            let name = list.name.trim();
            if name.is_empty() {
                return Err(CustomListError::EmptyName);
            }
            if name.chars().count() > CUSTOM_LIST_NAME_MAX_LEN {
                return Err(CustomListError::NameTooLong(list.name.clone()));
            }
            if !names.insert(name.to_lowercase()) {
                return Err(CustomListError::DuplicateName(list.name.clone()));
            }
            if !ids.insert(list.id) {
                return Err(CustomListError::DuplicateId(list.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CustomListError {
    #[error("Custom list name must not be empty")]
    EmptyName,

    #[error("Custom list name too long: {0}")]
    NameTooLong(String),

    #[error("A custom list named {0:?} already exists")]
    DuplicateName(String),

    #[error("Duplicate custom list id {0}")]
    DuplicateId(CustomListId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(names: &[&str]) -> CustomListsSettings {
        CustomListsSettings {
            custom_lists: names.iter().map(|name| CustomList::new(*name)).collect(),
        }
    }

    #[test]
    fn test_unique_names_required() {
        assert!(lists(&["work", "home"]).validate().is_ok());
        assert_eq!(
            lists(&["work", "Work"]).validate(),
            Err(CustomListError::DuplicateName("Work".into()))
        );
    }

    #[test]
    fn test_name_bounds() {
        assert_eq!(lists(&["  "]).validate(), Err(CustomListError::EmptyName));
        let long = "x".repeat(CUSTOM_LIST_NAME_MAX_LEN + 1);
        assert!(matches!(
            lists(&[long.as_str()]).validate(),
            Err(CustomListError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_remove_by_id() {
        let mut settings = lists(&["a", "b"]);
        let id = settings.custom_lists[0].id;

        assert_eq!(settings.remove(&id).map(|l| l.name), Some("a".to_string()));
        assert!(!settings.contains(&id));
        assert!(settings.remove(&id).is_none());
    }
}
