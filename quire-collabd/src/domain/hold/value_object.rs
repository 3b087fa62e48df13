use crate::domain::session::{ProjectId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Document element that can be held.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err("element id cannot be empty".into());
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts string or numeric ids as sent by the editor.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(id) => Self::new(id.clone()),
            Value::Number(id) => Self::new(id.to_string()),
            other => Err(format!("element id must be a string or number, got {other}")),
        }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pessimistic lock on a set of elements within one project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hold {
    project_id: ProjectId,
    elements: BTreeSet<ElementId>,
    holder: UserId,
}

impl Hold {
    pub fn new(
        project_id: ProjectId,
        holder: UserId,
        elements: impl IntoIterator<Item = ElementId>,
    ) -> Result<Self, String> {
        let elements: BTreeSet<ElementId> = elements.into_iter().collect();
        if elements.is_empty() {
            return Err("hold requires at least one element".into());
        }
        Ok(Self {
            project_id,
            elements,
            holder,
        })
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn holder(&self) -> &UserId {
        &self.holder
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementId> {
        self.elements.iter()
    }

    pub fn covers(&self, element: &ElementId) -> bool {
        self.elements.contains(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hold_requires_elements() {
        let project = ProjectId::new("p1").unwrap();
        let user = UserId::new("u1").unwrap();
        assert!(Hold::new(project.clone(), user.clone(), Vec::new()).is_err());
        let hold = Hold::new(project, user, vec![ElementId::new("e1").unwrap()]).unwrap();
        assert!(hold.covers(&ElementId::new("e1").unwrap()));
        assert!(!hold.covers(&ElementId::new("e2").unwrap()));
    }

    #[test]
    fn element_ids_accept_numbers() {
        assert_eq!(ElementId::from_value(&json!(42)).unwrap().as_str(), "42");
        assert!(ElementId::from_value(&json!(null)).is_err());
        assert!(ElementId::from_value(&json!(" ")).is_err());
    }
}
