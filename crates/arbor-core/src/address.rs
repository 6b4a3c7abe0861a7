//! Hierarchical addresses into the repository tree.
//!
//! An address names a repository, a model inside it, an object inside that
//! model, or a field inside that object:
//!
//! ```text
//! /repo                    repository
//! /repo/model              model
//! /repo/model/object       object
//! /repo/model/object/field field
//! ```
//!
//! Addresses are ordered by prefix containment: `/r/m` contains itself,
//! `/r/m/o` and `/r/m/o/f`, but not `/r/n`. Two addresses *overlap* when
//! either contains the other, which is the basis of lock conflicts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

/// Errors raised while building or parsing addresses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Identifier must not be empty")]
    EmptyId,

    #[error("Identifier contains a path separator: {0}")]
    InvalidId(String),

    #[error("Malformed address: {0}")]
    Malformed(String),

    #[error("Cannot add a child below a field address: {0}")]
    TooDeep(String),
}

/// A single path segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id(String);

impl Id {
    pub fn new(id: impl Into<String>) -> Result<Self, AddressError> {
        let id = id.into();
        if id.is_empty() {
            return Err(AddressError::EmptyId);
        }
        if id.contains('/') {
            return Err(AddressError::InvalidId(id));
        }
        Ok(Self(id))
    }

    /// A fresh, lexicographically sortable identifier.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Id {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Id::new(value)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The level of the tree an address points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressKind {
    Repository,
    Model,
    Object,
    Field,
}

/// A path of zero to three levels below a repository.
///
/// Invariant: `object` is only set when `model` is, `field` only when `object` is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    repository: Id,
    model: Option<Id>,
    object: Option<Id>,
    field: Option<Id>,
}

impl Address {
    pub fn repository(repository: &str) -> Result<Self, AddressError> {
        Ok(Self {
            repository: Id::new(repository)?,
            model: None,
            object: None,
            field: None,
        })
    }

    pub fn model(repository: &str, model: &str) -> Result<Self, AddressError> {
        Self::repository(repository)?.with_model(model)
    }

    pub fn object(repository: &str, model: &str, object: &str) -> Result<Self, AddressError> {
        Self::model(repository, model)?.with_object(object)
    }

    pub fn field(
        repository: &str,
        model: &str,
        object: &str,
        field: &str,
    ) -> Result<Self, AddressError> {
        Self::object(repository, model, object)?.with_field(field)
    }

    /// The model `id` inside this repository.
    pub fn with_model(&self, id: &str) -> Result<Self, AddressError> {
        if self.kind() != AddressKind::Repository {
            return Err(AddressError::Malformed(format!("{}/{}", self, id)));
        }
        Ok(Self {
            model: Some(Id::new(id)?),
            ..self.clone()
        })
    }

    /// The object `id` inside this model.
    pub fn with_object(&self, id: &str) -> Result<Self, AddressError> {
        if self.kind() != AddressKind::Model {
            return Err(AddressError::Malformed(format!("{}/{}", self, id)));
        }
        Ok(Self {
            object: Some(Id::new(id)?),
            ..self.clone()
        })
    }

    /// The field `id` inside this object.
    pub fn with_field(&self, id: &str) -> Result<Self, AddressError> {
        match self.kind() {
            AddressKind::Object => Ok(Self {
                field: Some(Id::new(id)?),
                ..self.clone()
            }),
            AddressKind::Field => Err(AddressError::TooDeep(self.to_string())),
            _ => Err(AddressError::Malformed(format!("{}/{}", self, id))),
        }
    }

    pub fn kind(&self) -> AddressKind {
        match (&self.model, &self.object, &self.field) {
            (None, _, _) => AddressKind::Repository,
            (Some(_), None, _) => AddressKind::Model,
            (Some(_), Some(_), None) => AddressKind::Object,
            (Some(_), Some(_), Some(_)) => AddressKind::Field,
        }
    }

    /// Number of levels below the repository (0..=3).
    pub fn depth(&self) -> usize {
        self.segments().count() - 1
    }

    pub fn repository_id(&self) -> &Id {
        &self.repository
    }

    pub fn model_id(&self) -> Option<&Id> {
        self.model.as_ref()
    }

    pub fn object_id(&self) -> Option<&Id> {
        self.object.as_ref()
    }

    pub fn field_id(&self) -> Option<&Id> {
        self.field.as_ref()
    }

    /// The innermost id of this address.
    pub fn id(&self) -> &Id {
        self.field
            .as_ref()
            .or(self.object.as_ref())
            .or(self.model.as_ref())
            .unwrap_or(&self.repository)
    }

    /// The enclosing address, or `None` for a repository.
    pub fn parent(&self) -> Option<Self> {
        let mut parent = self.clone();
        if parent.field.take().is_some() {
            return Some(parent);
        }
        if parent.object.take().is_some() {
            return Some(parent);
        }
        if parent.model.take().is_some() {
            return Some(parent);
        }
        None
    }

    /// The model this address lives in (itself for a model address).
    pub fn model_address(&self) -> Option<Self> {
        self.model.as_ref().map(|model| Self {
            repository: self.repository.clone(),
            model: Some(model.clone()),
            object: None,
            field: None,
        })
    }

    /// The object this address lives in (itself for an object address).
    pub fn object_address(&self) -> Option<Self> {
        self.object.as_ref().map(|object| Self {
            repository: self.repository.clone(),
            model: self.model.clone(),
            object: Some(object.clone()),
            field: None,
        })
    }

    /// True if `other` is this address or one of its descendants.
    pub fn contains(&self, other: &Address) -> bool {
        self.depth() <= other.depth()
            && self
                .segments()
                .zip(other.segments())
                .all(|(mine, theirs)| mine == theirs)
    }

    /// True if either address contains the other.
    pub fn overlaps(&self, other: &Address) -> bool {
        self.contains(other) || other.contains(self)
    }

    fn segments(&self) -> impl Iterator<Item = &Id> {
        std::iter::once(&self.repository)
            .chain(self.model.iter())
            .chain(self.object.iter())
            .chain(self.field.iter())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in self.segments() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [repo] => Address::repository(repo),
            [repo, model] => Address::model(repo, model),
            [repo, model, object] => Address::object(repo, model, object),
            [repo, model, object, field] => Address::field(repo, model, object, field),
            _ => Err(AddressError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
