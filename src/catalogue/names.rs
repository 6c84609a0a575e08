//! Names of database objects
//!
//! Names are the identity of DBOs: sub-unit caches and the lock table are
//! keyed by `Name`. Display forms are dotted paths (`warren.books.title`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of an entity in this schema
    pub fn entity(&self, name: impl Into<String>) -> EntityName {
        EntityName {
            schema: self.0.clone(),
            entity: name.into().to_lowercase(),
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of an entity (table)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    schema: String,
    entity: String,
}

impl EntityName {
    pub fn new(schema: impl Into<String>, entity: impl Into<String>) -> Self {
        SchemaName::new(schema).entity(entity)
    }

    pub fn schema(&self) -> SchemaName {
        SchemaName(self.schema.clone())
    }

    pub fn simple(&self) -> &str {
        &self.entity
    }

    pub fn column(&self, name: impl Into<String>) -> ColumnName {
        ColumnName {
            schema: self.schema.clone(),
            entity: self.entity.clone(),
            column: name.into().to_lowercase(),
        }
    }

    pub fn index(&self, name: impl Into<String>) -> IndexName {
        IndexName {
            schema: self.schema.clone(),
            entity: self.entity.clone(),
            index: name.into().to_lowercase(),
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.entity)
    }
}

/// Name of a column
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnName {
    schema: String,
    entity: String,
    column: String,
}

impl ColumnName {
    pub fn new(
        schema: impl Into<String>,
        entity: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        EntityName::new(schema, entity).column(column)
    }

    pub fn entity(&self) -> EntityName {
        EntityName {
            schema: self.schema.clone(),
            entity: self.entity.clone(),
        }
    }

    pub fn simple(&self) -> &str {
        &self.column
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.entity, self.column)
    }
}

/// Name of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexName {
    schema: String,
    entity: String,
    index: String,
}

impl IndexName {
    pub fn new(
        schema: impl Into<String>,
        entity: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        EntityName::new(schema, entity).index(index)
    }

    pub fn entity(&self) -> EntityName {
        EntityName {
            schema: self.schema.clone(),
            entity: self.entity.clone(),
        }
    }

    pub fn simple(&self) -> &str {
        &self.index
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.entity, self.index)
    }
}

/// Identity of any DBO
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Name {
    Catalogue,
    Schema(SchemaName),
    Entity(EntityName),
    Column(ColumnName),
    Index(IndexName),
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Catalogue => f.write_str("<catalogue>"),
            Name::Schema(n) => write!(f, "{}", n),
            Name::Entity(n) => write!(f, "{}", n),
            Name::Column(n) => write!(f, "{}", n),
            Name::Index(n) => write!(f, "{}", n),
        }
    }
}

impl From<SchemaName> for Name {
    fn from(n: SchemaName) -> Self {
        Name::Schema(n)
    }
}

impl From<EntityName> for Name {
    fn from(n: EntityName) -> Self {
        Name::Entity(n)
    }
}

impl From<ColumnName> for Name {
    fn from(n: ColumnName) -> Self {
        Name::Column(n)
    }
}

impl From<IndexName> for Name {
    fn from(n: IndexName) -> Self {
        Name::Index(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_display() {
        let entity = EntityName::new("Warren", "Books");
        assert_eq!(entity.to_string(), "warren.books");
        assert_eq!(entity.column("Title").to_string(), "warren.books.title");
        assert_eq!(entity.index("title_idx").entity(), entity);
    }

    #[test]
    fn test_index_and_column_names_are_distinct_identities() {
        let entity = EntityName::new("s", "e");
        let column: Name = entity.column("x").into();
        let index: Name = entity.index("x").into();
        assert_ne!(column, index);
    }
}
