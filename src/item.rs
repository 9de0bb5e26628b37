//! Fixed-key items.
//!
//! A [`Schema`] declares the legal keys of an item type once: an ordered list
//! of [`Field`]s, each with an optional default value and free-form metadata.
//! An [`Item`] is an insertion-ordered mapping restricted to those keys.
//! Defaults are materialized when the item is created; any read or write of
//! an undeclared key fails with [`SpiderError::UnknownField`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let article = Schema::builder("Article")
//!     .field(Field::new("title"))
//!     .field(Field::new("tags").with_default(json!([])))
//!     .build()?;
//!
//! let mut item = article.item();
//! item.set("title", "Hello")?;
//! assert!(item.set("author", "me").is_err());
//! ```

use crate::error::{Result, SpiderError};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// One declared key of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    default: Option<Value>,
    metadata: Map<String, Value>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            metadata: Map::new(),
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// The declared shape of an item type.
#[derive(Debug, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
}

pub struct SchemaBuilder {
    name: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    /// Declares a field. Redeclaring a field replaces the earlier declaration
    /// in place, so a derived schema can override inherited defaults.
    pub fn field(mut self, field: Field) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    pub fn build(self) -> Result<Arc<Schema>> {
        if self.name.is_empty() {
            return Err(SpiderError::GeneralError("item schema needs a name".into()));
        }
        Ok(Arc::new(Schema {
            name: self.name,
            fields: self.fields,
        }))
    }
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Starts a schema that inherits every field of `self`.
    pub fn extend(&self, name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: self.fields.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn index_of(&self, key: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == key)
            .ok_or_else(|| SpiderError::UnknownField {
                item: self.name.clone(),
                field: key.to_string(),
            })
    }

    /// Creates an item with every declared default filled in.
    pub fn item(self: &Arc<Self>) -> Item {
        Item::new(self)
    }
}

/// A value conforming to a [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    schema: Arc<Schema>,
    // (field index, value) in insertion order.
    entries: Vec<(usize, Value)>,
}

impl Item {
    pub fn new(schema: &Arc<Schema>) -> Self {
        let entries = schema
            .fields
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| f.default.clone().map(|v| (idx, v)))
            .collect();
        Self {
            schema: Arc::clone(schema),
            entries,
        }
    }

    /// Creates an item from key/value pairs; defaults fill the remaining keys.
    pub fn from_pairs<K, V, I>(schema: &Arc<Schema>, pairs: I) -> Result<Self>
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut item = Self::new(schema);
        item.update(pairs)?;
        Ok(item)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.entries.iter().position(|(idx, _)| *idx == index)
    }

    fn missing(&self, key: &str) -> SpiderError {
        SpiderError::MissingField {
            item: self.schema.name.clone(),
            field: key.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Result<&Value> {
        self.get_opt(key)?.ok_or_else(|| self.missing(key))
    }

    /// Like [`get`](Self::get), but an unset declared key yields `None`.
    pub fn get_opt(&self, key: &str) -> Result<Option<&Value>> {
        let index = self.schema.index_of(key)?;
        Ok(self.position(index).map(|pos| &self.entries[pos].1))
    }

    /// Writes `value` under `key`, returning the previous value.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        let index = self.schema.index_of(key)?;
        let value = value.into();
        match self.position(index) {
            Some(pos) => Ok(Some(std::mem::replace(&mut self.entries[pos].1, value))),
            None => {
                self.entries.push((index, value));
                Ok(None)
            }
        }
    }

    /// Writes every pair. Fails without writing anything if any key is undeclared.
    pub fn update<K, V, I>(&mut self, pairs: I) -> Result<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut resolved = Vec::new();
        for (key, value) in pairs {
            resolved.push((self.schema.index_of(key.as_ref())?, value.into()));
        }
        for (index, value) in resolved {
            match self.position(index) {
                Some(pos) => self.entries[pos].1 = value,
                None => self.entries.push((index, value)),
            }
        }
        Ok(())
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&mut self, key: &str) -> Result<Value> {
        let index = self.schema.index_of(key)?;
        match self.position(index) {
            Some(pos) => Ok(self.entries.remove(pos).1),
            None => Err(self.missing(key)),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether `key` is declared and currently set.
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.get_opt(key), Ok(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(idx, value)| (self.schema.fields[*idx].name.as_str(), value))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

impl Serialize for Item {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {{", self.schema.name)?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {}", key, value)?;
        }
        f.write_str("}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article() -> Arc<Schema> {
        Schema::builder("Article")
            .field(Field::new("title").with_metadata("selector", "h1"))
            .field(Field::new("tags").with_default(json!([])))
            .field(Field::new("published").with_default(false))
            .build()
            .unwrap()
    }

    #[test]
    fn defaults_are_materialized() {
        let item = article().item();
        assert_eq!(item.get("tags").unwrap(), &json!([]));
        assert_eq!(item.get("published").unwrap(), &json!(false));
        assert!(!item.contains("title"));
        assert_eq!(item.len(), 2);
    }

    #[test]
    fn undeclared_keys_are_rejected() {
        let mut item = article().item();
        assert!(matches!(
            item.set("author", "me"),
            Err(SpiderError::UnknownField { ref field, .. }) if field == "author"
        ));
        assert!(matches!(item.get("author"), Err(SpiderError::UnknownField { .. })));
        assert!(matches!(item.get("title"), Err(SpiderError::MissingField { .. })));
        assert!(!item.contains("author"));
    }

    #[test]
    fn update_is_all_or_nothing_and_reads_see_the_latest_write() {
        let mut item = article().item();
        item.set("title", "first").unwrap();
        assert!(item
            .update([("title", json!("second")), ("nope", json!(1))])
            .is_err());
        assert_eq!(item.get("title").unwrap(), "first");

        item.update([("title", "third")]).unwrap();
        assert_eq!(item.get("title").unwrap(), "third");
        assert_eq!(item.set("title", "fourth").unwrap(), Some(json!("third")));
    }

    #[test]
    fn remove_and_clear() {
        let mut item = article().item();
        assert_eq!(item.remove("published").unwrap(), json!(false));
        assert!(matches!(item.remove("published"), Err(SpiderError::MissingField { .. })));
        item.clear();
        assert!(item.is_empty());
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut item = article().item();
        item.set("title", "t").unwrap();
        item.set("tags", json!(["a"])).unwrap();
        let keys: Vec<_> = item.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["tags", "published", "title"]);
        assert_eq!(
            item.to_string(),
            r#"<Article {"tags": ["a"], "published": false, "title": "t"}>"#
        );
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"tags": ["a"], "published": false, "title": "t"})
        );
    }

    #[test]
    fn derived_schemas_inherit_and_override() {
        let base = article();
        let news = base
            .extend("News")
            .field(Field::new("published").with_default(true))
            .field(Field::new("source"))
            .build()
            .unwrap();
        let names: Vec<_> = news.fields().iter().map(Field::name).collect();
        assert_eq!(names, vec!["title", "tags", "published", "source"]);
        assert_eq!(news.item().get("published").unwrap(), &json!(true));
        assert_eq!(base.field("title").unwrap().metadata()["selector"], "h1");
    }

    #[test]
    fn from_pairs_combines_defaults_and_values() {
        let item = Item::from_pairs(&article(), [("title", "x")]).unwrap();
        assert_eq!(item.get("title").unwrap(), "x");
        assert_eq!(item.len(), 3);
        assert_eq!(item.clone(), item);
    }
}
