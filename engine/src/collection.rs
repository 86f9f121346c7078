//! A named set of documents with its indexes.

use crate::document::ID_FIELD;
use crate::index::FieldIndex;
use crate::query::{page_window, Filter, FindOptions, Page, Sort};
use crate::{error::Result, CollectionSchema, Document, DocumentId, Error};
use serde_json::Value;
use std::collections::HashMap;

/// Documents of one collection plus the indexes declared by its schema.
///
/// Every mutating method either applies completely or leaves the collection
/// untouched.
#[derive(Debug, Clone)]
pub struct Collection {
    schema: CollectionSchema,
    documents: HashMap<DocumentId, Document>,
    indexes: Vec<FieldIndex>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(schema: CollectionSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|def| FieldIndex::new(def.field.clone(), def.unique))
            .collect();
        Self {
            schema,
            documents: HashMap::new(),
            indexes,
        }
    }

    /// Build a collection from stored documents, rebuilding every index.
    ///
    /// Documents are not re-validated against the field schema (they were
    /// valid when written), but unique constraints are enforced.
    pub fn from_documents(
        schema: CollectionSchema,
        documents: impl IntoIterator<Item = Document>,
    ) -> Result<Self> {
        let mut collection = Self::new(schema);
        for doc in documents {
            collection.check_unique(&doc)?;
            if collection.documents.contains_key(&doc.id) {
                return Err(collection.violation(ID_FIELD, format!("\"{}\"", doc.id)));
            }
            collection.index(&doc);
            collection.documents.insert(doc.id.clone(), doc);
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// All documents, in no particular order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Insert a new document.
    pub fn insert(&mut self, doc: Document) -> Result<()> {
        self.schema.validate_fields(&doc.fields)?;
        if self.documents.contains_key(&doc.id) {
            return Err(self.violation(ID_FIELD, format!("\"{}\"", doc.id)));
        }
        self.check_unique(&doc)?;

        self.index(&doc);
        self.documents.insert(doc.id.clone(), doc);
        Ok(())
    }

    /// Replace an existing document with a new image. Returns the old image.
    pub fn replace(&mut self, doc: Document) -> Result<Document> {
        let not_found = Error::DocumentNotFound {
            collection: self.schema.name.clone(),
            id: doc.id.clone(),
        };
        if !self.documents.contains_key(&doc.id) {
            return Err(not_found);
        }
        self.schema.validate_fields(&doc.fields)?;
        self.check_unique(&doc)?;

        self.swap_in(doc).ok_or(not_found)
    }

    /// Insert or overwrite a document, enforcing unique constraints only.
    ///
    /// Used for documents that were validated elsewhere: remote changes and
    /// archive contents.
    pub fn put(&mut self, doc: Document) -> Result<Option<Document>> {
        self.check_unique(&doc)?;
        Ok(self.swap_in(doc))
    }

    /// Put a document back without any checks. Only for undoing a mutation
    /// that was applied to this collection.
    pub fn restore(&mut self, doc: Document) {
        self.swap_in(doc);
    }

    pub fn remove(&mut self, id: &str) -> Option<Document> {
        let doc = self.documents.remove(id)?;
        for index in &mut self.indexes {
            index.remove(&doc);
        }
        Some(doc)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        for index in &mut self.indexes {
            index.clear();
        }
    }

    /// Matching documents, sorted, skipped and limited per `options`.
    pub fn find(&self, filter: &Filter, options: &FindOptions) -> Vec<Document> {
        let mut matches = self.matching(filter);
        matches.sort_by(|a, b| options.sort.compare(a, b));
        let limit = options.limit.unwrap_or(usize::MAX);
        matches
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn find_one(&self, filter: &Filter, sort: &Sort) -> Option<Document> {
        self.matching(filter)
            .into_iter()
            .min_by(|a, b| sort.compare(a, b))
            .cloned()
    }

    pub fn count(&self, filter: &Filter) -> usize {
        self.matching(filter).len()
    }

    /// One 1-based page of matching documents.
    pub fn find_page(
        &self,
        filter: &Filter,
        page: usize,
        per_page: usize,
        sort: Sort,
    ) -> Result<Page> {
        let total = self.count(filter);
        let (skip, page_count) = page_window(total, page, per_page)?;
        let options = FindOptions::default()
            .sorted_by(sort)
            .skip(skip)
            .limit(per_page);
        Ok(Page {
            documents: self.find(filter, &options),
            total,
            page,
            page_count,
        })
    }

    /// Candidate documents for a filter, narrowed through an index when the
    /// filter has an equality condition on `_id` or an indexed field.
    fn matching(&self, filter: &Filter) -> Vec<&Document> {
        let candidates: Vec<&Document> = if let Some(id) = filter.equality_on(ID_FIELD) {
            match id {
                Value::String(id) => self.documents.get(id).into_iter().collect(),
                _ => Vec::new(),
            }
        } else if let Some((index, value)) = self.indexes.iter().find_map(|index| {
            // sparse indexes hold no nulls; a scan treats missing as null
            filter
                .equality_on(index.field())
                .filter(|v| !v.is_null())
                .map(|v| (index, v))
        }) {
            index
                .lookup(value)
                .iter()
                .filter_map(|id| self.documents.get(id))
                .collect()
        } else {
            self.documents.values().collect()
        };

        candidates
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect()
    }

    fn check_unique(&self, doc: &Document) -> Result<()> {
        for index in &self.indexes {
            if let Some((_, key)) = index.conflict(doc) {
                return Err(self.violation(index.field(), key));
            }
        }
        Ok(())
    }

    fn violation(&self, field: &str, value: String) -> Error {
        Error::UniqueConstraintViolation {
            collection: self.schema.name.clone(),
            field: field.to_string(),
            value,
        }
    }

    fn index(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            index.insert(doc);
        }
    }

    fn swap_in(&mut self, doc: Document) -> Option<Document> {
        let previous = self.remove(&doc.id);
        self.index(&doc);
        self.documents.insert(doc.id.clone(), doc);
        previous
    }
}
