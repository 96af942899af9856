//! Full-text search over the `indexed` attributes of an entity.
//!
//! Query text is parsed with the grammar in `search.pest`: bare terms,
//! `"quoted phrases"`, and either of them restricted to one field with
//! `field:`. Every clause must match for a document to be returned.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Mutex;

// used to keep the one-to-one mapping between ids and document numbers
use bimap::BiMap;
// posting lists
use roaring::RoaringTreemap;

use pest::Parser;
use pest_derive::Parser;

use crate::entity::NameHasher;
use crate::error::{NodecladError, Result};

#[derive(Parser)]
#[grammar = "search.pest"]
struct QueryParser;

/// Lowercased alphanumeric runs of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub field: Option<String>,
    pub terms: Vec<String>,
    /// The terms must appear next to each other, in order.
    pub phrase: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    clauses: Vec<Clause>,
}

impl SearchQuery {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parsed = QueryParser::parse(Rule::query, text)
            .map_err(|e| NodecladError::Search(format!("cannot parse '{text}': {e}")))?;
        let mut clauses = Vec::new();
        let Some(query) = parsed.next() else {
            return Ok(Self::default());
        };
        for clause in query.into_inner().filter(|p| p.as_rule() == Rule::clause) {
            let mut field = None;
            for part in clause.into_inner() {
                match part.as_rule() {
                    Rule::field => field = Some(part.as_str().to_string()),
                    Rule::phrase => {
                        let terms = tokenize(part.as_str());
                        if !terms.is_empty() {
                            clauses.push(Clause { field: field.take(), terms, phrase: true });
                        }
                    }
                    Rule::word => {
                        let terms = tokenize(part.as_str());
                        if !terms.is_empty() {
                            clauses.push(Clause { field: field.take(), terms, phrase: false });
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(Self { clauses })
    }

    /// Every term of each field value must match within that field.
    pub fn fields(fields: &BTreeMap<String, String>) -> Self {
        let clauses = fields
            .iter()
            .map(|(field, text)| Clause { field: Some(field.clone()), terms: tokenize(text), phrase: false })
            .filter(|c| !c.terms.is_empty())
            .collect();
        Self { clauses }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl FromStr for SearchQuery {
    type Err = NodecladError;
    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

/// A full-text collection per entity.
pub trait SearchIndex: Send + Sync {
    fn provision(&self, collection: &str, fields: &[&str]) -> Result<()>;
    /// Adds or replaces the document of `id`.
    fn add(&self, collection: &str, id: &str, fields: &BTreeMap<String, String>) -> Result<()>;
    fn remove(&self, collection: &str, id: &str) -> Result<()>;
    /// Ids of matching documents, in the order they were first added.
    fn search(&self, collection: &str, query: &SearchQuery) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct Collection {
    fields: Vec<String>,
    documents: BiMap<String, u64>,
    next_document: u64,
    postings: HashMap<(String, String), RoaringTreemap, NameHasher>,
    tokens: HashMap<u64, BTreeMap<String, Vec<String>>, NameHasher>,
}

impl Collection {
    fn unindex(&mut self, document: u64) {
        if let Some(fields) = self.tokens.remove(&document) {
            for (field, terms) in fields {
                for term in terms {
                    if let Some(posting) = self.postings.get_mut(&(field.clone(), term)) {
                        posting.remove(document);
                    }
                }
            }
        }
    }

    fn matching(&self, field: &str, term: &str) -> RoaringTreemap {
        self.postings.get(&(field.to_string(), term.to_string())).cloned().unwrap_or_default()
    }

    fn clause_matches(&self, clause: &Clause) -> RoaringTreemap {
        let fields: Vec<&str> = match &clause.field {
            Some(field) => vec![field.as_str()],
            None => self.fields.iter().map(String::as_str).collect(),
        };
        let mut result = RoaringTreemap::new();
        for field in fields {
            let mut in_field: Option<RoaringTreemap> = None;
            for term in &clause.terms {
                let hits = self.matching(field, term);
                in_field = Some(match in_field {
                    Some(acc) => acc & hits,
                    None => hits,
                });
            }
            let mut in_field = in_field.unwrap_or_default();
            if clause.phrase && clause.terms.len() > 1 {
                let candidates: Vec<u64> = in_field.iter().collect();
                for document in candidates {
                    if !self.has_phrase(document, field, &clause.terms) {
                        in_field.remove(document);
                    }
                }
            }
            result |= in_field;
        }
        result
    }

    fn has_phrase(&self, document: u64, field: &str, phrase: &[String]) -> bool {
        self.tokens
            .get(&document)
            .and_then(|fields| fields.get(field))
            .is_some_and(|terms| terms.windows(phrase.len()).any(|window| window == phrase))
    }
}

/// In-process inverted index of roaring bitmaps.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    collections: Mutex<HashMap<String, Collection, NameHasher>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchIndex for MemoryIndex {
    fn provision(&self, collection: &str, fields: &[&str]) -> Result<()> {
        let mut collections = self.collections.lock()?;
        let entry = collections.entry(collection.to_string()).or_default();
        entry.fields = fields.iter().map(|f| f.to_string()).collect();
        Ok(())
    }

    fn add(&self, collection: &str, id: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        let mut collections = self.collections.lock()?;
        let collection = collections
            .get_mut(collection)
            .ok_or_else(|| NodecladError::Search(format!("collection {collection} is not provisioned")))?;
        let document = match collection.documents.get_by_left(id) {
            Some(document) => {
                let document = *document;
                collection.unindex(document);
                document
            }
            None => {
                let document = collection.next_document;
                collection.next_document += 1;
                collection.documents.insert(id.to_string(), document);
                document
            }
        };
        let mut indexed = BTreeMap::new();
        for (field, text) in fields {
            let terms = tokenize(text);
            for term in &terms {
                collection.postings.entry((field.clone(), term.clone())).or_default().insert(document);
            }
            indexed.insert(field.clone(), terms);
        }
        collection.tokens.insert(document, indexed);
        Ok(())
    }

    fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.lock()?;
        if let Some(collection) = collections.get_mut(collection) {
            if let Some((_, document)) = collection.documents.remove_by_left(id) {
                collection.unindex(document);
            }
        }
        Ok(())
    }

    fn search(&self, collection: &str, query: &SearchQuery) -> Result<Vec<String>> {
        let collections = self.collections.lock()?;
        let collection = collections
            .get(collection)
            .ok_or_else(|| NodecladError::Search(format!("collection {collection} is not provisioned")))?;
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Option<RoaringTreemap> = None;
        for clause in query.clauses() {
            let matches = collection.clause_matches(clause);
            hits = Some(match hits {
                Some(acc) => acc & matches,
                None => matches,
            });
        }
        Ok(hits
            .unwrap_or_default()
            .iter()
            .filter_map(|document| collection.documents.get_by_right(&document).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn tokenizing_lowercases_and_splits() {
        assert_eq!(tokenize("Hello, World! 42x"), vec!["hello", "world", "42x"]);
    }

    #[test]
    fn query_text_parses_fields_and_phrases() {
        let query = SearchQuery::parse(r#"bio:"red fox" lazy"#).unwrap();
        assert_eq!(
            query.clauses(),
            &[
                Clause { field: Some("bio".into()), terms: vec!["red".into(), "fox".into()], phrase: true },
                Clause { field: None, terms: vec!["lazy".into()], phrase: false },
            ]
        );
        assert!(SearchQuery::parse(r#""unterminated"#).is_err());
    }

    #[test]
    fn all_clauses_must_match() {
        let index = MemoryIndex::new();
        index.provision("Person", &["bio", "title"]).unwrap();
        index.add("Person", "a", &doc(&[("bio", "the quick red fox"), ("title", "Dr")])).unwrap();
        index.add("Person", "b", &doc(&[("bio", "a fox that is red"), ("title", "Mr")])).unwrap();

        let ids = |text: &str| index.search("Person", &SearchQuery::parse(text).unwrap()).unwrap();
        assert_eq!(ids("fox"), vec!["a", "b"]);
        assert_eq!(ids(r#""red fox""#), vec!["a"]);
        assert_eq!(ids("fox title:mr"), vec!["b"]);
        assert!(ids("bio:dr").is_empty());

        index.add("Person", "a", &doc(&[("bio", "retired")])).unwrap();
        assert_eq!(ids("fox"), vec!["b"]);
        index.remove("Person", "b").unwrap();
        assert!(ids("fox").is_empty());
    }

    #[test]
    fn unprovisioned_collections_are_an_error() {
        let index = MemoryIndex::new();
        assert!(index.search("Nope", &SearchQuery::default()).is_err());
    }
}
