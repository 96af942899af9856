//! Nodeclad – typed, validated objects persisted to SQL databases and flat files.
//!
//! Nodeclad centers on the *entity* concept: a declared class of persistent
//! objects, given as an ordered set of named assertions. In short:
//! * An [`assertion::Assertion`] is a base kind (`Str`, `Int`, `Array`, `ExtID`, ...)
//!   refined by subtype rules (`min`, `max`, `size`, `regex`, `unique`, ...).
//! * An [`entity::Entity`] collects assertions under a namespaced name such as
//!   `Shop::Person`, which also decides the database (`shop`) and table (`person`).
//! * A [`node::Node`] is one object of an entity: attribute names mapped to
//!   typed [`value::Value`]s.
//!
//! Every entity carries `id`, `name`, `ctime` and `mtime`. Arrays and hashes
//! are stored as rows of synthesized element entities, one table per
//! collection attribute.
//!
//! ## Modules
//! * [`assertion`], [`subtype`], [`datatype`] – The validation engine.
//! * [`entity`] – Declarations and the write-once [`entity::Registry`].
//! * [`persist`] – The [`persist::Persistor`] and per-entity [`persist::Handle`]s
//!   that load, save and remove nodes.
//! * [`driver`] – SQL dialects (MySQL, PostgreSQL, SQLite) and flatfile documents.
//! * [`pool`] – One lazily opened connection per database, with nested transactions.
//! * [`stream`] – `LIMIT`/`OFFSET` windows over large result sets.
//! * [`cache`], [`search`], [`archive`] – Object cache, full-text index and
//!   revision history collaborators, each with an in-process implementation.
//! * [`config`] – Settings from a file overlaid by `NODECLAD__*` environment variables.
//!
//! ## Persistence
//! A save validates the node before anything is written, checks unique
//! columns, then writes the row and its collection rows in one transaction.
//! Entities configured for flatfiles are written as YAML or JSON documents,
//! optionally checked in to a revision archive. Loads go through the object
//! cache when the entity has a cache TTL.
//!
//! ## Quick Start
//! ```
//! use nodeclad::assertion::Assertion;
//! use nodeclad::config::Settings;
//! use nodeclad::entity::Entity;
//! use nodeclad::persist::Persistor;
//!
//! let scratch = tempfile::tempdir().unwrap();
//! let persistor = Persistor::in_memory(Settings::for_test(scratch.path()));
//! let people = persistor
//!     .declare(Entity::builder("Shop::Person").attribute("age", Assertion::int().min(0).max(150)))
//!     .unwrap();
//!
//! let mut alice = people.create().with("name", "Alice").unwrap().with("age", 34).unwrap();
//! people.save(&mut alice, None).unwrap();
//! let loaded = people.load_by_name("Alice").unwrap();
//! assert_eq!(loaded.get("age").as_i64(), Some(34));
//! ```
//!
//! ## Logging
//! All logging goes through `tracing`. Install any subscriber to see it;
//! statements are logged at `debug`, provisioning at `info`, rollbacks and
//! cache failures at `warn`.

pub mod archive;
pub mod assertion;
pub mod cache;
pub mod config;
pub mod datatype;
pub mod driver;
pub mod entity;
pub mod error;
pub mod node;
pub mod persist;
pub mod pool;
pub mod search;
pub mod stream;
pub mod subtype;
pub mod value;

pub use error::{NodecladError, Result};
