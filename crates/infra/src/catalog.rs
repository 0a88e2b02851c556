//! Course catalog port.
//!
//! Orders snapshot catalog entries at creation time; the catalog itself is
//! owned by another service.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use orderflow_core::{Classified, CourseId, ErrorClass};
use orderflow_orders::ItemType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: CourseId,
    pub item_type: ItemType,
    pub title: String,
    pub description: Option<String>,
    pub price: i64,
    pub original_price: i64,
    pub is_active: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl Classified for CatalogError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Dependency
    }

    fn code(&self) -> &'static str {
        "catalog_unavailable"
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// `None` when the course does not exist.
    async fn get_item(&self, id: CourseId) -> Result<Option<CatalogItem>, CatalogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: RwLock<HashMap<CourseId, CatalogItem>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: CatalogItem) {
        self.items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(item.id, item);
    }

    /// Add an active course priced at `price` and return its id.
    pub fn add_course(&self, title: &str, price: i64) -> CourseId {
        let id = CourseId::new();
        self.insert(CatalogItem {
            id,
            item_type: ItemType::Course,
            title: title.to_string(),
            description: None,
            price,
            original_price: price,
            is_active: true,
        });
        id
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_item(&self, id: CourseId) -> Result<Option<CatalogItem>, CatalogError> {
        Ok(self
            .items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned())
    }
}
