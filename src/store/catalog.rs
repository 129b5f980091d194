// src/store/catalog.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use super::CategoryCatalog;
use crate::model::Category;

/// Catalog served from memory. Loaded from a JSON array of categories or built in code.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    categories: RwLock<Vec<Category>>,
}

impl StaticCatalog {
    pub fn new(categories: Vec<Category>) -> Self {
        Self {
            categories: RwLock::new(categories),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading categories from {}", path.display()))?;
        let categories: Vec<Category> = serde_json::from_str(&s)
            .with_context(|| format!("parsing categories from {}", path.display()))?;
        Ok(Self::new(categories))
    }

    /// Replace the catalog (admin reload).
    pub fn replace(&self, categories: Vec<Category>) {
        let mut g = match self.categories.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        *g = categories;
    }
}

#[async_trait::async_trait]
impl CategoryCatalog for StaticCatalog {
    async fn categories(&self) -> Result<Vec<Category>> {
        let g = match self.categories.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        Ok(g.clone())
    }
}
