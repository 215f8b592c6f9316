//! Where recipes are looked up by id.

use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use factory_core::Recipe;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Source of recipes.
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Load a recipe. `None` if there is no recipe with that id.
    async fn get(&self, id: &str) -> Result<Option<Recipe>>;
}

/// Recipes stored as `<dir>/<id>.json`.
pub struct DirRecipeStore {
    dir: PathBuf,
}

impl DirRecipeStore {
    /// Serve recipes from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecipeStore for DirRecipeStore {
    async fn get(&self, id: &str) -> Result<Option<Recipe>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(SchedulerError::InvalidRecipeId(id.to_string()));
        }
        let path = self.dir.join(format!("{}.json", id));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(recipe = id, path = %path.display(), "Recipe file not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut recipe: Recipe = serde_json::from_str(&content)?;
        if recipe.id.is_empty() {
            recipe.id = id.to_string();
        }
        Ok(Some(recipe))
    }
}

/// Recipes held in memory.
#[derive(Default)]
pub struct MemoryRecipeStore {
    recipes: RwLock<HashMap<String, Recipe>>,
}

impl MemoryRecipeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a recipe.
    pub fn insert(&self, recipe: Recipe) {
        let mut recipes = self.recipes.write().unwrap_or_else(|e| e.into_inner());
        recipes.insert(recipe.id.clone(), recipe);
    }
}

#[async_trait]
impl RecipeStore for MemoryRecipeStore {
    async fn get(&self, id: &str) -> Result<Option<Recipe>> {
        let recipes = self.recipes.read().unwrap_or_else(|e| e.into_inner());
        Ok(recipes.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_store_reads_recipe_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("render.json"),
            r#"{ "title": "Render", "steps": [{ "id": "r", "image": "renderer" }] }"#,
        )
        .await
        .unwrap();

        let store = DirRecipeStore::new(dir.path());
        let recipe = store.get("render").await.unwrap().unwrap();
        assert_eq!(recipe.id, "render");
        assert_eq!(recipe.title, "Render");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dir_store_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirRecipeStore::new(dir.path());
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(SchedulerError::InvalidRecipeId(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRecipeStore::new();
        store.insert(Recipe {
            id: "a".into(),
            kind: None,
            title: "A".into(),
            params: vec![],
            steps: vec![],
        });
        assert_eq!(store.get("a").await.unwrap().unwrap().title, "A");
        assert!(store.get("b").await.unwrap().is_none());
    }
}
