use std::sync::RwLock;

use futures::future::BoxFuture;

use weft_core::{Recipe, RecipeStore, Result};

/// In-process recipe collection, for tests and catalog-less setups.
#[derive(Default)]
pub struct MemoryRecipeStore {
    recipes: RwLock<Vec<Recipe>>,
}

impl MemoryRecipeStore {
    pub fn new(recipes: Vec<Recipe>) -> Self {
        Self {
            recipes: RwLock::new(recipes),
        }
    }

    pub fn accept(&self, recipe: Recipe) {
        if let Ok(mut recipes) = self.recipes.write() {
            recipes.push(recipe);
        }
    }
}

impl RecipeStore for MemoryRecipeStore {
    fn lookup(
        &self,
        source_agent_id: String,
        target_agent_id: String,
    ) -> BoxFuture<'_, Result<Vec<Recipe>>> {
        Box::pin(async move {
            let recipes = self
                .recipes
                .read()
                .map(|r| {
                    r.iter()
                        .filter(|r| {
                            r.source_agent_id == source_agent_id
                                && r.target_agent_id == target_agent_id
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(recipes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weft_core::FieldMapping;

    #[tokio::test]
    async fn lookup_filters_by_pair() {
        let store = MemoryRecipeStore::default();
        store.accept(Recipe {
            source_agent_id: "a".into(),
            target_agent_id: "b".into(),
            mapping: FieldMapping::new(),
            confidence: 0.9,
            accepted_at: Utc::now(),
        });
        assert_eq!(store.lookup("a".into(), "b".into()).await.unwrap().len(), 1);
        assert!(store.lookup("b".into(), "a".into()).await.unwrap().is_empty());
    }
}
