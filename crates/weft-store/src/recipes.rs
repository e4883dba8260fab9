use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::info;

use weft_core::{FieldMapping, Recipe, RecipeStore, Result, WeftError};

use crate::{db_err, open_connection};

/// Accepted recipes, one per (source agent, target agent) pair.
///
/// The engine only reads; recipes are accepted out of band by an operator.
pub struct SqliteRecipeStore {
    conn: Mutex<Connection>,
}

impl SqliteRecipeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recipes (
                 source_agent_id TEXT NOT NULL,
                 target_agent_id TEXT NOT NULL,
                 mapping_json TEXT NOT NULL,
                 confidence REAL NOT NULL,
                 accepted_at TEXT NOT NULL,
                 PRIMARY KEY (source_agent_id, target_agent_id)
             );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }

    /// Store `recipe`, replacing any earlier recipe for the same agent pair.
    pub fn accept(&self, recipe: &Recipe) -> Result<()> {
        if !(0.0..=1.0).contains(&recipe.confidence) {
            return Err(WeftError::Recipe(format!(
                "confidence {} is outside [0, 1]",
                recipe.confidence
            )));
        }
        if recipe.mapping.is_empty() {
            return Err(WeftError::Recipe("mapping is empty".into()));
        }

        let mapping_json = serde_json::to_string(&recipe.mapping)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recipes (source_agent_id, target_agent_id, mapping_json, confidence, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_agent_id, target_agent_id) DO UPDATE SET
                 mapping_json = excluded.mapping_json,
                 confidence = excluded.confidence,
                 accepted_at = excluded.accepted_at",
            params![
                recipe.source_agent_id,
                recipe.target_agent_id,
                mapping_json,
                recipe.confidence,
                recipe
                    .accepted_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )
        .map_err(db_err)?;
        info!(
            source = %recipe.source_agent_id,
            target = %recipe.target_agent_id,
            confidence = recipe.confidence,
            "Recipe accepted"
        );
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Recipe>> {
        let conn = self.lock()?;
        query(
            &conn,
            "SELECT source_agent_id, target_agent_id, mapping_json, confidence, accepted_at
             FROM recipes ORDER BY source_agent_id, target_agent_id",
            params![],
        )
    }
}

fn query(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Recipe>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(db_err)?;

    let mut recipes = Vec::new();
    for row in rows {
        let (source_agent_id, target_agent_id, mapping_json, confidence, accepted_at) =
            row.map_err(db_err)?;
        let mapping: FieldMapping = serde_json::from_str(&mapping_json)?;
        let accepted_at = DateTime::parse_from_rfc3339(&accepted_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| WeftError::Database(format!("bad timestamp '{}': {}", accepted_at, e)))?;
        recipes.push(Recipe {
            source_agent_id,
            target_agent_id,
            mapping,
            confidence,
            accepted_at,
        });
    }
    Ok(recipes)
}

impl RecipeStore for SqliteRecipeStore {
    fn lookup(
        &self,
        source_agent_id: String,
        target_agent_id: String,
    ) -> BoxFuture<'_, Result<Vec<Recipe>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            query(
                &conn,
                "SELECT source_agent_id, target_agent_id, mapping_json, confidence, accepted_at
                 FROM recipes WHERE source_agent_id = ?1 AND target_agent_id = ?2",
                params![source_agent_id, target_agent_id],
            )
        })
    }
}
