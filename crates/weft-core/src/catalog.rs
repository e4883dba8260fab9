use std::collections::BTreeMap;
use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, WeftError};
use crate::schema::SchemaDescriptor;
use crate::traits::CatalogSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    #[default]
    Unverified,
    Verified,
    Certified,
}

/// A remote agent as published by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input_schema: SchemaDescriptor,
    #[serde(default)]
    pub output_schema: SchemaDescriptor,
    pub endpoint: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub trust: TrustTier,
    /// HMAC key for request signing. Never serialized back out.
    #[serde(default, skip_serializing)]
    pub signing_secret: Option<String>,
}

/// A versioned, immutable view of the catalog taken once per submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub version: String,
    pub agents: BTreeMap<String, AgentDescriptor>,
}

impl CatalogSnapshot {
    /// Build a snapshot; the version is a digest of the agent list.
    pub fn new(agents: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        let agents: BTreeMap<String, AgentDescriptor> =
            agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        let mut hasher = Sha256::new();
        for agent in agents.values() {
            hasher.update(agent.id.as_bytes());
            hasher.update(agent.endpoint.as_bytes());
            hasher.update(agent.price.to_bits().to_le_bytes());
            hasher.update(agent.input_schema.hash().0.as_bytes());
            hasher.update(agent.output_schema.hash().0.as_bytes());
        }
        Self {
            version: hex::encode(hasher.finalize()),
            agents,
        }
    }

    /// Parse a JSON catalog: either `[agent, ...]` or `{"agents": [agent, ...]}`.
    /// The version is the digest of the raw content.
    pub fn from_json_str(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum CatalogFile {
            List(Vec<AgentDescriptor>),
            Wrapped { agents: Vec<AgentDescriptor> },
        }

        let parsed: CatalogFile =
            serde_json::from_str(content).map_err(|e| WeftError::Catalog(e.to_string()))?;
        let agents = match parsed {
            CatalogFile::List(agents) | CatalogFile::Wrapped { agents } => agents,
        };
        let mut snapshot = Self::new(agents);
        snapshot.version = hex::encode(Sha256::digest(content.as_bytes()));
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&AgentDescriptor> {
        self.get(id)
            .ok_or_else(|| WeftError::UnknownAgent(id.to_string()))
    }
}

/// Catalog fixed at construction time.
pub struct StaticCatalog {
    snapshot: CatalogSnapshot,
}

impl StaticCatalog {
    pub fn new(agents: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        Self {
            snapshot: CatalogSnapshot::new(agents),
        }
    }
}

impl CatalogSource for StaticCatalog {
    fn snapshot(&self) -> BoxFuture<'_, Result<CatalogSnapshot>> {
        Box::pin(async move { Ok(self.snapshot.clone()) })
    }
}

/// Catalog backed by a JSON file, re-read on every snapshot.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for FileCatalog {
    fn snapshot(&self) -> BoxFuture<'_, Result<CatalogSnapshot>> {
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                WeftError::Catalog(format!("{}: {}", self.path.display(), e))
            })?;
            let snapshot = CatalogSnapshot::from_json_str(&content)?;
            tracing::debug!(
                path = %self.path.display(),
                version = %snapshot.version,
                agents = snapshot.agents.len(),
                "Loaded catalog snapshot"
            );
            Ok(snapshot)
        })
    }
}
