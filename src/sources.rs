//! Static source registry.
//!
//! Sources are read once at startup from a JSON array:
//!
//! ```json
//! [
//!   {
//!     "url": "/channel1",
//!     "source": "rtsp://10.0.0.5/stream",
//!     "provider": "Acme",
//!     "name": "Channel 1"
//!   }
//! ]
//! ```
//!
//! The registry is immutable afterwards and is shared by reference with the
//! router; nothing else reads it.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{GatewayError, Result};

/// A single upstream feed exposed under a route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceDescriptor {
    #[serde(rename = "url")]
    pub route: String,      // Request target clients ask for, e.g. "/channel1"
    #[serde(rename = "source")]
    pub upstream: String,   // Input handed to the transcoder
    pub provider: String,   // Written to the service_provider metadata field
    pub name: String,       // Written to the service_name metadata field
}

/// Route key -> source lookup table.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<SourceDescriptor>>,
}

impl SourceRegistry {
    /// Build a registry, rejecting duplicate route keys.
    pub fn from_descriptors(descriptors: Vec<SourceDescriptor>) -> Result<Self> {
        let mut sources = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let route = descriptor.route.clone();
            if sources.insert(route.clone(), Arc::new(descriptor)).is_some() {
                return Err(GatewayError::Config(format!(
                    "duplicate source url \"{}\"",
                    route
                )));
            }
        }

        Ok(Self { sources })
    }

    /// Load the registry from a JSON file. Any failure is fatal for startup.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let descriptors: Vec<SourceDescriptor> = serde_json::from_str(&content)?;
        let registry = Self::from_descriptors(descriptors)?;

        debug!(path = %path.display(), "Loaded {} sources", registry.len());
        Ok(registry)
    }

    /// Find the source registered under exactly this request target.
    pub fn resolve(&self, route: &str) -> Result<Arc<SourceDescriptor>> {
        self.sources
            .get(route)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(route.to_string()))
    }

    pub(crate) fn len(&self) -> usize {
        self.sources.len()
    }

    /// Registered route keys, sorted for stable output.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        routes.sort_unstable();
        routes
    }
}
