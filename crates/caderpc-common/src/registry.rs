//! Service discovery
//!
//! Providers [`register`](ServiceRegistry::register) their endpoints and
//! consumers [`fetch_service_list`](ServiceRegistry::fetch_service_list) by
//! service name. Real deployments back this with an external store; this
//! module provides the contract, an in-process [`MemoryRegistry`] and a
//! [`CachingRegistry`] that keeps serving the last good answer while the
//! backing store is unreachable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::protocol::error::Result;
use crate::protocol::Endpoint;

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, endpoint: &Endpoint) -> Result<()>;

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()>;

    /// Current providers of `service_name`. May be empty.
    async fn fetch_service_list(&self, service_name: &str) -> Result<Vec<Endpoint>>;
}

#[async_trait]
impl<R: ServiceRegistry + ?Sized> ServiceRegistry for Arc<R> {
    async fn register(&self, endpoint: &Endpoint) -> Result<()> {
        (**self).register(endpoint).await
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()> {
        (**self).unregister(endpoint).await
    }

    async fn fetch_service_list(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        (**self).fetch_service_list(service_name).await
    }
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, endpoint: &Endpoint) -> Result<()> {
        let mut services = self.services.write();
        let list = services.entry(endpoint.service_name.clone()).or_default();
        if !list.contains(endpoint) {
            list.push(endpoint.clone());
        }
        Ok(())
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()> {
        let mut services = self.services.write();
        if let Some(list) = services.get_mut(&endpoint.service_name) {
            list.retain(|e| e != endpoint);
            if list.is_empty() {
                services.remove(&endpoint.service_name);
            }
        }
        Ok(())
    }

    async fn fetch_service_list(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .services
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Wraps a registry and falls back to the last successful lookup on error.
pub struct CachingRegistry<R> {
    delegate: R,
    cache: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl<R: ServiceRegistry> CachingRegistry<R> {
    pub fn new(delegate: R) -> Self {
        Self {
            delegate,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: ServiceRegistry> ServiceRegistry for CachingRegistry<R> {
    async fn register(&self, endpoint: &Endpoint) -> Result<()> {
        self.delegate.register(endpoint).await
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()> {
        self.delegate.unregister(endpoint).await
    }

    async fn fetch_service_list(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        match self.delegate.fetch_service_list(service_name).await {
            Ok(list) => {
                self.cache.write().insert(service_name.to_string(), list.clone());
                Ok(list)
            }
            Err(e) => {
                let cached = self.cache.read().get(service_name).cloned();
                tracing::warn!(
                    service = service_name,
                    error = %e,
                    cached = cached.as_ref().map(Vec::len).unwrap_or(0),
                    "registry lookup failed, using cached providers"
                );
                Ok(cached.unwrap_or_default())
            }
        }
    }
}
