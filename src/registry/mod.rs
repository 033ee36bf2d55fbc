//! Named service construction and caching.
//!
//! A [`ServiceRegistry`] owns every shared dependency of the process: each
//! service is described by a [`ServiceDescriptor`] (a name plus an async
//! factory) and constructed at most once, however many requests race for it.
//! Resolved instances are cached for the life of the registry and handed out
//! as `Arc`s; a failed construction is *not* cached, so a transient
//! dependency outage does not poison the registry for the remainder of the
//! process.
//!
//! There is deliberately no process-global registry. Construct one
//! `ServiceRegistry` at startup with its [`Env`] and pass it by reference;
//! two registries never share caches.

use crate::env::Env;
use anyhow::{Context, anyhow};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::future::Shared;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A type-erased, cached service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type InitFuture = Shared<BoxFuture<'static, Result<ServiceInstance, Arc<anyhow::Error>>>>;

/// Describes one named service: how to build it, and the name it is cached
/// under.
///
/// Two descriptors may share a name only if they are clones of the same
/// descriptor; registering *different* factories under one name is a
/// programming error (the first factory to run wins the cache slot).
pub struct ServiceDescriptor<T: Send + Sync + 'static> {
    name: &'static str,
    factory: Arc<dyn Fn(Env) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>,
}

impl<T: Send + Sync + 'static> Clone for ServiceDescriptor<T> {
    fn clone(&self) -> Self {
        ServiceDescriptor {
            name: self.name,
            factory: self.factory.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ServiceDescriptor<T> {
    /// Creates a descriptor from a name and an async factory.
    ///
    /// The factory receives the registry's [`Env`] and may perform I/O
    /// (opening connections, fetching credentials). It runs at most once
    /// per registry as long as it succeeds.
    pub fn new<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        ServiceDescriptor {
            name,
            factory: Arc::new(move |env| factory(env).boxed()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type-erases this descriptor for the registry's heterogeneous cache.
    pub fn erased(&self) -> ErasedServiceDescriptor {
        let factory = self.factory.clone();
        ErasedServiceDescriptor {
            name: self.name,
            factory: Arc::new(move |env| {
                let fut = factory(env);
                async move { fut.await.map(|value| Arc::new(value) as ServiceInstance) }.boxed()
            }),
        }
    }
}

/// A [`ServiceDescriptor`] with its concrete type erased.
#[derive(Clone)]
pub struct ErasedServiceDescriptor {
    name: &'static str,
    factory: Arc<dyn Fn(Env) -> BoxFuture<'static, anyhow::Result<ServiceInstance>> + Send + Sync>,
}

impl ErasedServiceDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Default)]
struct RegistryState {
    ready: HashMap<&'static str, ServiceInstance>,
    in_flight: HashMap<&'static str, InitFuture>,
}

/// Cache plus deduplicating constructor for named, shareable dependencies.
pub struct ServiceRegistry {
    env: Env,
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    pub fn new(env: Env) -> Self {
        ServiceRegistry {
            env,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The environment handed to every factory this registry runs.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Resolves all given descriptors, constructing what is not yet cached.
    ///
    /// Concurrent calls racing for the same not-yet-cached name all await
    /// the *same* in-flight construction; the factory runs exactly once. If
    /// the factory fails, the failure propagates to every awaiter and the
    /// name stays uncached, so the next resolve retries.
    pub async fn resolve(
        &self,
        descriptors: &[ErasedServiceDescriptor],
    ) -> anyhow::Result<ResolvedServices> {
        let mut instances = HashMap::new();
        for descriptor in descriptors {
            if instances.contains_key(descriptor.name) {
                continue;
            }
            let instance = self.resolve_one(descriptor).await?;
            instances.insert(descriptor.name, instance);
        }

        Ok(ResolvedServices { instances })
    }

    async fn resolve_one(
        &self,
        descriptor: &ErasedServiceDescriptor,
    ) -> anyhow::Result<ServiceInstance> {
        let init = {
            let mut state = self.state.lock().await;

            if let Some(instance) = state.ready.get(descriptor.name) {
                return Ok(instance.clone());
            }

            if let Some(init) = state.in_flight.get(descriptor.name) {
                init.clone()
            } else {
                tracing::debug!("Initializing service '{}'", descriptor.name);
                let fut = (descriptor.factory)(self.env.clone());
                let init: InitFuture = async move { fut.await.map_err(Arc::new) }.boxed().shared();
                state.in_flight.insert(descriptor.name, init.clone());
                init
            }
        };

        // The lock is released while the factory runs; other requests either
        // join this in-flight future or resolve unrelated names.
        let result = init.await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(descriptor.name);

        match result {
            Ok(instance) => {
                let cached = state
                    .ready
                    .entry(descriptor.name)
                    .or_insert_with(|| instance.clone());
                Ok(cached.clone())
            }
            Err(err) => Err(anyhow!("{:#}", err))
                .with_context(|| format!("Failed to initialize service '{}'", descriptor.name)),
        }
    }
}

/// The services one endpoint declared, resolved to shared instances.
#[derive(Clone, Default)]
pub struct ResolvedServices {
    instances: HashMap<&'static str, ServiceInstance>,
}

impl std::fmt::Debug for ResolvedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedServices")
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvedServices {
    /// Retrieves the typed instance behind a descriptor.
    pub fn get<T: Send + Sync + 'static>(
        &self,
        descriptor: &ServiceDescriptor<T>,
    ) -> anyhow::Result<Arc<T>> {
        let instance = self
            .instances
            .get(descriptor.name)
            .with_context(|| format!("Service '{}' was not declared by this endpoint", descriptor.name))?;

        instance
            .clone()
            .downcast::<T>()
            .map_err(|_| anyhow!("Service '{}' has an unexpected type", descriptor.name))
    }

    pub(crate) fn raw(&self, name: &str) -> Option<ServiceInstance> {
        self.instances.get(name).cloned()
    }
}
