//! Name-keyed registries for orchestration and activity handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{codec, OrchestrationContext};

/// Per-invocation context handed to activities.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    /// 1-based attempt number under the scheduling retry policy.
    pub attempt: u32,
}

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

struct FnOrchestration<F>(F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

struct FnActivity<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Default)]
pub struct OrchestrationRegistryBuilder {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self
            .handlers
            .insert(name.clone(), Arc::new(FnOrchestration(handler)))
            .is_some()
        {
            panic!("orchestration already registered: {name}");
        }
        self
    }

    /// Register a handler whose input and output are serde types; the JSON
    /// codec runs at the boundary and a decode failure fails the instance.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx, raw: String| {
            let handler = handler.clone();
            async move {
                let input: In = codec::decode(&raw)?;
                let out = handler(ctx, input).await?;
                codec::encode(&out)
            }
        })
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            handlers: self.handlers,
        }
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[derive(Default)]
pub struct ActivityRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(FnActivity(handler))).is_some() {
            panic!("activity already registered: {name}");
        }
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx, raw: String| {
            let handler = handler.clone();
            async move {
                let input: In = codec::decode(&raw)?;
                let out = handler(ctx, input).await?;
                codec::encode(&out)
            }
        })
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            handlers: self.handlers,
        }
    }
}
