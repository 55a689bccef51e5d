//! Named activities
//!
//! Steps are dispatched by activity name with a JSON payload, the way a
//! durable backend invokes them. [`Activity`] is the typed trait step
//! implementations write against; [`ActivityHandler`] is its erased,
//! JSON-in/JSON-out form stored in an [`ActivityRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StepError;

/// A typed pipeline activity
#[async_trait]
pub trait Activity: Send + Sync {
    /// Name the activity is registered and dispatched under
    const NAME: &'static str;

    type Payload: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn run(&self, payload: Self::Payload) -> Result<Self::Output, StepError>;
}

/// JSON form of an activity
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, payload: Value) -> Result<Value, StepError>;
}

#[async_trait]
impl<A: Activity> ActivityHandler for A {
    async fn invoke(&self, payload: Value) -> Result<Value, StepError> {
        let payload: A::Payload = serde_json::from_value(payload)?;
        let output = Activity::run(self, payload).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Activities by name
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<&'static str, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `activity` under its [`Activity::NAME`], replacing any
    /// previous registration
    pub fn register<A: Activity + 'static>(mut self, activity: A) -> Self {
        self.activities.insert(A::NAME, Arc::new(activity));
        self
    }

    /// Register an erased handler under an explicit name
    pub fn register_handler(mut self, name: &'static str, handler: Arc<dyn ActivityHandler>) -> Self {
        self.activities.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub async fn invoke(&self, name: &str, payload: Value) -> Result<Value, StepError> {
        let handler = self
            .activities
            .get(name)
            .ok_or_else(|| StepError::InvalidConfig(format!("no activity registered as {name:?}")))?;
        handler.invoke(payload).await
    }

    /// Typed dispatch: serialize `payload`, invoke `name`, decode the result
    pub async fn call<P, T>(&self, name: &str, payload: &P) -> Result<T, StepError>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let output = self.invoke(name, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(output)?)
    }
}
