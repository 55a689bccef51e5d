//! Tenant namespaces
//!
//! Every owner gets an isolated namespace on the durable backend, derived
//! from their username or email. The same value names the task queue and the
//! object storage bucket the tenant's pipelines use.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::durable::DurableBackend;
use crate::error::BackendError;
use crate::models::Owner;

pub const NAMESPACE_PREFIX: &str = "user-";

const MAX_BUCKET_LEN: usize = 63;

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._-]+").expect("valid namespace regex"));

static REPEATED_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.-]{2,}").expect("valid separator regex"));

/// Lowercase, replace anything outside `[a-z0-9._-]` with `-`, collapse
/// separator runs and trim them from both ends
pub fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let replaced = DISALLOWED.replace_all(&lowered, "-");
    let collapsed = REPEATED_SEPARATORS.replace_all(&replaced, "-");
    let slug = collapsed.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    if slug.is_empty() {
        "user".to_string()
    } else {
        slug.to_string()
    }
}

/// A tenant's namespace, e.g. `user-alice`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantNamespace(String);

impl TenantNamespace {
    /// Prefer the username, then the email (`@` becomes `-at-`), then the
    /// numeric id
    pub fn for_identity(username: Option<&str>, email: Option<&str>, fallback_id: Option<i64>) -> Self {
        fn non_blank(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }

        let base = match (non_blank(username), non_blank(email), fallback_id) {
            (Some(username), _, _) => username.to_string(),
            (None, Some(email), _) => email.to_string(),
            (None, None, Some(id)) => format!("user-{id}"),
            (None, None, None) => "user".to_string(),
        };

        let slug = slugify(&base.replace('@', "-at-"));
        TenantNamespace(format!("{NAMESPACE_PREFIX}{slug}"))
    }

    pub fn for_owner(owner: &Owner) -> Self {
        Self::for_identity(owner.username.as_deref(), owner.email.as_deref(), Some(owner.id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Task queue the tenant's runs are dispatched on
    pub fn task_queue(&self) -> String {
        task_queue_for(&self.0)
    }

    /// S3-safe bucket name for the tenant's objects
    pub fn bucket_name(&self) -> String {
        bucket_for(&self.0)
    }
}

impl fmt::Display for TenantNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn task_queue_for(namespace: &str) -> String {
    format!("etl-queue-{namespace}")
}

/// Bucket for a namespace: `_` and `.` become `-`, at most 63 characters
pub fn bucket_for(namespace: &str) -> String {
    let mut bucket: String = namespace
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect();
    bucket.truncate(MAX_BUCKET_LEN);
    bucket.trim_end_matches('-').to_string()
}

/// Lazily registers namespaces with the durable backend and remembers which
/// ones are known to exist
pub struct TenantRegistry {
    backend: Arc<dyn DurableBackend>,
    retention: Duration,
    connect_timeout: Duration,
    ensured: Mutex<HashSet<String>>,
}

impl TenantRegistry {
    pub fn new(backend: Arc<dyn DurableBackend>, retention: Duration, connect_timeout: Duration) -> Self {
        Self {
            backend,
            retention,
            connect_timeout,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DurableBackend> {
        &self.backend
    }

    fn is_cached(&self, namespace: &str) -> bool {
        self.ensured
            .lock()
            .map(|set| set.contains(namespace))
            .unwrap_or(false)
    }

    fn remember(&self, namespace: &str) {
        if let Ok(mut set) = self.ensured.lock() {
            set.insert(namespace.to_string());
        }
    }

    /// Make sure `namespace` exists on the backend.
    ///
    /// Never fails loudly: an unreachable backend or a rejected registration
    /// yields `false` and a warning, so callers can carry on degraded.
    pub async fn ensure(&self, namespace: &TenantNamespace) -> bool {
        let name = namespace.as_str();
        if self.is_cached(name) {
            return true;
        }

        match tokio::time::timeout(self.connect_timeout, self.backend.health_check()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(namespace = name, error = %e, "durable backend unreachable, namespace not ensured");
                return false;
            }
            Err(_) => {
                warn!(
                    namespace = name,
                    timeout = ?self.connect_timeout,
                    "timed out connecting to durable backend"
                );
                return false;
            }
        }

        let registered = tokio::time::timeout(
            self.connect_timeout,
            self.backend.register_namespace(name, self.retention),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(self.connect_timeout)));

        let ok = match registered {
            Ok(()) => {
                info!(namespace = name, "registered namespace");
                true
            }
            Err(BackendError::AlreadyExists(_)) => {
                debug!(namespace = name, "namespace already exists");
                true
            }
            Err(e) => match self.backend.describe_namespace(name).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(namespace = name, error = %e, "failed to register namespace");
                    false
                }
                Err(describe) => {
                    warn!(namespace = name, error = %e, describe_error = %describe, "failed to verify namespace");
                    false
                }
            },
        };

        if ok {
            self.remember(name);
        }
        ok
    }
}
