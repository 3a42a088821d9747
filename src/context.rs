use std::fmt;
use std::sync::Arc;

use crate::hook::{AuthHook, DefaultAuthHook};
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::router::DefaultRouter;
use crate::types::PoolId;

/// Shared state of one logical broker pool: its router, retain storage and
/// authorization hook.
///
/// ```rust,no_run
/// use routemq::context::PoolContext;
///
/// #[tokio::main]
/// async fn main() {
///     let scx = PoolContext::new("default").build();
///     let _router = scx.router.clone();
/// }
/// ```
#[derive(Clone)]
pub struct PoolContext {
    pub pool: PoolId,
    pub router: Arc<DefaultRouter>,
    pub retain: Arc<dyn RetainStorage>,
    pub auth: Arc<dyn AuthHook>,
}

impl PoolContext {
    #[inline]
    pub fn new(pool: impl Into<PoolId>) -> PoolContextBuilder {
        PoolContextBuilder { pool: pool.into(), retain: None, auth: None }
    }
}

impl fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolContext {{ pool: {} }}", self.pool)
    }
}

pub struct PoolContextBuilder {
    pool: PoolId,
    retain: Option<Arc<dyn RetainStorage>>,
    auth: Option<Arc<dyn AuthHook>>,
}

impl PoolContextBuilder {
    pub fn retain_storage(mut self, retain: Arc<dyn RetainStorage>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn auth_hook(mut self, auth: Arc<dyn AuthHook>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn build(self) -> PoolContext {
        let retain = self.retain.unwrap_or_else(|| Arc::new(DefaultRetainStorage::new()));
        let auth = self.auth.unwrap_or_else(|| Arc::new(DefaultAuthHook));
        let router = Arc::new(DefaultRouter::new(self.pool.clone(), retain.clone(), auth.clone()));
        PoolContext { pool: self.pool, router, retain, auth }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_defaults() {
        let scx = PoolContext::new("default").build();
        assert_eq!(scx.pool, "default");
        assert_eq!(scx.router.pool(), &scx.pool);
        assert_eq!(scx.retain.count().await, 0);
    }
}
