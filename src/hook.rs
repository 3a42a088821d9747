//! Runtime authorization hooks.
//!
//! The four callbacks a broker consults during session setup and routing:
//! context creation, CONNECT handling, re-authentication, and per-topic
//! publish/subscribe authorization. Implementations are installed once per
//! pool through the [`PoolContextBuilder`](crate::context::PoolContextBuilder);
//! there is no runtime registration or code loading.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::topic::TopicPath;
use crate::types::{null_context, AuthPacket, ConnAck, ConnectPacket, PoolId, Publish, UserContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclAction {
    Publish,
    Subscribe,
}

#[async_trait]
pub trait AuthHook: Sync + Send {
    ///Creates the opaque context attached to a fresh session.
    async fn new_user_context(&self, pool: &PoolId, client_id: &str) -> UserContext;

    ///Handles a CONNECT; on success returns the CONNACK to send and the
    ///(possibly updated) user context.
    async fn connect(&self, connect: &ConnectPacket, ctx: UserContext) -> Result<(ConnAck, UserContext)>;

    ///Handles an AUTH re-authentication exchange.
    async fn reauth(&self, auth: &AuthPacket, ctx: UserContext) -> Result<(AuthPacket, UserContext)>;

    ///Per-topic authorization. The router consults this with
    ///[`AclAction::Subscribe`] for every retained message it is about to
    ///replay to a new subscription.
    async fn is_allowed(
        &self,
        action: AclAction,
        topic: &TopicPath,
        publish: Option<&Publish>,
        ctx: &UserContext,
    ) -> bool;
}

/// Permits everything; the context is a JSON null.
pub struct DefaultAuthHook;

#[async_trait]
impl AuthHook for DefaultAuthHook {
    async fn new_user_context(&self, _pool: &PoolId, _client_id: &str) -> UserContext {
        null_context()
    }

    async fn connect(&self, _connect: &ConnectPacket, ctx: UserContext) -> Result<(ConnAck, UserContext)> {
        Ok((ConnAck::success(false), ctx))
    }

    async fn reauth(&self, auth: &AuthPacket, ctx: UserContext) -> Result<(AuthPacket, UserContext)> {
        Ok((auth.clone(), ctx))
    }

    async fn is_allowed(
        &self,
        _action: AclAction,
        _topic: &TopicPath,
        _publish: Option<&Publish>,
        _ctx: &UserContext,
    ) -> bool {
        true
    }
}
