//! Topic routing and subscription management.
//!
//! One [`DefaultRouter`] per pool maps normalized topic filters to
//! destinations and dispatches every publish to the destinations whose
//! filter matches, honoring the per-subscriber MQTT-5 options (`no_local`,
//! `retain_as_published`, `retain_handling`).
//!
//! Concurrency model: mutations of the matching structure (`subscribe`,
//! `unsubscribe`, owner-death removal) serialize on the topic tree's write
//! lock, while `publish` takes only the read lock and performs matching and
//! dispatch on the caller's task, so publishers never queue behind each
//! other and subscription churn only briefly blocks matching. Destinations
//! are cloned out before dispatch so no lock is held across a subscriber
//! callback or the ACL.
//!
//! Subscription lifetime is tied to its owner's mailbox: a watch task per
//! owner waits for the mailbox to close and then removes every destination
//! the owner held. That watch is the only garbage-collection path; manual
//! `unsubscribe` is optional.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytestring::ByteString;
use dashmap::DashMap;
use itertools::Itertools;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{Result, RouteError};
use crate::hook::{AclAction, AuthHook};
use crate::retain::RetainStorage;
use crate::topic::{TopicError, TopicPath};
use crate::trie::SubTree;
use crate::types::{
    null_context, Envelope, HashMap, HashSet, Id, Message, PoolId, Publish, RetainHandling, Retained,
    Route, SessionHandle, Subscriber, SubscriptionOptions, UserContext,
};
use crate::utils::Counter;

#[derive(Debug, Clone)]
pub struct Destination {
    pub subscriber: Subscriber,
    pub opts: SubscriptionOptions,
}

struct OwnerEntry {
    filters: HashSet<ByteString>,
    watch: JoinHandle<()>,
}

type RelationsMap = DashMap<ByteString, HashMap<Id, Destination>>;
type MonitorsMap = DashMap<Id, OwnerEntry>;

#[async_trait]
pub trait Router: Sync + Send {
    /// Adds (or replaces) the owner's destination under `filter` and
    /// replays retained messages according to `retain_handling`.
    async fn subscribe(
        &self,
        filter: &str,
        subscriber: Subscriber,
        owner: SessionHandle,
        opts: SubscriptionOptions,
    ) -> Result<()>;

    /// Removes the owner's destination under `filter`.
    async fn unsubscribe(&self, filter: &str, owner: &Id) -> Result<()>;

    /// Dispatches `publish` to every matching destination, then hands it to
    /// the retain store when its retain flag is set.
    async fn publish(&self, from: &Id, publish: Publish, publisher_context: UserContext) -> Result<()>;

    ///Number of distinct subscribed filters
    fn topics(&self) -> Counter;

    ///Number of subscription relations
    fn routes(&self) -> Counter;

    ///Subscribed filters, up to `limit`
    async fn list_routes(&self, limit: usize) -> Vec<Route>;

    ///Subscription relations as JSON, up to `limit`
    async fn list_relations(&self, limit: usize) -> Vec<serde_json::Value>;
}

#[derive(Clone)]
pub struct DefaultRouter {
    pool: PoolId,
    topics: Arc<RwLock<SubTree<()>>>,
    relations: Arc<RelationsMap>,
    monitors: Arc<MonitorsMap>,
    topics_count: Arc<Counter>,
    relations_count: Arc<Counter>,
    retain: Arc<dyn RetainStorage>,
    auth: Arc<dyn AuthHook>,
}

impl DefaultRouter {
    #[inline]
    pub fn new(pool: PoolId, retain: Arc<dyn RetainStorage>, auth: Arc<dyn AuthHook>) -> DefaultRouter {
        Self {
            pool,
            topics: Arc::new(RwLock::new(SubTree::default())),
            relations: Arc::new(DashMap::default()),
            monitors: Arc::new(DashMap::default()),
            topics_count: Arc::new(Counter::new()),
            relations_count: Arc::new(Counter::new()),
            retain,
            auth,
        }
    }

    #[inline]
    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    fn spawn_owner_watch(&self, owner: SessionHandle) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            owner.tx.closed().await;
            log::debug!("{:?} owner down, removing its subscriptions", owner.id);
            router.remove_owner(&owner.id).await;
        })
    }

    ///Removes every destination the owner held; the sole GC path for
    ///crashed subscribers.
    async fn remove_owner(&self, owner: &Id) {
        let mut topics = self.topics.write().await;
        let Some((_, entry)) = self.monitors.remove(owner) else {
            return;
        };
        for filter_key in entry.filters {
            let mut filter_gone = false;
            if let Some(mut rels) = self.relations.get_mut(&filter_key) {
                if rels.remove(owner).is_some() {
                    self.relations_count.dec();
                }
                filter_gone = rels.is_empty();
            }
            if filter_gone && self.relations.remove_if(&filter_key, |_, r| r.is_empty()).is_some() {
                self.topics_count.dec();
                if let Ok(filter) = TopicPath::from_str(&filter_key) {
                    topics.remove(&filter, &());
                }
            }
        }
    }

    fn dispatch(&self, subscriber: &Subscriber, env: Envelope) {
        match subscriber {
            Subscriber::Mailbox(tx) => {
                if let Err(e) = tx.send(Message::Forward(Box::new(env))) {
                    //Never retried; a dead owner is reaped by its watch task.
                    log::warn!("deliver to subscriber mailbox failed, {:?}", e);
                }
            }
            Subscriber::Callback(f) => f(env),
        }
    }

    async fn replay_retained(
        &self,
        filter: &TopicPath,
        subscriber: &Subscriber,
        opts: &SubscriptionOptions,
    ) -> Result<()> {
        let sub_ctx = opts.context.clone().unwrap_or_else(null_context);
        for (topic, retained) in self.retain.matches(filter).await? {
            if !self.auth.is_allowed(AclAction::Subscribe, &topic, Some(&retained.publish), &sub_ctx).await
            {
                log::debug!("retained replay denied, topic: {}", topic);
                continue;
            }
            let Some(bindings) = filter.captures(&topic) else {
                continue;
            };
            let env = Envelope {
                pool: self.pool.clone(),
                topic,
                bindings,
                publish: retained.publish,
                publisher_context: retained.context,
                opts: opts.clone(),
            };
            self.dispatch(subscriber, env);
        }
        Ok(())
    }
}

#[async_trait]
impl Router for DefaultRouter {
    async fn subscribe(
        &self,
        filter: &str,
        subscriber: Subscriber,
        owner: SessionHandle,
        opts: SubscriptionOptions,
    ) -> Result<()> {
        if let Subscriber::Mailbox(tx) = &subscriber {
            if tx.is_closed() {
                return Err(RouteError::InvalidSubscriber);
            }
        }
        let filter_path = TopicPath::from_str(filter)?;
        let filter_key = ByteString::from(filter_path.to_string());
        log::debug!("{:?} subscribe, filter: {}", owner.id, filter_key);

        let is_new = {
            //Control-plane serialization point.
            let mut topics = self.topics.write().await;
            topics.insert(&filter_path, ());

            let old = {
                let mut rels = self.relations.entry(filter_key.clone()).or_insert_with(|| {
                    self.topics_count.inc();
                    HashMap::default()
                });
                rels.insert(
                    owner.id.clone(),
                    Destination { subscriber: subscriber.clone(), opts: opts.clone() },
                )
            };
            if old.is_none() {
                self.relations_count.inc();
            }

            match self.monitors.entry(owner.id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut e) => {
                    e.get_mut().filters.insert(filter_key.clone());
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    let watch = self.spawn_owner_watch(owner.clone());
                    let mut filters = HashSet::default();
                    filters.insert(filter_key.clone());
                    e.insert(OwnerEntry { filters, watch });
                }
            }

            old.is_none()
        };

        let replay = match opts.retain_handling {
            RetainHandling::AtSubscribe => true,
            RetainHandling::AtNewSubscribe => is_new,
            RetainHandling::Never => false,
        };
        if replay {
            self.replay_retained(&filter_path, &subscriber, &opts).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, owner: &Id) -> Result<()> {
        let filter_path = TopicPath::from_str(filter)?;
        let filter_key = ByteString::from(filter_path.to_string());
        log::debug!("{:?} unsubscribe, filter: {}", owner, filter_key);

        let mut topics = self.topics.write().await;

        let (removed, owner_empty) = {
            if let Some(mut entry) = self.monitors.get_mut(owner) {
                let removed = entry.filters.remove(&filter_key);
                (removed, entry.filters.is_empty())
            } else {
                (false, false)
            }
        };
        if !removed {
            return Err(RouteError::NotFound);
        }
        if owner_empty {
            if let Some((_, entry)) = self.monitors.remove_if(owner, |_, e| e.filters.is_empty()) {
                entry.watch.abort();
            }
        }

        let mut filter_gone = false;
        if let Some(mut rels) = self.relations.get_mut(&filter_key) {
            if rels.remove(owner).is_some() {
                self.relations_count.dec();
            }
            filter_gone = rels.is_empty();
        }
        if filter_gone && self.relations.remove_if(&filter_key, |_, r| r.is_empty()).is_some() {
            self.topics_count.dec();
            topics.remove(&filter_path, &());
        }
        Ok(())
    }

    async fn publish(&self, from: &Id, publish: Publish, publisher_context: UserContext) -> Result<()> {
        if publish.topic.is_filter() {
            return Err(RouteError::Topic(TopicError::NotConcrete(publish.topic.to_string())));
        }

        let matcheds = self.topics.read().await.matches(&publish.topic);
        for m in matcheds.iter().unique_by(|m| m.filter.to_string()) {
            let filter_key = ByteString::from(m.filter.to_string());
            //Clone destinations out so no shard lock spans dispatch.
            let dests = self
                .relations
                .get(&filter_key)
                .map(|rels| rels.iter().map(|(id, d)| (id.clone(), d.clone())).collect::<Vec<_>>())
                .unwrap_or_default();

            for (owner_id, dest) in dests {
                if dest.opts.no_local && &owner_id == from {
                    log::debug!("{:?} no_local, skip dispatch, topic: {}", owner_id, publish.topic);
                    continue;
                }
                let mut p = publish.clone();
                if p.retain && !dest.opts.retain_as_published {
                    p.retain = false;
                }
                let env = Envelope {
                    pool: self.pool.clone(),
                    topic: publish.topic.clone(),
                    bindings: m.bindings.clone(),
                    publish: p,
                    publisher_context: publisher_context.clone(),
                    opts: dest.opts.clone(),
                };
                self.dispatch(&dest.subscriber, env);
            }
        }

        if publish.retain {
            let retained = Retained { publish: publish.clone(), context: publisher_context };
            if let Err(e) = self.retain.set(&publish.topic, retained, None).await {
                log::warn!("store retained message failed, topic: {}, {:?}", publish.topic, e);
            }
        }
        Ok(())
    }

    #[inline]
    fn topics(&self) -> Counter {
        self.topics_count.as_ref().clone()
    }

    #[inline]
    fn routes(&self) -> Counter {
        self.relations_count.as_ref().clone()
    }

    async fn list_routes(&self, limit: usize) -> Vec<Route> {
        self.relations
            .iter()
            .take(limit)
            .map(|e| Route { pool: self.pool.clone(), topic: e.key().clone() })
            .collect()
    }

    async fn list_relations(&self, limit: usize) -> Vec<serde_json::Value> {
        let mut rels = Vec::new();
        for entry in self.relations.iter() {
            let filter = entry.key();
            for (owner_id, dest) in entry.value().iter() {
                rels.push(json!({
                    "topic_filter": filter,
                    "client_id": owner_id.client_id(),
                    "opts": dest.opts.to_json(),
                }));
                if rels.len() >= limit {
                    return rels;
                }
            }
        }
        rels
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::hook::DefaultAuthHook;
    use crate::retain::DefaultRetainStorage;
    use crate::topic::Binding;
    use crate::types::{QoS, Rx};

    fn router() -> DefaultRouter {
        DefaultRouter::new(
            "default".into(),
            Arc::new(DefaultRetainStorage::new()),
            Arc::new(DefaultAuthHook),
        )
    }

    fn session(client_id: &str) -> (SessionHandle, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(Id::new(client_id), tx), rx)
    }

    fn recv_forward(rx: &mut Rx) -> Option<Box<Envelope>> {
        match rx.try_recv() {
            Ok(Message::Forward(env)) => Some(env),
            _ => None,
        }
    }

    fn publish(topic: &str, payload: &'static str) -> Publish {
        Publish::new(TopicPath::from_str(topic).unwrap(), payload)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn single_level_wildcard_bindings() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        r.subscribe("sensors/+/temp", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();

        let pid = Id::new("pub");
        r.publish(&pid, publish("sensors/42/temp", "21.5"), null_context()).await.unwrap();

        let env = recv_forward(&mut rx1).unwrap();
        assert_eq!(env.topic.to_string(), "sensors/42/temp");
        assert_eq!(env.bindings, vec![Binding::Level(1, "42".into())]);
        assert_eq!(env.publish.payload.as_ref(), b"21.5");
        assert!(recv_forward(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn multi_level_wildcard_bindings() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        r.subscribe("a/#", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();

        r.publish(&Id::new("pub"), publish("a/b/c", "x"), null_context()).await.unwrap();

        let env = recv_forward(&mut rx1).unwrap();
        assert_eq!(env.bindings, vec![Binding::Suffix(vec!["b".into(), "c".into()])]);
    }

    #[tokio::test]
    async fn no_local_skips_the_publisher() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        let (s2, mut rx2) = session("o2");
        let opts = SubscriptionOptions { no_local: true, ..Default::default() };
        r.subscribe("t", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts.clone()).await.unwrap();
        r.subscribe("t", Subscriber::Mailbox(s2.tx.clone()), s2.clone(), opts).await.unwrap();

        r.publish(&s1.id, publish("t", "x"), null_context()).await.unwrap();

        assert!(recv_forward(&mut rx1).is_none());
        assert!(recv_forward(&mut rx2).is_some());
    }

    #[tokio::test]
    async fn retain_flag_masked_unless_retain_as_published() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        let (s2, mut rx2) = session("o2");
        r.subscribe("t", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        let opts = SubscriptionOptions { retain_as_published: true, ..Default::default() };
        r.subscribe("t", Subscriber::Mailbox(s2.tx.clone()), s2.clone(), opts).await.unwrap();

        r.publish(&Id::new("pub"), publish("t", "x").retain(true), null_context()).await.unwrap();

        assert!(!recv_forward(&mut rx1).unwrap().publish.retain);
        assert!(recv_forward(&mut rx2).unwrap().publish.retain);
    }

    #[tokio::test]
    async fn resubscription_replaces_destination() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        let opts0 = SubscriptionOptions { qos: QoS::AtMostOnce, ..Default::default() };
        let opts1 = SubscriptionOptions { qos: QoS::AtLeastOnce, ..Default::default() };
        r.subscribe("t", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts0).await.unwrap();
        r.subscribe("t", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts1).await.unwrap();
        assert_eq!(r.routes().count(), 1);
        assert_eq!(r.topics().count(), 1);

        r.publish(&Id::new("pub"), publish("t", "x"), null_context()).await.unwrap();

        let env = recv_forward(&mut rx1).unwrap();
        assert_eq!(env.opts.qos, QoS::AtLeastOnce);
        assert!(recv_forward(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_and_notfound() {
        let r = router();
        let (s1, mut rx1) = session("o1");
        r.subscribe("t", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        r.unsubscribe("t", &s1.id).await.unwrap();
        assert!(matches!(r.unsubscribe("t", &s1.id).await, Err(RouteError::NotFound)));
        assert_eq!(r.routes().count(), 0);
        assert_eq!(r.topics().count(), 0);

        r.publish(&Id::new("pub"), publish("t", "x"), null_context()).await.unwrap();
        assert!(recv_forward(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn invalid_subscriber_rejected() {
        let r = router();
        let (s1, _rx1) = session("o1");
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let res = r.subscribe("t", Subscriber::Mailbox(dead_tx), s1.clone(), Default::default()).await;
        assert!(matches!(res, Err(RouteError::InvalidSubscriber)));
    }

    #[tokio::test]
    async fn owner_death_removes_all_subscriptions() {
        let r = router();
        let (s1, rx1) = session("o1");
        r.subscribe("a/b", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        r.subscribe("c/+", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        assert_eq!(r.routes().count(), 2);

        drop(rx1);
        for _ in 0..100 {
            if r.routes().count() == 0 {
                break;
            }
            settle().await;
        }
        assert_eq!(r.routes().count(), 0);
        assert_eq!(r.topics().count(), 0);
        assert!(r.list_routes(10).await.is_empty());
    }

    #[tokio::test]
    async fn callback_subscriber_is_invoked() {
        let r = router();
        let (s1, _rx1) = session("o1");
        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Subscriber::Callback(Arc::new(move |env: Envelope| {
                seen.lock().unwrap().push(env);
            }))
        };
        r.subscribe("cb/+", sink, s1.clone(), Default::default()).await.unwrap();

        r.publish(&Id::new("pub"), publish("cb/1", "x"), null_context()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].bindings, vec![Binding::Level(1, "1".into())]);
    }

    #[tokio::test]
    async fn retained_replay_gating() {
        let r = router();

        //seed a retained message through the normal publish path
        r.publish(&Id::new("pub"), publish("r", "keep").retain(true), null_context()).await.unwrap();

        let opts = SubscriptionOptions { retain_handling: RetainHandling::AtNewSubscribe, ..Default::default() };

        let (s1, mut rx1) = session("o1");
        r.subscribe("r", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts.clone()).await.unwrap();
        let env = recv_forward(&mut rx1).expect("first subscribe replays retained");
        assert!(env.publish.retain);
        assert_eq!(env.publish.payload.as_ref(), b"keep");

        //resubscription without unsubscribe is not a new subscription
        r.subscribe("r", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts.clone()).await.unwrap();
        assert!(recv_forward(&mut rx1).is_none());

        //after unsubscribe it is new again
        r.unsubscribe("r", &s1.id).await.unwrap();
        r.subscribe("r", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), opts.clone()).await.unwrap();
        assert!(recv_forward(&mut rx1).is_some());

        //retain_handling = 2 never replays
        let (s2, mut rx2) = session("o2");
        let never = SubscriptionOptions { retain_handling: RetainHandling::Never, ..Default::default() };
        r.subscribe("r", Subscriber::Mailbox(s2.tx.clone()), s2.clone(), never).await.unwrap();
        assert!(recv_forward(&mut rx2).is_none());

        //retain_handling = 0 replays even on resubscription
        let always = SubscriptionOptions { retain_handling: RetainHandling::AtSubscribe, ..Default::default() };
        r.subscribe("r", Subscriber::Mailbox(s2.tx.clone()), s2.clone(), always.clone()).await.unwrap();
        assert!(recv_forward(&mut rx2).is_some());
        r.subscribe("r", Subscriber::Mailbox(s2.tx.clone()), s2.clone(), always).await.unwrap();
        assert!(recv_forward(&mut rx2).is_some());
    }

    #[tokio::test]
    async fn retained_replay_respects_acl() {
        struct DenyAll;

        #[async_trait]
        impl AuthHook for DenyAll {
            async fn new_user_context(&self, _: &PoolId, _: &str) -> UserContext {
                null_context()
            }
            async fn connect(
                &self,
                _: &crate::types::ConnectPacket,
                ctx: UserContext,
            ) -> Result<(crate::types::ConnAck, UserContext)> {
                Ok((crate::types::ConnAck::success(false), ctx))
            }
            async fn reauth(
                &self,
                auth: &crate::types::AuthPacket,
                ctx: UserContext,
            ) -> Result<(crate::types::AuthPacket, UserContext)> {
                Ok((auth.clone(), ctx))
            }
            async fn is_allowed(
                &self,
                _: AclAction,
                _: &TopicPath,
                _: Option<&Publish>,
                _: &UserContext,
            ) -> bool {
                false
            }
        }

        let r = DefaultRouter::new("default".into(), Arc::new(DefaultRetainStorage::new()), Arc::new(DenyAll));
        r.publish(&Id::new("pub"), publish("r", "keep").retain(true), null_context()).await.unwrap();

        let (s1, mut rx1) = session("o1");
        r.subscribe("r", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        assert!(recv_forward(&mut rx1).is_none());

        //live routing is unaffected by the replay ACL
        r.publish(&Id::new("pub"), publish("r", "live"), null_context()).await.unwrap();
        assert!(recv_forward(&mut rx1).is_some());
    }

    #[tokio::test]
    async fn publish_topic_must_be_concrete() {
        let r = router();
        let res = r.publish(&Id::new("pub"), publish("t", "x"), null_context()).await;
        assert!(res.is_ok());
        let bad = Publish::new("a/+".parse().unwrap(), "x");
        assert!(matches!(
            r.publish(&Id::new("pub"), bad, null_context()).await,
            Err(RouteError::Topic(_))
        ));
    }

    #[tokio::test]
    async fn relations_json() {
        let r = router();
        let (s1, _rx1) = session("o1");
        r.subscribe("a/+", Subscriber::Mailbox(s1.tx.clone()), s1.clone(), Default::default())
            .await
            .unwrap();
        let rels = r.list_relations(10).await;
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0]["topic_filter"], "a/+");
        assert_eq!(rels[0]["client_id"], "o1");
    }
}
