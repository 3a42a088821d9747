use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use once_cell::sync::Lazy;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::topic::{Binding, TopicPath};
use crate::utils::timestamp_millis;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

/// Identifier of one logical broker within the process.
pub type PoolId = ByteString;

/// MQTT-5 user/system properties, free-form.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Opaque ACL/identity context carried alongside a session; produced and
/// consumed by the [`AuthHook`](crate::hook::AuthHook) only.
pub type UserContext = Arc<serde_json::Value>;

static NULL_CONTEXT: Lazy<UserContext> = Lazy::new(|| Arc::new(serde_json::Value::Null));

#[inline]
pub fn null_context() -> UserContext {
    NULL_CONTEXT.clone()
}

pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

/// Session mailbox messages.
#[derive(Debug)]
pub enum Message {
    ///A routed publish for this subscriber.
    Forward(Box<Envelope>),
    ///Terminate request, best effort.
    Close(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    ///The CONNECT handshake did not complete in time.
    ConnectTimeout,
    ///The session-expiry or will-delay timer elapsed without a reconnect.
    SessionExpired,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ConnectTimeout => write!(f, "connect timeout"),
            Reason::SessionExpired => write!(f, "session expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for QoS {
    #[inline]
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    #[inline]
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(v),
        }
    }
}

impl Serialize for QoS {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for QoS {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        QoS::try_from(v).map_err(|v| de::Error::custom(format!("invalid QoS value {}", v)))
    }
}

/// MQTT-5 Retain Handling subscription option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetainHandling {
    ///0 - send retained messages on every subscribe
    AtSubscribe = 0,
    ///1 - send retained messages only if the subscription is new
    AtNewSubscribe = 1,
    ///2 - never send retained messages
    Never = 2,
}

impl RetainHandling {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for RetainHandling {
    #[inline]
    fn default() -> Self {
        RetainHandling::AtSubscribe
    }
}

impl TryFrom<u8> for RetainHandling {
    type Error = u8;

    #[inline]
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(RetainHandling::AtSubscribe),
            1 => Ok(RetainHandling::AtNewSubscribe),
            2 => Ok(RetainHandling::Never),
            _ => Err(v),
        }
    }
}

impl Serialize for RetainHandling {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for RetainHandling {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        RetainHandling::try_from(v)
            .map_err(|v| de::Error::custom(format!("invalid retain handling value {}", v)))
    }
}

/// An application message as routed between sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub topic: TopicPath,
    pub payload: Bytes,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub properties: Properties,
}

impl Publish {
    #[inline]
    pub fn new(topic: TopicPath, payload: impl Into<Bytes>) -> Self {
        Publish {
            topic,
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
            properties: Properties::default(),
        }
    }

    #[inline]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// The message a broker publishes on the client's behalf when the session
/// ends abnormally or after the will-delay elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: TopicPath,
    pub payload: Bytes,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub properties: Properties,
    ///Seconds to wait after disconnect before the will may be published.
    #[serde(default)]
    pub delay_interval: u64,
}

impl LastWill {
    #[inline]
    pub fn new(topic: TopicPath, payload: impl Into<Bytes>) -> Self {
        LastWill {
            topic,
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
            properties: Properties::default(),
            delay_interval: 0,
        }
    }
}

impl From<LastWill> for Publish {
    #[inline]
    fn from(w: LastWill) -> Self {
        Publish { topic: w.topic, payload: w.payload, qos: w.qos, retain: w.retain, properties: w.properties }
    }
}

/// Per-subscriber options, MQTT-5 SUBSCRIBE semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub retain_as_published: bool,
    #[serde(default)]
    pub retain_handling: RetainHandling,
    ///Opaque subscriber context, consulted by the ACL on retained replay.
    #[serde(skip)]
    pub context: Option<UserContext>,
}

impl SubscriptionOptions {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "qos": self.qos.value(),
            "no_local": self.no_local,
            "retain_as_published": self.retain_as_published,
            "retain_handling": self.retain_handling.value(),
        })
    }
}

/// Session/client identity; cheap to clone, equal and hashed by client id.
#[derive(Clone, Serialize, Deserialize)]
pub struct Id(Arc<IdInner>);

#[derive(Serialize, Deserialize)]
pub struct IdInner {
    pub client_id: ByteString,
    pub create_time: i64,
}

impl Id {
    #[inline]
    pub fn new(client_id: impl Into<ByteString>) -> Self {
        Id(Arc::new(IdInner { client_id: client_id.into(), create_time: timestamp_millis() }))
    }

    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.0.client_id
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "clientid": self.0.client_id, "create_time": self.0.create_time })
    }
}

impl Deref for Id {
    type Target = IdInner;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0.client_id, self.0.create_time)
    }
}

impl PartialEq for Id {
    #[inline]
    fn eq(&self, other: &Id) -> bool {
        self.0.client_id == other.0.client_id
    }
}

impl Eq for Id {}

impl std::hash::Hash for Id {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.client_id.hash(state);
    }
}

/// Handle of a session actor: its identity plus the sending half of its
/// mailbox. Doubles as the liveness anchor of the session's subscriptions;
/// when every receiver is gone the owner is considered dead.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Id,
    pub tx: Tx,
}

impl SessionHandle {
    #[inline]
    pub fn new(id: Id, tx: Tx) -> Self {
        SessionHandle { id, tx }
    }
}

pub type SubscriberFn = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Where a matched publish goes: a session mailbox, or a direct callback
/// with its leading arguments captured in the closure.
#[derive(Clone)]
pub enum Subscriber {
    Mailbox(Tx),
    Callback(SubscriberFn),
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Mailbox(_) => write!(f, "Subscriber::Mailbox"),
            Subscriber::Callback(_) => write!(f, "Subscriber::Callback"),
        }
    }
}

/// What a subscriber receives for each matched publish.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub pool: PoolId,
    ///The concrete topic the message was published on.
    pub topic: TopicPath,
    ///What each wildcard of the matched filter bound to.
    pub bindings: Vec<Binding>,
    ///The message, retain flag already masked for this subscriber.
    pub publish: Publish,
    pub publisher_context: UserContext,
    ///The matched subscription's options.
    pub opts: SubscriptionOptions,
}

impl Envelope {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "type": "publish",
            "pool": self.pool,
            "topic": self.topic.to_string(),
            "topic_bindings": self.bindings.iter().map(Binding::to_json).collect::<Vec<_>>(),
            "message": {
                "topic": self.publish.topic.to_string(),
                "payload": self.publish.payload.as_ref(),
                "qos": self.publish.qos.value(),
                "retain": self.publish.retain,
                "properties": self.publish.properties,
            },
            "publisher_context": self.publisher_context.as_ref(),
            "subscriber_context": self.opts.context.as_deref(),
            "qos": self.opts.qos.value(),
            "no_local": self.opts.no_local,
            "retain_as_published": self.opts.retain_as_published,
            "retain_handling": self.opts.retain_handling.value(),
        })
    }
}

/// A retained-message entry: the stored message plus the publisher's
/// context, replayed through the ACL on new subscriptions.
#[derive(Debug, Clone)]
pub struct Retained {
    pub publish: Publish,
    pub context: UserContext,
}

/// One subscription relation, introspection view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub pool: PoolId,
    pub topic: ByteString,
}

/// Minimal CONNECT view handed to the ACL; the wire codec lives outside
/// this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub client_id: ByteString,
    #[serde(default)]
    pub username: Option<ByteString>,
    #[serde(default)]
    pub password: Option<Bytes>,
    #[serde(default)]
    pub clean_start: bool,
    #[serde(default)]
    pub keep_alive: u16,
    #[serde(default)]
    pub session_expiry_interval: u64,
    #[serde(default)]
    pub last_will: Option<LastWill>,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
    #[serde(default)]
    pub properties: Properties,
}

impl ConnAck {
    #[inline]
    pub fn success(session_present: bool) -> Self {
        ConnAck { session_present, reason_code: 0, properties: Properties::default() }
    }
}

/// Minimal AUTH packet view for re-authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPacket {
    pub method: ByteString,
    #[serde(default)]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub reason_code: u8,
    #[serde(default)]
    pub properties: Properties,
}
