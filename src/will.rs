//! Last-will watchdog.
//!
//! One watchdog per session. It monitors the session's liveness, keeps the
//! current will message, and runs the disconnect expiry timer, publishing
//! the will through the pool's router exactly when MQTT-5 demands it: on
//! unexpected session termination, or when the armed expiry timer elapses
//! without a reconnect. A graceful `stop` guarantees no will is published
//! afterwards.
//!
//! Timers are generation-tagged: every arming aborts the previous sleeper
//! and bumps the generation, and an `Expired` event carrying a stale
//! generation is ignored. This closes the race between a timer firing and
//! its cancellation landing in the inbox.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::PoolContext;
use crate::error::Result;
use crate::router::Router as _;
use crate::types::{null_context, LastWill, Message, Publish, Reason, SessionHandle, UserContext};

///Seconds a fresh session may take to complete its CONNECT handshake.
const CONNECT_EXPIRY: u64 = 20;

enum Command {
    Connected { will: Option<LastWill>, session_expiry: u64, ctx: UserContext },
    Reconnected,
    Disconnected { is_will: bool, delay: Option<u64> },
    SetUserContext(UserContext),
    Expired(u64),
    SessionDown,
    Stop(oneshot::Sender<()>),
}

/// Handle of a spawned watchdog; operations are fire-and-forget except
/// [`stop`](WillWatchdog::stop).
#[derive(Clone)]
pub struct WillWatchdog {
    tx: mpsc::UnboundedSender<Command>,
}

impl WillWatchdog {
    /// Spawns the watchdog for `session`, begins monitoring its liveness
    /// and arms the connect-expiry timer. If the CONNECT handshake does not
    /// complete within 20 seconds the session is terminated; the will is
    /// still empty at that point, so nothing is published.
    pub fn spawn(scx: PoolContext, session: SessionHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = {
            let tx = tx.clone();
            let session_tx = session.tx.clone();
            tokio::spawn(async move {
                session_tx.closed().await;
                let _ = tx.send(Command::SessionDown);
            })
        };
        let state = Watchdog {
            scx,
            session,
            will: None,
            user_context: null_context(),
            session_expiry: 0,
            generation: 0,
            timer: None,
            stopping: false,
            handshaked: false,
            tx: tx.clone(),
        };
        tokio::spawn(state.run(rx, monitor));
        Self { tx }
    }

    ///The session finished its CONNECT handshake; replaces the will, the
    ///session expiry and the user context, and cancels any armed timer.
    #[inline]
    pub fn connected(&self, will: Option<LastWill>, session_expiry: u64, ctx: UserContext) {
        let _ = self.tx.send(Command::Connected { will, session_expiry, ctx });
    }

    /// The session re-attached; cancels any armed timer, everything else
    /// untouched. Call this before running any new connect-acceptance
    /// logic, so the expiry timer cannot terminate the session while the
    /// new connection is being set up.
    #[inline]
    pub fn reconnected(&self) {
        let _ = self.tx.send(Command::Reconnected);
    }

    ///The session lost its client connection; arms the expiry timer from
    ///the will-delay.
    #[inline]
    pub fn disconnected(&self) {
        self.disconnected_with(true, None);
    }

    /// As [`disconnected`](Self::disconnected), with explicit control.
    /// `is_will = false` clears the will first (its remembered delay still
    /// drives the timer when `delay` is `None`); an explicit `delay` caps
    /// the will-delay via `min`.
    #[inline]
    pub fn disconnected_with(&self, is_will: bool, delay: Option<u64>) {
        let _ = self.tx.send(Command::Disconnected { is_will, delay });
    }

    ///Replaces only the user context, after a re-authentication.
    #[inline]
    pub fn set_user_context(&self, ctx: UserContext) {
        let _ = self.tx.send(Command::SetUserContext(ctx));
    }

    /// Terminates the watchdog. After this returns no will can be
    /// published.
    pub async fn stop(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(Command::Stop(ack_tx))?;
        ack_rx.await.map_err(|_| crate::error::RouteError::Closed)?;
        Ok(())
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Watchdog {
    scx: PoolContext,
    session: SessionHandle,
    will: Option<LastWill>,
    user_context: UserContext,
    session_expiry: u64,
    ///Token of the currently armed timer; stale firings are ignored.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    stopping: bool,
    handshaked: bool,
    tx: mpsc::UnboundedSender<Command>,
}

impl Watchdog {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, monitor: JoinHandle<()>) {
        self.arm(CONNECT_EXPIRY);

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Connected { will, session_expiry, ctx } => {
                    log::debug!(
                        "{:?} connected, session_expiry: {}, has_will: {}",
                        self.session.id,
                        session_expiry,
                        will.is_some()
                    );
                    self.handshaked = true;
                    self.will = will;
                    self.session_expiry = session_expiry;
                    self.user_context = ctx;
                    self.cancel_timer();
                }
                Command::Reconnected => {
                    log::debug!("{:?} reconnected", self.session.id);
                    self.cancel_timer();
                }
                Command::Disconnected { is_will, delay } => {
                    self.on_disconnected(is_will, delay);
                }
                Command::SetUserContext(ctx) => {
                    self.user_context = ctx;
                }
                Command::Expired(generation) => {
                    if generation != self.generation {
                        log::debug!("{:?} stale expiry timer, ignored", self.session.id);
                        continue;
                    }
                    let reason =
                        if self.handshaked { Reason::SessionExpired } else { Reason::ConnectTimeout };
                    log::debug!("{:?} expired, terminating session, {}", self.session.id, reason);
                    //Best effort; the session may already be gone.
                    let _ = self.session.tx.send(Message::Close(reason));
                    self.publish_will().await;
                    break;
                }
                Command::SessionDown => {
                    log::debug!("{:?} session terminated unexpectedly", self.session.id);
                    self.publish_will().await;
                    break;
                }
                Command::Stop(ack) => {
                    self.stopping = true;
                    self.cancel_timer();
                    let _ = ack.send(());
                    break;
                }
            }
        }

        self.cancel_timer();
        monitor.abort();
    }

    fn on_disconnected(&mut self, is_will: bool, delay: Option<u64>) {
        let will_delay = self.will.as_ref().map(|w| w.delay_interval).unwrap_or(0);
        let delay = match (is_will, delay) {
            (false, None) => {
                self.will = None;
                will_delay
            }
            (false, Some(d)) => {
                self.will = None;
                d
            }
            (true, None) => will_delay,
            (true, Some(d)) => d.min(will_delay),
        };
        log::debug!(
            "{:?} disconnected, is_will: {}, delay: {}s, session_expiry: {}s",
            self.session.id,
            is_will,
            delay,
            self.session_expiry
        );
        self.arm(delay);
    }

    ///Arms a fresh expiry timer, replacing any prior one.
    fn arm(&mut self, delay_secs: u64) {
        self.cancel_timer();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            let _ = tx.send(Command::Expired(generation));
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    ///Publishes the will through the router, at most once per watchdog;
    ///failures are logged and never retried.
    async fn publish_will(&mut self) {
        if self.stopping {
            return;
        }
        let Some(will) = self.will.take() else {
            return;
        };
        let publish = Publish::from(will);
        log::debug!("{:?} publishing will, topic: {}", self.session.id, publish.topic);
        if let Err(e) =
            self.scx.router.publish(&self.session.id, publish, self.user_context.clone()).await
        {
            log::warn!("{:?} will publish failed, {:?}", self.session.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::router::Router as _;
    use crate::topic::TopicPath;
    use crate::types::{Id, QoS, Rx, Subscriber, SubscriptionOptions};

    fn session(client_id: &str) -> (SessionHandle, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(Id::new(client_id), tx), rx)
    }

    ///A mailbox subscribed to `filter`, to observe will publications
    ///end-to-end through the router.
    async fn observer(scx: &PoolContext, filter: &str) -> (SessionHandle, Rx) {
        let (s, rx) = session("observer");
        scx.router
            .subscribe(filter, Subscriber::Mailbox(s.tx.clone()), s.clone(), SubscriptionOptions::default())
            .await
            .unwrap();
        (s, rx)
    }

    fn will(topic: &str, payload: &'static str) -> LastWill {
        LastWill::new(TopicPath::from_str(topic).unwrap(), payload)
    }

    fn recv_publish(rx: &mut Rx) -> Option<Box<crate::types::Envelope>> {
        match rx.try_recv() {
            Ok(Message::Forward(env)) => Some(env),
            _ => None,
        }
    }

    fn recv_close(rx: &mut Rx) -> Option<Reason> {
        while let Ok(msg) = rx.try_recv() {
            if let Message::Close(reason) = msg {
                return Some(reason);
            }
        }
        None
    }

    async fn pass(secs: u64) {
        //virtual time; the runtime is paused in these tests
        tokio::time::sleep(Duration::from_secs(secs)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_expiry_kills_a_stalled_session() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "#").await;
        let (s, mut srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        pass(21).await;

        assert_eq!(recv_close(&mut srx), Some(Reason::ConnectTimeout));
        assert!(recv_publish(&mut obs_rx).is_none());
        assert!(!w.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_disconnect_without_will() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "#").await;
        let (s, mut srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        w.connected(None, 60, null_context());
        pass(1).await;
        w.disconnected();
        pass(61).await;

        assert_eq!(recv_close(&mut srx), Some(Reason::SessionExpired));
        assert!(recv_publish(&mut obs_rx).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn will_published_on_session_crash() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "a/b").await;
        let (s, srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("a/b", "bye");
        lw.qos = QoS::AtLeastOnce;
        w.connected(Some(lw), 300, null_context());
        pass(1).await;

        //abnormal termination: the session task drops its mailbox
        drop(srx);
        pass(1).await;

        let env = recv_publish(&mut obs_rx).expect("will must be published on crash");
        assert_eq!(env.publish.topic.to_string(), "a/b");
        assert_eq!(env.publish.payload.as_ref(), b"bye");
        assert_eq!(env.publish.qos, QoS::AtLeastOnce);
        assert!(!env.publish.retain);
        assert!(env.publish.properties.is_empty());
        assert!(!w.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn will_delay_beats_session_expiry() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, mut srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 10;
        w.connected(Some(lw), 30, null_context());
        pass(1).await;
        w.disconnected_with(true, None);

        pass(9).await;
        assert!(recv_publish(&mut obs_rx).is_none());

        pass(2).await;
        let env = recv_publish(&mut obs_rx).expect("will published at the will-delay");
        assert_eq!(env.publish.payload.as_ref(), b"x");
        assert_eq!(recv_close(&mut srx), Some(Reason::SessionExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_the_pending_will() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, _srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 10;
        w.connected(Some(lw), 30, null_context());
        pass(1).await;
        w.disconnected_with(true, None);

        pass(5).await;
        w.reconnected();

        pass(15).await;
        assert!(recv_publish(&mut obs_rx).is_none());
        assert!(w.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_delay_capped_by_will_delay() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, _srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 7;
        w.connected(Some(lw), 300, null_context());
        pass(1).await;

        //min(D, w) = min(30, 7) = 7
        w.disconnected_with(true, Some(30));
        pass(6).await;
        assert!(recv_publish(&mut obs_rx).is_none());
        pass(2).await;
        assert!(recv_publish(&mut obs_rx).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_without_will_keeps_the_remembered_delay() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, mut srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 5;
        w.connected(Some(lw), 300, null_context());
        pass(1).await;

        //will cleared, but the timer still runs on the former will's delay
        w.disconnected_with(false, None);
        pass(6).await;

        assert_eq!(recv_close(&mut srx), Some(Reason::SessionExpired));
        assert!(recv_publish(&mut obs_rx).is_none());
        assert!(!w.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_supersedes_the_prior_timer() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, _srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 3;
        w.connected(Some(lw), 300, null_context());
        pass(1).await;

        w.disconnected_with(true, None);
        pass(2).await;
        //rearm before the first timer fires; only the newest generation counts
        w.disconnected_with(true, Some(10));
        pass(2).await;
        assert!(recv_publish(&mut obs_rx).is_none());

        pass(2).await;
        assert!(recv_publish(&mut obs_rx).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_any_publication() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        let mut lw = will("t", "x");
        lw.delay_interval = 1;
        w.connected(Some(lw), 300, null_context());
        pass(1).await;
        w.disconnected();

        w.stop().await.unwrap();
        //neither the timer nor the session going away publishes now
        drop(srx);
        pass(5).await;
        assert!(recv_publish(&mut obs_rx).is_none());
        assert!(!w.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn reauth_context_travels_with_the_will() {
        let scx = PoolContext::new("default").build();
        let (_obs, mut obs_rx) = observer(&scx, "t").await;
        let (s, srx) = session("c1");
        let w = WillWatchdog::spawn(scx.clone(), s.clone());

        w.connected(Some(will("t", "x")), 300, null_context());
        pass(1).await;
        let ctx: UserContext = std::sync::Arc::new(serde_json::json!({"user": "u2"}));
        w.set_user_context(ctx);
        pass(1).await;

        drop(srx);
        pass(1).await;

        let env = recv_publish(&mut obs_rx).unwrap();
        assert_eq!(env.publisher_context.as_ref()["user"], "u2");
    }
}
