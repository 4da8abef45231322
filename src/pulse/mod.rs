//! Native audio context
//!
//! [`Context`] owns the connection to the audio backend and turns its
//! callback protocol into blocking calls. Requests go out under the backend
//! lock; replies and notifications come back through the delivery queue,
//! which a single drain thread consumes in order:
//!
//! ```text
//!  caller thread                 backend thread            drain thread
//!  ─────────────                 ──────────────            ────────────
//!  create cookie
//!  safe_do(request) ───────────▶ issue native call
//!  wait on cookie                    │ callbacks
//!       ▲                            ▼
//!       │                      Delivery queue ──────────▶ CookieJar / Dispatcher
//!       └──────────────── one-shot completion ◀────────────────┘
//! ```

pub mod backend;
pub mod cookie;
pub mod dispatch;
pub mod memory;
#[cfg(feature = "pulse")]
pub mod native;
pub mod types;

pub use backend::{delivery_channel, Backend, Delivery, DeliverySender, Query, ReplyStatus};
pub use cookie::{Cookie, CookieId, CookieJar, ReplyError};
pub use dispatch::{Dispatcher, Handler};
pub use memory::MemoryBackend;
pub use types::*;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::QueryError;

/// Releases the backend lock when dropped
struct BackendLock<'a> {
    backend: &'a dyn Backend,
}

impl<'a> BackendLock<'a> {
    fn acquire(backend: &'a dyn Backend) -> Self {
        backend.lock();
        Self { backend }
    }
}

impl Drop for BackendLock<'_> {
    fn drop(&mut self) {
        self.backend.unlock();
    }
}

/// Connection to the native audio backend
pub struct Context {
    backend: Arc<dyn Backend>,
    lock: Mutex<()>,
    cookies: Arc<CookieJar>,
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
    disconnected: watch::Receiver<Option<String>>,
}

impl Context {
    /// Start a context over `backend`, draining `deliveries` on a dedicated
    /// thread. Notification handlers run on `runtime`.
    pub fn new(
        backend: Arc<dyn Backend>,
        deliveries: Receiver<Delivery>,
        runtime: Handle,
        timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let cookies = CookieJar::new();
        let dispatcher = Arc::new(Dispatcher::new(runtime));
        let (disconnect_tx, disconnected) = watch::channel(None);

        // Exits once every DeliverySender is gone
        {
            let cookies = Arc::clone(&cookies);
            let dispatcher = Arc::clone(&dispatcher);
            thread::Builder::new()
                .name("audio-delivery".to_string())
                .spawn(move || {
                    drain_deliveries(deliveries, &cookies, &dispatcher, &disconnect_tx)
                })?;
        }

        Ok(Arc::new(Self {
            backend,
            lock: Mutex::new(()),
            cookies,
            dispatcher,
            timeout,
            disconnected,
        }))
    }

    /// Run `f` against the backend with the context lock and the backend
    /// lock held. Both are released on every exit path, unwinding included.
    pub fn safe_do<R>(&self, f: impl FnOnce(&dyn Backend) -> R) -> R {
        let _guard = self.lock.lock();
        let _backend = BackendLock::acquire(self.backend.as_ref());
        f(self.backend.as_ref())
    }

    /// Register a notification handler
    pub fn connect<F>(&self, facility: Facility, handler: F)
    where
        F: Fn(EventKind, u32) + Send + Sync + 'static,
    {
        self.dispatcher.connect(facility, handler);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Requests still waiting for a terminal reply
    pub fn pending_requests(&self) -> usize {
        self.cookies.pending()
    }

    /// Resolves with the reason once the backend reports connection loss
    pub async fn disconnected(&self) -> String {
        let mut rx = self.disconnected.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "delivery thread stopped".to_string();
            }
        }
    }

    pub fn get_card_list(&self) -> Vec<Card> {
        self.list(Query::CardList, InfoItem::into_card)
    }

    pub fn get_card(&self, index: u32) -> Result<Card, QueryError> {
        self.single(Query::Card(index), InfoItem::into_card)
    }

    pub fn get_sink_list(&self) -> Vec<Sink> {
        self.list(Query::SinkList, InfoItem::into_sink)
    }

    pub fn get_sink(&self, index: u32) -> Result<Sink, QueryError> {
        self.single(Query::Sink(index), InfoItem::into_sink)
    }

    pub fn get_source_list(&self) -> Vec<Source> {
        self.list(Query::SourceList, InfoItem::into_source)
    }

    pub fn get_source(&self, index: u32) -> Result<Source, QueryError> {
        self.single(Query::Source(index), InfoItem::into_source)
    }

    pub fn get_sink_input_list(&self) -> Vec<SinkInput> {
        self.list(Query::SinkInputList, InfoItem::into_sink_input)
    }

    pub fn get_sink_input(&self, index: u32) -> Result<SinkInput, QueryError> {
        self.single(Query::SinkInput(index), InfoItem::into_sink_input)
    }

    pub fn get_source_output_list(&self) -> Vec<SourceOutput> {
        self.list(Query::SourceOutputList, InfoItem::into_source_output)
    }

    pub fn get_source_output(&self, index: u32) -> Result<SourceOutput, QueryError> {
        self.single(Query::SourceOutput(index), InfoItem::into_source_output)
    }

    pub fn get_server(&self) -> Result<Server, QueryError> {
        self.single(Query::Server, InfoItem::into_server)
    }

    pub fn set_default_sink(&self, name: &str) {
        self.safe_do(|backend| backend.set_default_sink(name));
    }

    pub fn set_default_source(&self, name: &str) {
        self.safe_do(|backend| backend.set_default_source(name));
    }

    pub fn set_card_profile(&self, card: u32, profile: &str) {
        self.safe_do(|backend| backend.set_card_profile(card, profile));
    }

    pub fn set_sink_port(&self, sink: &str, port: &str) {
        self.safe_do(|backend| backend.set_sink_port(sink, port));
    }

    pub fn set_source_port(&self, source: &str, port: &str) {
        self.safe_do(|backend| backend.set_source_port(source, port));
    }

    pub fn set_sink_volume(&self, sink: &str, volume: f64) {
        self.safe_do(|backend| backend.set_sink_volume(sink, volume));
    }

    pub fn set_source_volume(&self, source: &str, volume: f64) {
        self.safe_do(|backend| backend.set_source_volume(source, volume));
    }

    /// Issue `query` and wait for all of its items
    fn request(&self, query: Query) -> Result<Vec<InfoItem>, QueryError> {
        let cookie = self.cookies.create();
        let id = cookie.id();
        self.safe_do(|backend| backend.request(id, query))?;

        cookie.reply_list(self.timeout).map_err(|e| match e {
            ReplyError::Failed => QueryError::Failed(query.to_string()),
            ReplyError::Timeout => {
                QueryError::Timeout(query.to_string(), self.timeout.as_millis() as u64)
            }
        })
    }

    fn list<T>(&self, query: Query, project: fn(InfoItem) -> Option<T>) -> Vec<T> {
        match self.request(query) {
            Ok(items) => items.into_iter().filter_map(project).collect(),
            Err(e) => {
                tracing::warn!("Query {} failed: {}", query, e);
                Vec::new()
            }
        }
    }

    fn single<T>(&self, query: Query, project: fn(InfoItem) -> Option<T>) -> Result<T, QueryError> {
        self.request(query)?
            .into_iter()
            .find_map(project)
            .ok_or_else(|| QueryError::NotFound(query.to_string()))
    }
}

fn drain_deliveries(
    deliveries: Receiver<Delivery>,
    cookies: &CookieJar,
    dispatcher: &Dispatcher,
    disconnect_tx: &watch::Sender<Option<String>>,
) {
    for delivery in deliveries {
        match delivery {
            Delivery::Reply { cookie, status } => match status {
                ReplyStatus::Item(item) => cookies.feed(cookie, item),
                ReplyStatus::EndOfList => cookies.end_of_list(cookie),
                ReplyStatus::Failed => cookies.failed(cookie),
            },
            Delivery::Event(event) => {
                tracing::trace!("[Event] {} {:?} {}", event.facility, event.kind, event.index);
                dispatcher.dispatch(event);
            }
            Delivery::Disconnected(reason) => {
                tracing::error!("Audio backend disconnected: {}", reason);
                disconnect_tx.send_replace(Some(reason));
            }
        }
    }
    tracing::debug!("Delivery queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::memory::MemoryBackend;
    use std::time::Instant;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn context(rt: &tokio::runtime::Runtime, timeout: Duration) -> (Arc<MemoryBackend>, Arc<Context>) {
        let (tx, rx) = delivery_channel();
        let backend = Arc::new(MemoryBackend::with_builtin_card(tx));
        let ctx = Context::new(backend.clone(), rx, rt.handle().clone(), timeout).unwrap();
        (backend, ctx)
    }

    #[test]
    fn test_list_queries() {
        let rt = runtime();
        let (_backend, ctx) = context(&rt, Duration::from_secs(5));

        let cards = ctx.get_card_list();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].active_profile_name(), "analog-stereo");
        assert_eq!(ctx.get_sink_list().len(), 1);
        assert_eq!(ctx.get_source_list().len(), 1);
        assert!(ctx.get_sink_input_list().is_empty());
        assert!(ctx.get_source_output_list().is_empty());
        assert_eq!(ctx.pending_requests(), 0);
    }

    #[test]
    fn test_single_queries() {
        let rt = runtime();
        let (_backend, ctx) = context(&rt, Duration::from_secs(5));

        let card = ctx.get_card(0).unwrap();
        assert_eq!(card.name, "alsa_card.pci-0000_00_1f.3");
        assert_eq!(ctx.get_sink(0).unwrap().name, "alsa_output.analog-stereo");

        let server = ctx.get_server().unwrap();
        assert_eq!(
            server.default_sink_name.as_deref(),
            Some("alsa_output.analog-stereo")
        );

        assert_eq!(
            ctx.get_card(42),
            Err(QueryError::Failed("card 42".to_string()))
        );
        assert!(ctx.get_sink_input(3).is_err());
        assert_eq!(ctx.pending_requests(), 0);
    }

    #[test]
    fn test_failed_list_is_empty_and_prompt() {
        let rt = runtime();
        let (backend, ctx) = context(&rt, Duration::from_secs(5));

        backend.fail_requests(true);
        let start = Instant::now();
        assert!(ctx.get_card_list().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(ctx.pending_requests(), 0);
    }

    #[test]
    fn test_silent_backend_times_out() {
        let rt = runtime();
        let (backend, ctx) = context(&rt, Duration::from_millis(100));

        backend.drop_replies(true);
        assert_eq!(
            ctx.get_server(),
            Err(QueryError::Timeout("server info".to_string(), 100))
        );
        assert!(ctx.get_sink_list().is_empty());
        assert_eq!(ctx.pending_requests(), 0);

        backend.drop_replies(false);
        assert!(ctx.get_server().is_ok());
    }

    #[test]
    fn test_concurrent_queries() {
        let rt = runtime();
        let (_backend, ctx) = context(&rt, Duration::from_secs(5));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || (ctx.get_card_list().len(), ctx.get_sink_list().len()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (1, 1));
        }
        assert_eq!(ctx.pending_requests(), 0);
    }

    #[test]
    fn test_safe_do_releases_lock_on_panic() {
        let rt = runtime();
        let (backend, ctx) = context(&rt, Duration::from_secs(5));

        let ctx2 = Arc::clone(&ctx);
        let result = std::thread::spawn(move || {
            ctx2.safe_do(|_| panic!("boom"));
        })
        .join();
        assert!(result.is_err());
        assert!(!backend.is_locked());

        ctx.set_default_sink("alsa_output.analog-stereo");
        assert_eq!(ctx.get_card_list().len(), 1);
    }

    #[test]
    fn test_mutations_emit_events() {
        let rt = runtime();
        let (_backend, ctx) = context(&rt, Duration::from_secs(5));
        let (tx, rx) = crossbeam_channel::unbounded();

        ctx.connect(Facility::Card, move |kind, idx| {
            tx.send((kind, idx)).unwrap();
        });
        ctx.set_card_profile(0, "off");

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok((EventKind::Change, 0))
        );
        assert_eq!(ctx.get_card(0).unwrap().active_profile_name(), "off");
    }

    #[test]
    fn test_disconnect_is_reported() {
        let rt = runtime();
        let (backend, ctx) = context(&rt, Duration::from_secs(5));

        backend.disconnect("server went away");
        let reason = rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), ctx.disconnected()).await
        });
        assert_eq!(reason.unwrap(), "server went away");
    }
}
