// =============================================================================
// Ingestion Controller - selection state machine and closed-candle pipeline
// =============================================================================
//
// Owns the active key, its accumulated series and the single live
// StreamConnection. Two event sources drive it, both consumed on one task:
//   1. Selection commands (instrument / resolution changes, shutdown).
//   2. Stream events tagged with the id of the connection that produced them.
//
// A key switch closes the old connection, loads the new key's series from the
// store, swaps it into the accumulator and opens a fresh connection with a new
// id. Any event still in flight from an older connection carries a stale id
// and is dropped on arrival.
//
// Every closed candle is appended, saved, and published on a watch channel
// for the rendering side. Unclosed (intra-interval) updates are ignored.
// When the stored record for the active key cannot be read, candles are held
// in memory and merged behind the stored ones once a read succeeds.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::diagnostics::Diagnostics;
use crate::error::IngestError;
use crate::market_data::kline_stream::RawIntervalEvent;
use crate::market_data::{
    CandleAccumulator, ReconnectPolicy, Series, StreamConnection, StreamEvent, StreamEventKind,
    Transport,
};
use crate::runtime_config::RuntimeConfig;
use crate::series_store::SeriesStore;
use crate::types::SeriesKey;

/// Selection inputs from the UI side.
#[derive(Debug, Clone)]
pub enum Command {
    SetInstrument(String),
    SetResolution(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribed(SeriesKey),
}

/// What the rendering side sees: the active key and its full series.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub series: Series,
    /// Bumped on every publish.
    pub version: u64,
}

pub struct IngestionController<T: Transport> {
    feed_base_url: String,
    reconnect: ReconnectPolicy,
    transport: Arc<T>,

    store: SeriesStore,
    accumulator: CandleAccumulator,
    /// False while the stored record for the active key is unreadable.
    store_readable: bool,

    connection: Option<StreamConnection>,
    next_connection_id: u64,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,

    snapshots: watch::Sender<SeriesSnapshot>,
    version: u64,
    diagnostics: Arc<Diagnostics>,
}

impl<T: Transport> IngestionController<T> {
    /// Enter `Subscribed(default key)`: load whatever is stored for the
    /// configured default key and open its stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &RuntimeConfig,
        store: SeriesStore,
        transport: Arc<T>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let key = config.default_key();
        let (series, store_readable) = load_series(&store, &key);
        info!(key = %key, len = series.len(), "starting ingestion");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(SeriesSnapshot {
            key: key.clone(),
            series: series.clone(),
            version: 0,
        });

        let mut controller = Self {
            feed_base_url: config.feed_base_url.clone(),
            reconnect: config.reconnect_policy(),
            transport,
            store,
            accumulator: CandleAccumulator::new(key.clone(), series),
            store_readable,
            connection: None,
            next_connection_id: 1,
            events_tx,
            events_rx,
            snapshots,
            version: 0,
            diagnostics,
        };
        controller.open_connection(key);
        controller
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        match &self.connection {
            Some(conn) if conn.is_open() => ConnectionState::Subscribed(conn.key().clone()),
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn active_key(&self) -> &SeriesKey {
        self.accumulator.key()
    }

    pub fn series(&self) -> &Series {
        self.accumulator.series()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(StreamConnection::id)
    }

    /// Receiver that sees a new snapshot after every append and key switch.
    pub fn subscribe(&self) -> watch::Receiver<SeriesSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    pub fn set_instrument(&mut self, symbol: &str) -> Result<(), IngestError> {
        let key = self.active_key().with_instrument(symbol)?;
        self.select(key);
        Ok(())
    }

    pub fn set_resolution(&mut self, resolution: &str) -> Result<(), IngestError> {
        let key = self.active_key().with_resolution(resolution.parse()?);
        self.select(key);
        Ok(())
    }

    /// Switch to `key`. Selecting the key that is already subscribed is a
    /// no-op.
    pub fn select(&mut self, key: SeriesKey) {
        if self.state() == ConnectionState::Subscribed(key.clone()) {
            debug!(key = %key, "key already active");
            return;
        }

        if let Some(mut old) = self.connection.take() {
            old.close();
        }

        let (series, store_readable) = load_series(&self.store, &key);
        info!(
            from = %self.active_key(),
            to = %key,
            len = series.len(),
            "switching series"
        );
        self.accumulator.reset(key.clone(), series);
        self.store_readable = store_readable;
        self.open_connection(key);
        self.publish(self.accumulator.series().clone());
    }

    fn open_connection(&mut self, key: SeriesKey) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connection = Some(StreamConnection::open(
            id,
            key,
            &self.feed_base_url,
            self.transport.clone(),
            self.reconnect.clone(),
            self.events_tx.clone(),
        ));
    }

    // -------------------------------------------------------------------------
    // Stream events
    // -------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: StreamEvent) {
        if self.connection_id() != Some(event.connection_id) {
            self.diagnostics.stale_event();
            debug!(connection_id = event.connection_id, "dropping event from closed connection");
            return;
        }

        match event.kind {
            StreamEventKind::Connected => {
                info!(key = %self.active_key(), "kline stream live");
            }
            StreamEventKind::Interval(raw) => {
                self.diagnostics.message_received();
                self.on_interval(raw);
            }
            StreamEventKind::Malformed(e) => {
                self.diagnostics.message_received();
                warn!(key = %self.active_key(), error = %e, "dropping malformed kline message");
                self.diagnostics.record(&e);
            }
            StreamEventKind::Disconnected(e) => {
                warn!(key = %self.active_key(), error = %e, "kline stream disconnected");
                self.diagnostics.record(&e);
            }
        }
    }

    fn on_interval(&mut self, raw: RawIntervalEvent) {
        if !raw.is_closed {
            self.diagnostics.unclosed_ignored();
            return;
        }

        if let Err(e) = self.check_event_key(&raw) {
            warn!(key = %self.active_key(), error = %e, "dropping kline for another key");
            self.diagnostics.record(&e);
            return;
        }

        let candle = match raw.to_candle() {
            Ok(candle) => candle,
            Err(e) => {
                warn!(key = %self.active_key(), error = %e, "dropping unparseable closed kline");
                self.diagnostics.record(&e);
                return;
            }
        };

        let len = self.accumulator.append(&candle).len();
        self.diagnostics.candle_appended();
        info!(
            key = %self.active_key(),
            time = %candle.label(),
            open = candle.open(),
            high = candle.high(),
            low = candle.low(),
            close = candle.close(),
            len,
            "closed candle appended"
        );

        self.persist();
        self.publish(self.accumulator.series().clone());
    }

    /// Save the active series. If its stored record could not be read, read
    /// it again first and merge; while it stays unreadable nothing is written,
    /// so the stored candles are never replaced by a shorter series.
    fn persist(&mut self) {
        if !self.store_readable {
            match self.store.load(self.accumulator.key()) {
                Ok(stored) => {
                    info!(
                        key = %self.active_key(),
                        stored = stored.len(),
                        held = self.series().len(),
                        "stored series readable again, merging"
                    );
                    self.accumulator.rebase(stored);
                    self.store_readable = true;
                }
                Err(_) => {
                    warn!(
                        key = %self.active_key(),
                        held = self.series().len(),
                        "stored series unreadable, holding candles in memory"
                    );
                    return;
                }
            }
        }

        if let Err(e) = self.store.save(self.accumulator.key(), self.accumulator.series()) {
            error!(key = %self.active_key(), error = %e, "failed to persist series");
            self.diagnostics.record(&e);
        }
    }

    /// Symbol and interval are optional in the payload; when present they
    /// must match the active key.
    fn check_event_key(&self, raw: &RawIntervalEvent) -> Result<(), IngestError> {
        let key = self.active_key();
        if let Some(symbol) = &raw.symbol {
            if !symbol.eq_ignore_ascii_case(key.instrument()) {
                return Err(IngestError::MalformedMessage(format!(
                    "symbol {symbol} does not match {key}"
                )));
            }
        }
        if let Some(interval) = &raw.interval {
            if interval != key.resolution().as_str() {
                return Err(IngestError::MalformedMessage(format!(
                    "interval {interval} does not match {key}"
                )));
            }
        }
        Ok(())
    }

    fn publish(&mut self, series: Series) {
        self.version += 1;
        self.snapshots.send_replace(SeriesSnapshot {
            key: self.accumulator.key().clone(),
            series,
            version: self.version,
        });
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    fn apply(&mut self, command: Command) {
        let result = match command {
            Command::SetInstrument(symbol) => self.set_instrument(&symbol),
            Command::SetResolution(resolution) => self.set_resolution(&resolution),
            Command::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "selection rejected");
            self.diagnostics.record(&e);
        }
    }

    /// Drive the controller until `Shutdown` arrives or every command sender
    /// is dropped. Commands take priority over queued stream events.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.shutdown();
    }

    /// Close the active stream. Further stream events are ignored.
    pub fn shutdown(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        info!(key = %self.active_key(), len = self.series().len(), "ingestion stopped");
    }

    #[cfg(test)]
    async fn process_next(&mut self) {
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), self.events_rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("event channel closed");
        self.handle_event(event);
    }
}

/// The stored series for `key` and whether its record was readable. A failed
/// read starts from an empty series that must not be saved over the record.
fn load_series(store: &SeriesStore, key: &SeriesKey) -> (Series, bool) {
    match store.load(key) {
        Ok(series) => (series, true),
        Err(_) => (Series::new(), false),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::market_data::mock_transport::MockTransport;
    use crate::series_store::{DirStorage, MemoryStorage, Storage};

    fn kline(symbol: &str, t: i64, o: &str, h: &str, l: &str, c: &str, closed: bool) -> String {
        format!(
            r#"{{"e":"kline","s":"{}","k":{{"t":{t},"i":"1m","o":"{o}","h":"{h}","l":"{l}","c":"{c}","x":{closed}}}}}"#,
            symbol.to_uppercase()
        )
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            feed_base_url: "wss://feed/ws".into(),
            reconnect_enabled: false,
            ..RuntimeConfig::default()
        }
    }

    fn controller_with(
        storage: Arc<dyn Storage>,
        transport: Arc<MockTransport>,
    ) -> IngestionController<MockTransport> {
        let diagnostics = Arc::new(Diagnostics::new(20));
        let store = SeriesStore::new(storage, diagnostics.clone());
        IngestionController::start(&test_config(), store, transport, diagnostics)
    }

    /// Memory backend whose first reads and writes fail.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        read_failures: AtomicUsize,
        write_failures: AtomicUsize,
    }

    impl FlakyStorage {
        fn failing(reads: usize, writes: usize) -> Self {
            Self {
                read_failures: AtomicUsize::new(reads),
                write_failures: AtomicUsize::new(writes),
                ..Self::default()
            }
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn stored(&self, name: &str) -> Series {
            let raw = self.inner.read(name).unwrap().expect("record missing");
            Series::from_record(serde_json::from_slice(&raw).unwrap()).unwrap()
        }
    }

    impl Storage for FlakyStorage {
        fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
            if Self::take_failure(&self.read_failures) {
                anyhow::bail!("read of {name} timed out");
            }
            self.inner.read(name)
        }

        fn write(&self, name: &str, value: &str) -> anyhow::Result<()> {
            if Self::take_failure(&self.write_failures) {
                anyhow::bail!("no space left writing {name}");
            }
            self.inner.write(name, value)
        }
    }

    /// Connects happen on the spawned stream task; wait until `n` were made.
    async fn wait_for_urls(transport: &MockTransport, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let urls = transport.urls();
                if urls.len() >= n {
                    return urls;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for connects")
    }

    #[tokio::test]
    async fn end_to_end_switch_and_restore() {
        let transport = Arc::new(MockTransport::new());
        let eth = transport.push_session();
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport.clone());
        assert_eq!(ctl.state(), ConnectionState::Subscribed(SeriesKey::parse("ethusdt", "1m").unwrap()));

        ctl.process_next().await; // connected
        eth.send(kline("ethusdt", 1000, "10", "12", "9", "11", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().opens(), &[10.0]);
        assert_eq!(ctl.series().highs(), &[12.0]);
        assert_eq!(ctl.series().lows(), &[9.0]);
        assert_eq!(ctl.series().closes(), &[11.0]);

        eth.send(kline("ethusdt", 1000, "10", "13", "9", "12", false)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().len(), 1);
        assert_eq!(ctl.series().closes(), &[11.0]);

        let bnb = transport.push_session();
        ctl.set_instrument("BNBUSDT").unwrap();
        assert_eq!(ctl.active_key().instrument(), "bnbusdt");
        assert!(ctl.series().is_empty());
        ctl.process_next().await;
        bnb.send(kline("bnbusdt", 60_000, "300", "301", "299", "300.5", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().closes(), &[300.5]);

        transport.push_session();
        ctl.set_instrument("ethusdt").unwrap();
        assert_eq!(ctl.series().opens(), &[10.0]);
        assert_eq!(ctl.series().closes(), &[11.0]);

        assert_eq!(
            wait_for_urls(&transport, 3).await,
            vec![
                "wss://feed/ws/ethusdt@kline_1m".to_string(),
                "wss://feed/ws/bnbusdt@kline_1m".to_string(),
                "wss://feed/ws/ethusdt@kline_1m".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn closed_candles_append_in_arrival_order() {
        let transport = Arc::new(MockTransport::new());
        let feed = transport.push_session();
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport);
        ctl.process_next().await;

        for i in 0..10 {
            let close = format!("{}", 100 + i);
            feed.send(kline("ethusdt", i * 60_000, "100", "200", "50", &close, true)).unwrap();
            feed.send(kline("ethusdt", i * 60_000, "100", "200", "50", "1", false)).unwrap();
        }
        for _ in 0..20 {
            ctl.process_next().await;
        }

        let series = ctl.series();
        assert_eq!(series.len(), 10);
        assert_eq!(series.labels().len(), 10);
        assert_eq!(series.opens().len(), 10);
        let expected: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert_eq!(series.closes(), expected.as_slice());
        assert_eq!(series.labels()[1], "00:01:00");

        let counters = ctl.diagnostics().counters();
        assert_eq!(counters.candles_appended, 10);
        assert_eq!(counters.unclosed_ignored, 10);
    }

    #[tokio::test]
    async fn stale_events_are_ignored_after_switch() {
        let transport = Arc::new(MockTransport::new());
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport);
        let old_id = ctl.connection_id().unwrap();

        ctl.set_instrument("bnbusdt").unwrap();
        assert_ne!(ctl.connection_id(), Some(old_id));

        let raw = crate::market_data::kline_stream::parse_kline_message(&kline(
            "ethusdt", 0, "1", "1", "1", "1", true,
        ))
        .unwrap();
        ctl.handle_event(StreamEvent {
            connection_id: old_id,
            kind: StreamEventKind::Interval(raw),
        });

        assert!(ctl.series().is_empty());
        assert_eq!(ctl.diagnostics().counters().stale_events, 1);

        ctl.set_instrument("ethusdt").unwrap();
        assert!(ctl.series().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_foreign_messages_are_dropped() {
        let transport = Arc::new(MockTransport::new());
        let feed = transport.push_session();
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport);
        ctl.process_next().await;

        feed.send("{\"k\":{}}".to_string()).unwrap();
        feed.send(kline("ethusdt", 0, "abc", "1", "1", "1", true)).unwrap();
        feed.send(kline("btcusdt", 0, "1", "1", "1", "1", true)).unwrap();
        feed.send(kline("ethusdt", 0, "1", "2", "0.5", "1.5", true)).unwrap();
        for _ in 0..4 {
            ctl.process_next().await;
        }

        assert_eq!(ctl.series().closes(), &[1.5]);
        let counters = ctl.diagnostics().counters();
        assert_eq!(counters.messages_received, 4);
        assert_eq!(counters.messages_dropped, 3);
        assert!(ctl
            .diagnostics()
            .recent_errors()
            .iter()
            .all(|r| r.kind == "malformed_message"));
    }

    #[tokio::test]
    async fn resolution_change_is_a_key_change() {
        let transport = Arc::new(MockTransport::new());
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport.clone());

        ctl.set_resolution("5m").unwrap();
        assert_eq!(ctl.active_key().to_string(), "ethusdt@5m");
        assert_eq!(ctl.connection_id(), Some(2));
        let urls = wait_for_urls(&transport, 1).await;
        assert_eq!(urls.last().unwrap(), "wss://feed/ws/ethusdt@kline_5m");

        ctl.set_resolution("5M").unwrap();
        assert_eq!(ctl.connection_id(), Some(2));
    }

    #[tokio::test]
    async fn invalid_selection_leaves_state_untouched() {
        let transport = Arc::new(MockTransport::new());
        let mut ctl = controller_with(Arc::new(MemoryStorage::new()), transport);

        assert!(ctl.set_instrument("  ").is_err());
        assert!(ctl.set_resolution("2m").is_err());
        assert_eq!(ctl.active_key().to_string(), "ethusdt@1m");
        assert_eq!(ctl.connection_id(), Some(1));
    }

    #[tokio::test]
    async fn startup_restores_persisted_series() {
        let dir = tempfile::tempdir().unwrap();
        {
            let transport = Arc::new(MockTransport::new());
            let feed = transport.push_session();
            let storage = Arc::new(DirStorage::open(dir.path()).unwrap());
            let mut ctl = controller_with(storage, transport);
            ctl.process_next().await;
            feed.send(kline("ethusdt", 0, "10", "12", "9", "11", true)).unwrap();
            feed.send(kline("ethusdt", 60_000, "11", "13", "10", "12", true)).unwrap();
            ctl.process_next().await;
            ctl.process_next().await;
            ctl.shutdown();
            assert_eq!(ctl.state(), ConnectionState::Disconnected);
        }

        let storage = Arc::new(DirStorage::open(dir.path()).unwrap());
        let ctl = controller_with(storage, Arc::new(MockTransport::new()));
        assert_eq!(ctl.series().closes(), &[11.0, 12.0]);
        assert_eq!(ctl.series().labels(), &["00:00:00".to_string(), "00:01:00".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_store_degrades_to_empty_on_switch() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .write("bnbusdt_1m", r#"{"open":[1,2],"high":[1],"low":[1],"close":[1]}"#)
            .unwrap();
        let mut ctl = controller_with(storage.clone(), Arc::new(MockTransport::new()));

        ctl.set_instrument("bnbusdt").unwrap();
        assert!(ctl.series().is_empty());
        assert_eq!(
            storage.read("bnbusdt_1m").unwrap().as_deref(),
            Some(r#"{"open":[],"high":[],"low":[],"close":[],"labels":[]}"#.as_bytes())
        );
        assert_eq!(ctl.diagnostics().recent_errors()[0].kind, "corrupt_persistence");
    }

    #[tokio::test]
    async fn run_loop_publishes_snapshots_and_stops() {
        let transport = Arc::new(MockTransport::new());
        let feed = transport.push_session();
        transport.push_session();
        let ctl = controller_with(Arc::new(MemoryStorage::new()), transport);
        let mut snapshots = ctl.subscribe();
        assert_eq!(snapshots.borrow().version, 0);

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(ctl.run(rx));

        feed.send(kline("ethusdt", 0, "10", "12", "9", "11", true)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), snapshots.changed())
            .await
            .unwrap()
            .unwrap();
        {
            let snap = snapshots.borrow_and_update();
            assert_eq!(snap.version, 1);
            assert_eq!(snap.series.closes(), &[11.0]);
        }

        tx.send(Command::SetInstrument("dotusdt".into())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), snapshots.changed())
            .await
            .unwrap()
            .unwrap();
        {
            let snap = snapshots.borrow_and_update();
            assert_eq!(snap.key.to_string(), "dotusdt@1m");
            assert!(snap.series.is_empty());
        }

        tx.send(Command::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unreadable_record_is_never_truncated() {
        let storage = Arc::new(FlakyStorage::failing(2, 0));
        storage
            .inner
            .write(
                "ethusdt_1m",
                r#"{"open":[1,2,3],"high":[1,2,3],"low":[1,2,3],"close":[1,2,3],"labels":["a","b","c"]}"#,
            )
            .unwrap();
        let transport = Arc::new(MockTransport::new());
        let feed = transport.push_session();
        let mut ctl = controller_with(storage.clone(), transport);
        assert!(ctl.series().is_empty());
        ctl.process_next().await;

        // Second read still fails: the candle is held and nothing is written.
        feed.send(kline("ethusdt", 0, "9", "9", "9", "9", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().closes(), &[9.0]);
        assert_eq!(storage.stored("ethusdt_1m").closes(), &[1.0, 2.0, 3.0]);

        // Third read succeeds: stored candles come first, then the held ones.
        feed.send(kline("ethusdt", 60_000, "10", "10", "10", "10", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().closes(), &[1.0, 2.0, 3.0, 9.0, 10.0]);
        let stored = storage.stored("ethusdt_1m");
        assert_eq!(stored.closes(), &[1.0, 2.0, 3.0, 9.0, 10.0]);
        assert_eq!(stored.labels()[..4], ["a", "b", "c", "00:00:00"]);

        let kinds: Vec<_> = ctl.diagnostics().recent_errors().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec!["storage", "storage"]);
    }

    #[tokio::test]
    async fn failed_save_keeps_candle_and_next_save_catches_up() {
        let storage = Arc::new(FlakyStorage::failing(0, 1));
        let transport = Arc::new(MockTransport::new());
        let feed = transport.push_session();
        let mut ctl = controller_with(storage.clone(), transport);
        ctl.process_next().await;

        feed.send(kline("ethusdt", 0, "10", "12", "9", "11", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().len(), 1);
        assert!(storage.inner.read("ethusdt_1m").unwrap().is_none());
        let errors = ctl.diagnostics().recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "storage");

        feed.send(kline("ethusdt", 60_000, "11", "13", "10", "12", true)).unwrap();
        ctl.process_next().await;
        assert_eq!(ctl.series().len(), 2);
        assert_eq!(storage.stored("ethusdt_1m").closes(), &[11.0, 12.0]);
    }
}
