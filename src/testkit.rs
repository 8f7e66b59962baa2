//! In-process fakes for the external collaborators, plus a fixture that
//! wires them into a [`PoolContext`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{HarvestConfig, PoolConfig};
use crate::discovery::{ProducerOutput, ProducerRunner};
use crate::engine::{EngineHandle, ProbeEngine, TestItem};
use crate::error::{EngineError, ProbeError, ProducerError, StoreError};
use crate::events::Notifier;
use crate::orchestrator::Collaborators;
use crate::pool::{ActiveSelection, PoolContext, Scoreboard, ServerScore};
use crate::probe::{ProbeClient, ProgressFn};
use crate::store::{ConfigType, MemoryServerStore, ScoreRepository, ServerRecord, ServerStore, SortColumn};

pub fn record(id: &str, port: u16) -> ServerRecord {
    ServerRecord {
        id: id.to_string(),
        address: format!("{id}.example"),
        port,
        config_type: ConfigType::Vless,
        remarks: id.to_string(),
        group_id: None,
        enabled: true,
        allow_test: true,
    }
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeEngine {
    fail: bool,
    next_pid: AtomicU32,
    starts: AtomicUsize,
    stops: AtomicUsize,
    running: Mutex<Vec<EngineHandle>>,
    batches: Mutex<Vec<Vec<TestItem>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self { next_pid: AtomicU32::new(1000), ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }

    pub fn running(&self) -> Vec<EngineHandle> {
        self.running.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<TestItem>> {
        self.batches.lock().unwrap().clone()
    }

    fn server_for_port(&self, port: u16) -> Option<String> {
        let batches = self.batches.lock().unwrap();
        batches
            .last()?
            .iter()
            .find(|i| i.local_port == port)
            .map(|i| i.server_id.clone())
    }
}

#[async_trait]
impl ProbeEngine for FakeEngine {
    async fn start_batch(&self, batch: &[TestItem]) -> Result<EngineHandle, EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::ExitedEarly("exit status: 1".into()));
        }
        let handle = EngineHandle(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.batches.lock().unwrap().push(batch.to_vec());
        self.running.lock().unwrap().push(handle);
        Ok(handle)
    }

    fn stop(&self, handle: EngineHandle) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().retain(|h| *h != handle);
    }
}

// ── Probe Client ────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Latency {
    Ok(u64),
    Fail,
    Panic,
}

/// Answers by server id, resolved from the proxy port through the
/// engine's latest batch. Unconfigured servers fail.
pub struct FakeProbe {
    engine: Arc<FakeEngine>,
    latency: Mutex<HashMap<String, Latency>>,
    speed: Mutex<HashMap<String, Result<f64, ()>>>,
    progress: Mutex<HashMap<String, Vec<f64>>>,
    delay: Mutex<Duration>,
    latency_calls: AtomicUsize,
    throughput_order: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeProbe {
    pub fn new(engine: Arc<FakeEngine>) -> Self {
        Self {
            engine,
            latency: Mutex::default(),
            speed: Mutex::default(),
            progress: Mutex::default(),
            delay: Mutex::new(Duration::ZERO),
            latency_calls: AtomicUsize::new(0),
            throughput_order: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_latency(&self, id: &str, ms: Option<u64>) {
        let outcome = ms.map_or(Latency::Fail, Latency::Ok);
        self.latency.lock().unwrap().insert(id.to_string(), outcome);
    }

    pub fn panic_on(&self, id: &str) {
        self.latency.lock().unwrap().insert(id.to_string(), Latency::Panic);
    }

    pub fn set_speed(&self, id: &str, speed: Result<f64, ()>) {
        self.speed.lock().unwrap().insert(id.to_string(), speed);
    }

    pub fn set_progress(&self, id: &str, readings: Vec<f64>) {
        self.progress.lock().unwrap().insert(id.to_string(), readings);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn latency_calls(&self) -> usize {
        self.latency_calls.load(Ordering::SeqCst)
    }

    pub fn throughput_order(&self) -> Vec<String> {
        self.throughput_order.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn resolve(&self, proxy: Option<SocketAddr>) -> String {
        proxy
            .and_then(|p| self.engine.server_for_port(p.port()))
            .unwrap_or_default()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProbeClient for FakeProbe {
    async fn measure_latency(
        &self,
        _url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<u64, ProbeError> {
        self.latency_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter();
        let id = self.resolve(proxy);
        self.pause().await;

        // Copied out so a scripted panic does not poison the map.
        let scripted = self.latency.lock().unwrap().get(&id).copied();
        let outcome = match scripted {
            Some(Latency::Ok(ms)) => Some(ms),
            Some(Latency::Panic) => panic!("probe for {id} panicked"),
            Some(Latency::Fail) | None => None,
        };
        outcome.ok_or(ProbeError::Timeout(timeout))
    }

    async fn measure_throughput(
        &self,
        _url: &str,
        proxy: Option<SocketAddr>,
        timeout: Duration,
        on_progress: ProgressFn<'_>,
    ) -> Result<f64, ProbeError> {
        let _guard = self.enter();
        let id = self.resolve(proxy);
        self.throughput_order.lock().unwrap().push(id.clone());
        self.pause().await;

        let readings = self.progress.lock().unwrap().get(&id).cloned().unwrap_or_default();
        for r in readings {
            on_progress(r);
        }
        let outcome = self.speed.lock().unwrap().get(&id).cloned();
        match outcome {
            Some(Ok(speed)) => Ok(speed),
            _ => Err(ProbeError::Timeout(timeout)),
        }
    }
}

// ── Producer Runner ─────────────────────────────────────────────────

#[derive(Clone)]
enum Scripted {
    Output(ProducerOutput),
    Timeout(Duration),
    SpawnFailure(String),
    Panic,
}

/// Answers by producer file name. Unknown names fail to spawn.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, Scripted>>,
    delay: Mutex<Duration>,
}

impl FakeRunner {
    pub fn set(&self, name: &str, result: Result<ProducerOutput, ProducerError>) {
        let scripted = match result {
            Ok(out) => Scripted::Output(out),
            Err(ProducerError::Timeout(d)) => Scripted::Timeout(d),
            Err(ProducerError::Spawn(e)) => Scripted::SpawnFailure(e.to_string()),
        };
        self.scripts.lock().unwrap().insert(name.to_string(), scripted);
    }

    pub fn panic_on(&self, name: &str) {
        self.scripts.lock().unwrap().insert(name.to_string(), Scripted::Panic);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ProducerRunner for FakeRunner {
    async fn invoke(&self, path: &Path) -> Result<ProducerOutput, ProducerError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let scripted = self.scripts.lock().unwrap().get(&name).cloned();
        match scripted {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Timeout(d)) => Err(ProducerError::Timeout(d)),
            Some(Scripted::SpawnFailure(msg)) => Err(ProducerError::Spawn(std::io::Error::other(msg))),
            Some(Scripted::Panic) => panic!("producer {name} panicked"),
            None => Err(ProducerError::Spawn(std::io::ErrorKind::NotFound.into())),
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// [`MemoryServerStore`] that records the calls made against it.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryServerStore,
    imported_lines: Mutex<Vec<String>>,
    remove_calls: AtomicUsize,
    set_active_calls: AtomicUsize,
    panic_on_remove: AtomicBool,
}

impl RecordingStore {
    pub fn inner(&self) -> &MemoryServerStore {
        &self.inner
    }

    pub fn imported_lines(&self) -> Vec<String> {
        self.imported_lines.lock().unwrap().clone()
    }

    pub fn panic_on_remove(&self) {
        self.panic_on_remove.store(true, Ordering::SeqCst);
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn set_active_calls(&self) -> usize {
        self.set_active_calls.load(Ordering::SeqCst)
    }
}

impl ServerStore for RecordingStore {
    fn eligible_servers(&self, predicate: &dyn Fn(&ServerRecord) -> bool) -> Vec<ServerRecord> {
        self.inner.eligible_servers(predicate)
    }

    fn get_server(&self, id: &str) -> Option<ServerRecord> {
        self.inner.get_server(id)
    }

    fn import_line(&self, line: &str, group_id: Option<&str>, is_sub: bool) -> Result<usize, StoreError> {
        self.imported_lines.lock().unwrap().push(line.to_string());
        self.inner.import_line(line, group_id, is_sub)
    }

    fn remove_servers(&self, servers: &[ServerRecord]) -> Result<(), StoreError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_remove.load(Ordering::SeqCst) {
            panic!("store exploded");
        }
        self.inner.remove_servers(servers)
    }

    fn set_active_server(&self, id: &str) -> Result<(), StoreError> {
        self.set_active_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_active_server(id)
    }

    fn active_server(&self) -> Option<String> {
        self.inner.active_server()
    }

    fn sort_servers(
        &self,
        column: SortColumn,
        ascending: bool,
        scores: &HashMap<String, ServerScore>,
    ) -> Result<(), StoreError> {
        self.inner.sort_servers(column, ascending, scores)
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

pub struct TestPool {
    pub ctx: PoolContext,
    pub store: Arc<RecordingStore>,
    pub engine: Arc<FakeEngine>,
    pub probe: Arc<FakeProbe>,
    pub runner: Arc<FakeRunner>,
    statuses: Arc<Mutex<Vec<(bool, String)>>>,
    _dir: tempfile::TempDir,
}

impl TestPool {
    pub fn new() -> Self {
        Self::build(PoolConfig::default(), FakeEngine::new())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::build(config, FakeEngine::new())
    }

    pub fn with_engine(engine: FakeEngine) -> Self {
        Self::build(PoolConfig::default(), engine)
    }

    fn build(mut config: PoolConfig, engine: FakeEngine) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.data_dir = dir.path().to_path_buf();
        if config.harvest.script_dir == HarvestConfig::default().script_dir {
            config.harvest.script_dir = dir.path().join("scripts");
            std::fs::create_dir_all(&config.harvest.script_dir).unwrap();
        }

        let store = Arc::new(RecordingStore::default());
        let engine = Arc::new(engine);
        let probe = Arc::new(FakeProbe::new(Arc::clone(&engine)));
        let runner = Arc::new(FakeRunner::default());
        let notifier = Notifier::new();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        notifier.set_status_callback(Arc::new(move |is_final, msg: &str| {
            sink.lock().unwrap().push((is_final, msg.to_string()));
        }));

        let ctx = PoolContext {
            config: Arc::new(config),
            store: store.clone(),
            engine: engine.clone(),
            probe: probe.clone(),
            runner: runner.clone(),
            repository: Arc::new(ScoreRepository::in_memory().unwrap()),
            scoreboard: Arc::new(Scoreboard::new()),
            active: Arc::new(ActiveSelection::new(None)),
            notifier,
        };
        Self { ctx, store, engine, probe, runner, statuses, _dir: dir }
    }

    /// Insert testable servers on port 443.
    pub fn add_servers(&self, ids: &[&str]) {
        for id in ids {
            self.store.inner().insert(record(id, 443));
        }
    }

    pub fn statuses(&self) -> Vec<(bool, String)> {
        self.statuses.lock().unwrap().clone()
    }

    /// The same fakes, for building an orchestrator.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            engine: self.engine.clone(),
            probe: self.probe.clone(),
            runner: self.runner.clone(),
            repository: Arc::clone(&self.ctx.repository),
        }
    }
}
