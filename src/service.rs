// Management service: producer-facing facade plus the single-worker
// dispatcher that serializes every store mutation
//
// Producers enqueue owned command records from any task; the dispatcher
// drains them kind-by-kind in fixed priority order and is the only writer
// of the store. Snapshot readers share the store through a read lock, so a
// header/window pair is never observed torn.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandKind, CommandQueue, ServiceError, PRIORITY_ORDER};
use crate::constants::{
    DEFAULT_POINT_CAPACITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_TRACK_CAPACITY, IDLE_WAIT_MS,
    SEED_POINT_COUNT, SHUTDOWN_GRACE_SECS,
};
use crate::net::TrackOutput;
use crate::store::{pack_snapshot, PushOutcome, TrackSnapshot, TrackStore};
use crate::types::{TrackHeader, TrackPoint};
use crate::visualize::Visualizer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Store lifecycle notifications for downstream consumers.
#[derive(Debug, Clone)]
pub enum TrackEvent {
    /// A track exceeded the extrapolation limit. The snapshot is the final
    /// window including the terminating point; the slot is already released.
    Terminated { id: u32, snapshot: TrackSnapshot },
    /// The whole store was cleared and the id counter reset.
    Cleared,
}

/// Monotonic counters observable by operators. Commands that cannot take
/// effect bump a counter in addition to their log entry.
#[derive(Debug, Default)]
pub struct ServiceCounters {
    pub sweeps: AtomicU64,
    pub commands_processed: AtomicU64,
    pub points_added: AtomicU64,
    pub tracks_created: AtomicU64,
    pub creates_failed: AtomicU64,
    pub tracks_terminated: AtomicU64,
    pub merges_applied: AtomicU64,
    pub merges_rejected: AtomicU64,
    pub unknown_track_pushes: AtomicU64,
    pub clears: AtomicU64,
}

/// Construction parameters for [`ManagementService::start`].
pub struct ServiceOptions {
    pub track_capacity: usize,
    pub point_capacity: usize,
    pub queue_capacity: usize,
    pub visualizers: Vec<Box<dyn Visualizer>>,
    pub outputs: Vec<Box<dyn TrackOutput>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            track_capacity: DEFAULT_TRACK_CAPACITY,
            point_capacity: DEFAULT_POINT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            visualizers: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// The single worker owning all store mutations.
struct Dispatcher {
    store: Arc<RwLock<TrackStore>>,
    queue: Arc<CommandQueue>,
    visualizers: Vec<Box<dyn Visualizer>>,
    outputs: Vec<Box<dyn TrackOutput>>,
    events: broadcast::Sender<TrackEvent>,
    counters: Arc<ServiceCounters>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("dispatcher started");
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let processed = self.sweep().await;
            self.refresh_visualizers().await;
            if processed == 0 {
                self.queue
                    .ready_timeout(Duration::from_millis(IDLE_WAIT_MS))
                    .await;
            }
        }
        self.drain_remaining().await;
        info!("dispatcher stopped");
    }

    /// One full priority sweep: drain and process every pending record of
    /// each kind, highest priority first, FIFO within a kind. Returns the
    /// number of records processed.
    async fn sweep(&mut self) -> usize {
        let mut processed = 0;
        for kind in PRIORITY_ORDER {
            for cmd in self.queue.drain_kind(kind) {
                self.handle_command(cmd).await;
                processed += 1;
            }
        }
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .commands_processed
            .fetch_add(processed as u64, Ordering::Relaxed);
        processed
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::DrawPoints(points) => {
                for viz in &mut self.visualizers {
                    viz.draw_points(&points);
                }
            }
            Command::Merge { source, target } => {
                let merged = self.store.write().await.merge(source, target);
                if merged {
                    self.counters.merges_applied.fetch_add(1, Ordering::Relaxed);
                    debug!(source, target, "tracks merged");
                } else {
                    self.counters.merges_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(source, target, "merge failed");
                }
            }
            Command::CreateTracks(groups) => {
                let mut store = self.store.write().await;
                for group in &groups {
                    match store.seed_track(group) {
                        Some(id) => {
                            self.counters.tracks_created.fetch_add(1, Ordering::Relaxed);
                            debug!(id, "track created");
                        }
                        None => {
                            self.counters.creates_failed.fetch_add(1, Ordering::Relaxed);
                            warn!("track creation failed (pool saturated or seeds terminated)");
                        }
                    }
                }
            }
            Command::AddPoints(updates) => {
                for (hint, point) in updates {
                    let outcome = self.store.write().await.push_point(hint.id, point);
                    match outcome {
                        PushOutcome::Ok => {
                            self.counters.points_added.fetch_add(1, Ordering::Relaxed);
                        }
                        PushOutcome::UnknownTrack => {
                            self.counters
                                .unknown_track_pushes
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(id = hint.id, "point for unknown track dropped");
                        }
                        PushOutcome::Terminated(snapshot) => {
                            self.counters
                                .tracks_terminated
                                .fetch_add(1, Ordering::Relaxed);
                            info!(id = hint.id, points = snapshot.points.len(), "track terminated");
                            let frame = pack_snapshot(&snapshot);
                            for output in &mut self.outputs {
                                output.emit(hint.id, &frame);
                            }
                            let _ = self.events.send(TrackEvent::Terminated {
                                id: hint.id,
                                snapshot,
                            });
                        }
                    }
                }
            }
            Command::ClearAll => {
                self.store.write().await.clear_all();
                self.counters.clears.fetch_add(1, Ordering::Relaxed);
                for viz in &mut self.visualizers {
                    viz.clear();
                }
                let _ = self.events.send(TrackEvent::Cleared);
                info!("store cleared");
            }
        }
    }

    /// Hand every visualizer a consistent snapshot of the live tracks.
    async fn refresh_visualizers(&mut self) {
        if self.visualizers.is_empty() {
            return;
        }
        let snapshots = self.store.read().await.snapshot_all();
        for viz in &mut self.visualizers {
            viz.draw_tracks(&snapshots);
        }
    }

    /// Best-effort drain of pending operator commands inside the shutdown
    /// grace window. Pipeline backlog (CreateTracks, AddPoints) is dropped.
    async fn drain_remaining(&mut self) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_SECS);
        let mut drained = 0usize;
        for kind in [CommandKind::Merge, CommandKind::ClearAll] {
            for cmd in self.queue.drain_kind(kind) {
                if tokio::time::Instant::now() >= deadline {
                    warn!("shutdown grace expired with operator commands pending");
                    return;
                }
                self.handle_command(cmd).await;
                drained += 1;
            }
        }
        if drained > 0 {
            info!(drained, "operator commands drained on shutdown");
        }
    }
}

/// Thread-safe producer facade over the command queue plus the read side of
/// the store. All enqueue methods copy caller data into owned records and
/// return without waiting for processing.
pub struct ManagementService {
    store: Arc<RwLock<TrackStore>>,
    queue: Arc<CommandQueue>,
    events: broadcast::Sender<TrackEvent>,
    counters: Arc<ServiceCounters>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ManagementService {
    /// Build the store and spawn the dispatcher worker. Must be called from
    /// within a tokio runtime.
    pub fn start(options: ServiceOptions) -> Self {
        let store = Arc::new(RwLock::new(TrackStore::new(
            options.track_capacity,
            options.point_capacity,
        )));
        let queue = Arc::new(CommandQueue::new(options.queue_capacity));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let counters = Arc::new(ServiceCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            store: store.clone(),
            queue: queue.clone(),
            visualizers: options.visualizers,
            outputs: options.outputs,
            events: events.clone(),
            counters: counters.clone(),
            stop: stop.clone(),
        };
        let worker = tokio::spawn(dispatcher.run());

        ManagementService {
            store,
            queue,
            events,
            counters,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    // --- Producer command API ---

    /// Forward raw detection points to the visualizer. Operator path:
    /// rejects with `QueueFull` instead of blocking.
    pub fn draw_points_command(&self, points: Vec<TrackPoint>) -> Result<(), ServiceError> {
        let points = Self::retain_valid(points);
        if points.is_empty() {
            return Ok(());
        }
        self.queue.try_enqueue(Command::DrawPoints(points))
    }

    /// Request fusion of two tracks. Operator path: rejects with
    /// `QueueFull` instead of blocking. Degenerate argument pairs are
    /// warned about and ignored.
    pub fn merge_command(&self, source: u32, target: u32) -> Result<(), ServiceError> {
        if source == 0 || target == 0 || source == target {
            warn!(source, target, "ignoring degenerate merge request");
            return Ok(());
        }
        self.queue.try_enqueue(Command::Merge { source, target })
    }

    /// Submit seed groups for new tracks. Pipeline path: waits for queue
    /// space when full.
    pub async fn create_tracks_command(
        &self,
        groups: Vec<[TrackPoint; SEED_POINT_COUNT]>,
    ) -> Result<(), ServiceError> {
        let groups: Vec<[TrackPoint; SEED_POINT_COUNT]> = groups
            .into_iter()
            .filter(|group| {
                let ok = group.iter().all(TrackPoint::is_valid);
                if !ok {
                    warn!("dropping seed group with non-finite point");
                }
                ok
            })
            .collect();
        if groups.is_empty() {
            return Ok(());
        }
        self.queue.enqueue(Command::CreateTracks(groups)).await
    }

    /// Submit filter updates, one point per previously observed track id.
    /// Pipeline path: waits for queue space when full.
    pub async fn add_points_command(
        &self,
        updates: Vec<(TrackHeader, TrackPoint)>,
    ) -> Result<(), ServiceError> {
        let updates: Vec<(TrackHeader, TrackPoint)> = updates
            .into_iter()
            .filter(|(_, point)| {
                let ok = point.is_valid();
                if !ok {
                    warn!("dropping non-finite update point");
                }
                ok
            })
            .collect();
        if updates.is_empty() {
            return Ok(());
        }
        self.queue.enqueue(Command::AddPoints(updates)).await
    }

    /// Reset the whole store. Operator path.
    pub fn clear_all_command(&self) -> Result<(), ServiceError> {
        self.queue.try_enqueue(Command::ClearAll)
    }

    fn retain_valid(points: Vec<TrackPoint>) -> Vec<TrackPoint> {
        let before = points.len();
        let points: Vec<TrackPoint> = points.into_iter().filter(TrackPoint::is_valid).collect();
        if points.len() < before {
            warn!(dropped = before - points.len(), "dropped non-finite points");
        }
        points
    }

    // --- Snapshot API (read side) ---

    pub async fn active_ids(&self) -> Vec<u32> {
        self.store.read().await.active_ids()
    }

    pub async fn header(&self, id: u32) -> Option<TrackHeader> {
        self.store.read().await.header(id)
    }

    pub async fn window(&self, id: u32) -> Option<Vec<TrackPoint>> {
        self.store.read().await.window(id)
    }

    pub async fn snapshot(&self, id: u32) -> Option<TrackSnapshot> {
        self.store.read().await.snapshot(id)
    }

    /// Packed wire frame for one live track.
    pub async fn pack_track(&self, id: u32) -> Option<Vec<u8>> {
        self.store.read().await.pack_vec(id)
    }

    // --- Observability ---

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }

    pub fn counters(&self) -> Arc<ServiceCounters> {
        self.counters.clone()
    }

    // --- Shutdown ---

    /// Request shutdown and wait for the worker. Pending operator commands
    /// are drained best-effort; enqueues fail from this point on.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("dispatcher worker failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackState;
    use std::sync::Mutex as StdMutex;

    fn point(lon: f64, associated: bool, ts: i64) -> TrackPoint {
        TrackPoint {
            longitude: lon,
            latitude: 30.0,
            sog: 10.0,
            cog: 90.0,
            angle: 45.0,
            distance: 12.0,
            associated,
            timestamp_ms: ts,
        }
    }

    fn seeds(base_lon: f64) -> [TrackPoint; SEED_POINT_COUNT] {
        std::array::from_fn(|i| point(base_lon + i as f64 * 0.001, true, 1000 + i as i64 * 100))
    }

    fn hint(id: u32) -> TrackHeader {
        TrackHeader {
            id,
            ..TrackHeader::default()
        }
    }

    /// Records draw calls so tests can assert the visualizer hook fired.
    struct RecordingVisualizer {
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Visualizer for RecordingVisualizer {
        fn draw_tracks(&mut self, tracks: &[TrackSnapshot]) {
            self.log
                .lock()
                .unwrap()
                .push(format!("tracks:{}", tracks.len()));
        }
        fn draw_points(&mut self, points: &[TrackPoint]) {
            self.log
                .lock()
                .unwrap()
                .push(format!("points:{}", points.len()));
        }
        fn clear(&mut self) {
            self.log.lock().unwrap().push("clear".to_string());
        }
    }

    fn test_dispatcher(
        track_capacity: usize,
        point_capacity: usize,
        log: Arc<StdMutex<Vec<String>>>,
    ) -> (Dispatcher, Arc<RwLock<TrackStore>>, Arc<CommandQueue>) {
        let store = Arc::new(RwLock::new(TrackStore::new(track_capacity, point_capacity)));
        let queue = Arc::new(CommandQueue::new(64));
        let (events, _) = broadcast::channel(16);
        let dispatcher = Dispatcher {
            store: store.clone(),
            queue: queue.clone(),
            visualizers: vec![Box::new(RecordingVisualizer { log })],
            outputs: Vec::new(),
            events,
            counters: Arc::new(ServiceCounters::default()),
            stop: Arc::new(AtomicBool::new(false)),
        };
        (dispatcher, store, queue)
    }

    #[test]
    fn test_priority_order_constant() {
        assert_eq!(
            PRIORITY_ORDER,
            [
                CommandKind::DrawPoints,
                CommandKind::Merge,
                CommandKind::CreateTracks,
                CommandKind::AddPoints,
                CommandKind::ClearAll,
            ]
        );
    }

    /// One sweep with every kind pending must process Merge before
    /// CreateTracks before AddPoints: the pool is full until the merge
    /// frees a slot, the created track's id is only live for the add if
    /// creation ran first, and the merged tail is only intact if the add
    /// landed after the merge.
    #[tokio::test]
    async fn test_sweep_priority_dependencies() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (mut dispatcher, store, queue) = test_dispatcher(3, 8, log.clone());

        // Pre-populate: two live tracks with full 8-point histories, and a
        // third slot occupied so only the merge can make room.
        {
            let mut store = store.write().await;
            let a = store.create_track().unwrap();
            let b = store.create_track().unwrap();
            for i in 0..8i64 {
                store.push_point(a, point(100.0 + i as f64, true, 1000 + i));
                store.push_point(b, point(200.0 + i as f64, true, 1000 + i));
            }
            store.create_track().unwrap();
            assert_eq!(store.free_count(), 0);
        }

        // Enqueue in reverse priority order
        queue
            .try_enqueue(Command::AddPoints(vec![
                (hint(1), point(50.0, true, 3000)),
                (hint(4), point(60.0, true, 3000)),
            ]))
            .unwrap();
        queue
            .try_enqueue(Command::CreateTracks(vec![seeds(120.0)]))
            .unwrap();
        queue
            .try_enqueue(Command::Merge {
                source: 1,
                target: 2,
            })
            .unwrap();
        queue
            .try_enqueue(Command::DrawPoints(vec![point(0.0, true, 0)]))
            .unwrap();

        let processed = dispatcher.sweep().await;
        assert_eq!(processed, 4);

        let store = store.read().await;
        // Merge ran: track 2 absorbed, track 1 alive
        assert!(store.header(2).is_none());
        // Create ran after merge (needed the freed slot) and got id 4
        assert_eq!(store.header(4).map(|h| h.point_count), Some(5));
        // The add targeting id 4 landed, so AddPoints ran after CreateTracks
        let created = store.window(4).unwrap();
        assert_eq!(created.last().unwrap().longitude, 60.0);
        // The add targeting id 1 landed after the merged tail was written
        let merged = store.window(1).unwrap();
        let lons: Vec<f64> = merged.iter().map(|p| p.longitude).collect();
        assert_eq!(
            lons,
            vec![101.0, 102.0, 103.0, 104.0, 205.0, 206.0, 207.0, 50.0]
        );
        // DrawPoints reached the visualizer during the sweep
        assert!(log.lock().unwrap().contains(&"points:1".to_string()));
    }

    /// ClearAll is the lowest priority: work enqueued in the same sweep
    /// lands first and is then wiped, and the id counter restarts.
    #[tokio::test]
    async fn test_clear_all_runs_last() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (mut dispatcher, store, queue) = test_dispatcher(4, 8, log.clone());

        queue.try_enqueue(Command::ClearAll).unwrap();
        queue
            .try_enqueue(Command::CreateTracks(vec![seeds(120.0)]))
            .unwrap();
        dispatcher.sweep().await;

        assert_eq!(
            dispatcher.counters.tracks_created.load(Ordering::Relaxed),
            1
        );
        let store = store.read().await;
        assert!(store.active_ids().is_empty());
        assert!(log.lock().unwrap().contains(&"clear".to_string()));
        drop(store);

        // Counter restarted by the clear
        queue
            .try_enqueue(Command::CreateTracks(vec![seeds(121.0)]))
            .unwrap();
        dispatcher.sweep().await;
        let store = dispatcher.store.read().await;
        assert_eq!(store.active_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_service_end_to_end() {
        let service = ManagementService::start(ServiceOptions {
            track_capacity: 4,
            point_capacity: 8,
            queue_capacity: 64,
            ..ServiceOptions::default()
        });
        let mut events = service.subscribe_events();

        // Seed one track and wait for the dispatcher to pick it up
        service
            .create_tracks_command(vec![seeds(120.0)])
            .await
            .unwrap();
        let id = wait_for_track(&service).await;
        let header = service.header(id).await.unwrap();
        assert_eq!(header.point_count, SEED_POINT_COUNT as u32);
        assert_eq!(header.state, TrackState::Normal);

        // Drive the track over the extrapolation limit
        let misses: Vec<(TrackHeader, TrackPoint)> = (0..4)
            .map(|i| (hint(id), point(121.0 + i as f64, false, 5000 + i)))
            .collect();
        service.add_points_command(misses).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no termination event")
            .unwrap();
        match event {
            TrackEvent::Terminated { id: event_id, snapshot } => {
                assert_eq!(event_id, id);
                // 4 seeds + 4 misses, window capacity 8
                assert_eq!(snapshot.points.len(), 8);
                assert_eq!(snapshot.header.state, TrackState::Terminated);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(service.active_ids().await.is_empty());

        let counters = service.counters();
        assert_eq!(counters.tracks_created.load(Ordering::Relaxed), 1);
        assert_eq!(counters.tracks_terminated.load(Ordering::Relaxed), 1);

        service.shutdown().await;
        assert_eq!(
            service.clear_all_command(),
            Err(ServiceError::ShutdownInProgress)
        );
        assert_eq!(
            service
                .add_points_command(vec![(hint(1), point(0.0, true, 0))])
                .await,
            Err(ServiceError::ShutdownInProgress)
        );
    }

    #[tokio::test]
    async fn test_unknown_track_push_is_nonfatal() {
        let service = ManagementService::start(ServiceOptions {
            track_capacity: 2,
            point_capacity: 4,
            queue_capacity: 16,
            ..ServiceOptions::default()
        });

        service
            .add_points_command(vec![(hint(999), point(120.0, true, 1000))])
            .await
            .unwrap();

        let counters = service.counters();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while counters.unknown_track_pushes.load(Ordering::Relaxed) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "warning never counted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Service stays live after the warning
        service.create_tracks_command(vec![seeds(120.0)]).await.unwrap();
        wait_for_track(&service).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_event_and_counter_reset() {
        let service = ManagementService::start(ServiceOptions {
            track_capacity: 4,
            point_capacity: 8,
            queue_capacity: 16,
            ..ServiceOptions::default()
        });
        let mut events = service.subscribe_events();

        service.create_tracks_command(vec![seeds(120.0)]).await.unwrap();
        wait_for_track(&service).await;

        service.clear_all_command().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no cleared event")
            .unwrap();
        assert!(matches!(event, TrackEvent::Cleared));

        // Ids restart after the clear
        service.create_tracks_command(vec![seeds(121.0)]).await.unwrap();
        let id = wait_for_track(&service).await;
        assert_eq!(id, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_facade_drops_invalid_points() {
        let service = ManagementService::start(ServiceOptions {
            track_capacity: 2,
            point_capacity: 4,
            queue_capacity: 16,
            ..ServiceOptions::default()
        });

        let mut bad = point(120.0, true, 1000);
        bad.longitude = f64::NAN;
        // Nothing valid left, so nothing is enqueued and nothing fails
        service.draw_points_command(vec![bad]).unwrap();
        service
            .add_points_command(vec![(hint(1), bad)])
            .await
            .unwrap();

        let mut bad_group = seeds(120.0);
        bad_group[2].cog = 400.0;
        service.create_tracks_command(vec![bad_group]).await.unwrap();

        // Degenerate merges are ignored at the facade
        service.merge_command(3, 3).unwrap();
        service.merge_command(0, 2).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.active_ids().await.is_empty());
        let counters = service.counters();
        assert_eq!(counters.merges_rejected.load(Ordering::Relaxed), 0);
        service.shutdown().await;
    }

    async fn wait_for_track(service: &ManagementService) -> u32 {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let ids = service.active_ids().await;
            if let Some(&id) = ids.first() {
                return id;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "track never appeared"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
