// Visualizer collaborator
//
// The dispatcher hands every sweep a consistent snapshot of the store; what
// a visualizer does with it is its own business. Raster rendering lives
// outside this crate — the implementations here log summaries and keep a
// JSON state file current for external map frontends.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};

use crate::store::TrackSnapshot;
use crate::types::{format_timestamp_ms, TrackPoint, TrackState};

/// Snapshot consumer invoked by the dispatcher. Side-effecting only; a
/// visualizer never reaches back into the store.
pub trait Visualizer: Send {
    /// Full snapshot of the live tracks, once per dispatcher sweep.
    fn draw_tracks(&mut self, tracks: &[TrackSnapshot]);
    /// Raw detection points forwarded by a DrawPoints command.
    fn draw_points(&mut self, points: &[TrackPoint]);
    /// The store was cleared.
    fn clear(&mut self);
}

/// Logs a per-sweep trace summary and a rate-limited info status line.
pub struct TextVisualizer {
    status_interval: Option<Duration>,
    last_status: Instant,
    points_drawn: u64,
}

impl TextVisualizer {
    /// `status_interval_secs <= 0` disables the info status line.
    pub fn new(status_interval_secs: i32) -> Self {
        TextVisualizer {
            status_interval: (status_interval_secs > 0)
                .then(|| Duration::from_secs(status_interval_secs as u64)),
            last_status: Instant::now(),
            points_drawn: 0,
        }
    }
}

impl Visualizer for TextVisualizer {
    fn draw_tracks(&mut self, tracks: &[TrackSnapshot]) {
        trace!(live = tracks.len(), "track snapshot");

        let Some(interval) = self.status_interval else {
            return;
        };
        if self.last_status.elapsed() < interval {
            return;
        }
        self.last_status = Instant::now();
        let extrapolating = tracks
            .iter()
            .filter(|t| t.header.state == TrackState::Extrapolating)
            .count();
        let points: usize = tracks.iter().map(|t| t.points.len()).sum();
        info!(
            "Status: ({} tracks {} extrapolating) ({} points held {} points drawn)",
            tracks.len(),
            extrapolating,
            points,
            self.points_drawn
        );
    }

    fn draw_points(&mut self, points: &[TrackPoint]) {
        self.points_drawn += points.len() as u64;
        debug!(count = points.len(), "detection points drawn");
    }

    fn clear(&mut self) {
        info!("visualizer cleared");
    }
}

/// Keeps `<work_dir>/tracks.json` current on an interval: one entry per live
/// track with its header and newest point. Written to a tmp file then
/// renamed so readers never see a partial dump.
pub struct StateFileVisualizer {
    work_dir: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
}

impl StateFileVisualizer {
    pub fn new(work_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        StateFileVisualizer {
            work_dir: work_dir.into(),
            interval,
            last_write: None,
        }
    }

    fn write_state(&self, tracks: &[TrackSnapshot]) {
        let mut entries = serde_json::Map::new();
        for track in tracks {
            let mut entry = serde_json::Map::new();
            entry.insert("id".into(), track.header.id.into());
            entry.insert("state".into(), track.header.state.to_string().into());
            entry.insert(
                "extrapolation_count".into(),
                track.header.extrapolation_count.into(),
            );
            entry.insert("point_count".into(), track.header.point_count.into());
            if let Some(newest) = track.points.last() {
                entry.insert("lon".into(), newest.longitude.into());
                entry.insert("lat".into(), newest.latitude.into());
                entry.insert("sog".into(), newest.sog.into());
                entry.insert("cog".into(), newest.cog.into());
                entry.insert(
                    "seen".into(),
                    format_timestamp_ms(newest.timestamp_ms).into(),
                );
            }
            entries.insert(track.header.id.to_string(), entry.into());
        }
        let value = serde_json::Value::Object(entries);

        let tmp = self.work_dir.join("tracks.json.tmp");
        let path = self.work_dir.join("tracks.json");
        match serde_json::to_string(&value) {
            Ok(s) => {
                if let Err(e) = std::fs::write(&tmp, s) {
                    error!("failed to write {}: {}", tmp.display(), e);
                } else if let Err(e) = std::fs::rename(&tmp, &path) {
                    let _ = std::fs::remove_file(&tmp);
                    error!("failed to rename {} -> {}: {}", tmp.display(), path.display(), e);
                }
            }
            Err(e) => error!("failed to serialize track state: {}", e),
        }
    }
}

impl Visualizer for StateFileVisualizer {
    fn draw_tracks(&mut self, tracks: &[TrackSnapshot]) {
        if self.last_write.is_some_and(|t| t.elapsed() < self.interval) {
            return;
        }
        self.last_write = Some(Instant::now());
        self.write_state(tracks);
    }

    fn draw_points(&mut self, _points: &[TrackPoint]) {}

    fn clear(&mut self) {
        self.write_state(&[]);
    }
}
