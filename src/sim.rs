// Built-in target simulator
//
// Generates moving air/sea targets around the station and drives the
// management service the way the real pipeline would: seed groups to open
// tracks, then one update per observed live id per tick. Ids are taken from
// the snapshot API — the simulator is an external producer and only ever
// references ids it has previously observed.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::constants::SEED_POINT_COUNT;
use crate::service::ManagementService;
use crate::types::{TrackHeader, TrackPoint};

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = 111.0;

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Number of concurrently simulated targets.
    pub targets: usize,
    /// Update period.
    pub interval: Duration,
    /// Probability that a tick produces a non-associated (extrapolated)
    /// observation, exercising the termination path.
    pub miss_probability: f64,
    /// Station position the radar geometry is computed against.
    pub station_lat: f64,
    pub station_lon: f64,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            targets: 20,
            interval: Duration::from_millis(500),
            miss_probability: 0.05,
            station_lat: 30.0,
            station_lon: 120.0,
        }
    }
}

/// One simulated target moving with constant speed and a slowly wandering
/// course.
struct SimTarget {
    lon: f64,
    lat: f64,
    /// Speed over ground, m/s.
    sog: f64,
    /// Course over ground, degrees clockwise from north.
    cog: f64,
}

impl SimTarget {
    fn spawn(rng: &mut StdRng, options: &SimOptions) -> Self {
        SimTarget {
            lon: options.station_lon + rng.gen_range(-0.5..0.5),
            lat: options.station_lat + rng.gen_range(-0.5..0.5),
            sog: rng.gen_range(5.0..30.0),
            cog: rng.gen_range(0.0..360.0),
        }
    }

    /// Advance by `dt` seconds of dead reckoning with a small course wander.
    fn step(&mut self, dt: f64, rng: &mut StdRng) {
        self.cog = (self.cog + rng.gen_range(-2.0..2.0)).rem_euclid(360.0);
        let heading = self.cog.to_radians();
        let km = self.sog * dt / 1000.0;
        self.lat += km * heading.cos() / KM_PER_DEGREE;
        self.lon += km * heading.sin() / (KM_PER_DEGREE * self.lat.to_radians().cos());
    }

    /// Observation of this target as seen from the station.
    fn observe(&self, options: &SimOptions, associated: bool, timestamp_ms: i64) -> TrackPoint {
        let dx = (self.lon - options.station_lon)
            * KM_PER_DEGREE
            * self.lat.to_radians().cos();
        let dy = (self.lat - options.station_lat) * KM_PER_DEGREE;
        TrackPoint {
            longitude: self.lon,
            latitude: self.lat,
            sog: self.sog,
            cog: self.cog,
            angle: dx.atan2(dy).to_degrees().rem_euclid(360.0),
            distance: (dx * dx + dy * dy).sqrt(),
            associated,
            timestamp_ms,
        }
    }

    /// Seed group for a fresh track: four backdated associated observations
    /// along the target's current course.
    fn seed_group(&mut self, options: &SimOptions, rng: &mut StdRng) -> [TrackPoint; SEED_POINT_COUNT] {
        let dt = options.interval.as_secs_f64();
        let step_ms = options.interval.as_millis() as i64;
        let now = now_ms();
        std::array::from_fn(|i| {
            self.step(dt, rng);
            let backdate = (SEED_POINT_COUNT - 1 - i) as i64 * step_ms;
            self.observe(options, true, now - backdate)
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Run the simulator until the service shuts down.
pub async fn run_sim(service: Arc<ManagementService>, options: SimOptions) {
    info!(
        targets = options.targets,
        interval_ms = options.interval.as_millis() as u64,
        "target simulator started"
    );
    let mut rng = StdRng::from_entropy();
    let mut targets: Vec<SimTarget> = (0..options.targets)
        .map(|_| SimTarget::spawn(&mut rng, &options))
        .collect();

    // Open one track per target
    let groups: Vec<[TrackPoint; SEED_POINT_COUNT]> = targets
        .iter_mut()
        .map(|t| t.seed_group(&options, &mut rng))
        .collect();
    if service.create_tracks_command(groups).await.is_err() {
        return;
    }

    let dt = options.interval.as_secs_f64();
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let mut ids = service.active_ids().await;
        ids.sort_unstable();

        // One observation per live track, oldest id first so the pairing
        // with simulated targets stays stable between ticks
        let now = now_ms();
        let mut updates: Vec<(TrackHeader, TrackPoint)> = Vec::with_capacity(ids.len());
        for (target, &id) in targets.iter_mut().zip(ids.iter()) {
            target.step(dt, &mut rng);
            let associated = rng.gen_range(0.0..1.0) >= options.miss_probability;
            let hint = TrackHeader {
                id,
                ..TrackHeader::default()
            };
            updates.push((hint, target.observe(&options, associated, now)));
        }
        // Mirror the raw detections to the visualizer; losing a draw under
        // backpressure is fine
        let cloud: Vec<TrackPoint> = updates.iter().map(|(_, p)| *p).collect();
        if let Err(e) = service.draw_points_command(cloud) {
            debug!("draw points dropped: {}", e);
        }

        if !updates.is_empty() && service.add_points_command(updates).await.is_err() {
            break;
        }

        // Terminated tracks leave idle simulated targets behind; respawn
        // them and open replacement tracks
        if ids.len() < targets.len() {
            let missing = targets.len() - ids.len();
            debug!(missing, "reseeding terminated tracks");
            let mut groups = Vec::with_capacity(missing);
            for target in targets.iter_mut().skip(ids.len()) {
                *target = SimTarget::spawn(&mut rng, &options);
                groups.push(target.seed_group(&options, &mut rng));
            }
            if service.create_tracks_command(groups).await.is_err() {
                break;
            }
        }
    }
    info!("target simulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimOptions {
        SimOptions::default()
    }

    #[test]
    fn test_targets_produce_valid_points() {
        let mut rng = StdRng::seed_from_u64(7);
        let opts = options();
        let mut target = SimTarget::spawn(&mut rng, &opts);
        for i in 0..100 {
            target.step(opts.interval.as_secs_f64(), &mut rng);
            let point = target.observe(&opts, i % 7 != 0, 1_700_000_000_000 + i);
            assert!(point.is_valid(), "invalid point at step {}: {}", i, point);
            assert!(point.distance >= 0.0);
            assert!((0.0..360.0).contains(&point.angle));
        }
    }

    #[test]
    fn test_seed_groups_are_backdated_in_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let opts = options();
        let mut target = SimTarget::spawn(&mut rng, &opts);
        let group = target.seed_group(&opts, &mut rng);
        assert!(group.iter().all(|p| p.associated));
        for pair in group.windows(2) {
            assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
        }
    }
}
