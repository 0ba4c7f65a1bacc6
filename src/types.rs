// Track data model and packed wire layout
//
// Wire byte order is fixed little-endian for this build. A packed track is a
// 16-byte header followed by `point_count` 64-byte point records; the i64
// millisecond timestamp is inlined as the trailing field of each point record
// (offset 56). This layout is invariant for a given build.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{HEADER_WIRE_LEN, POINT_WIRE_LEN};

/// Lifecycle state of a track slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    /// Last push carried an associated measurement.
    Normal,
    /// Coasting on extrapolated points, not yet past the limit.
    Extrapolating,
    /// Extrapolation limit exceeded; slot is about to be released.
    Terminated,
    /// Slot is unoccupied.
    Free,
}

impl TrackState {
    /// Wire code: 0=NORMAL, 1=EXTRAPOLATING, 2=TERMINATED, -1=FREE.
    pub fn code(self) -> i32 {
        match self {
            TrackState::Normal => 0,
            TrackState::Extrapolating => 1,
            TrackState::Terminated => 2,
            TrackState::Free => -1,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes map to `Free`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TrackState::Normal,
            1 => TrackState::Extrapolating,
            2 => TrackState::Terminated,
            _ => TrackState::Free,
        }
    }
}

impl Default for TrackState {
    fn default() -> Self {
        TrackState::Free
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackState::Normal => "normal",
            TrackState::Extrapolating => "extrapolating",
            TrackState::Terminated => "terminated",
            TrackState::Free => "free",
        };
        f.write_str(s)
    }
}

/// One motion observation of a target.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Longitude in degrees.
    pub longitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Speed over ground, m/s.
    pub sog: f64,
    /// Course over ground, degrees clockwise from north, 0 <= cog < 360.
    pub cog: f64,
    /// Radar observation angle, degrees clockwise from the radar normal.
    pub angle: f64,
    /// Radar observation distance from the station, km.
    pub distance: f64,
    /// Did upstream bind this point to a real measurement, or is it extrapolated?
    pub associated: bool,
    /// Milliseconds since the Unix epoch. Carried by the producer; never
    /// overwritten by the store.
    pub timestamp_ms: i64,
}

impl TrackPoint {
    /// All numeric fields finite and cog normalized into [0, 360).
    pub fn is_valid(&self) -> bool {
        let finite = self.longitude.is_finite()
            && self.latitude.is_finite()
            && self.sog.is_finite()
            && self.cog.is_finite()
            && self.angle.is_finite()
            && self.distance.is_finite();
        finite && (0.0..360.0).contains(&self.cog)
    }

    /// Encode into the 64-byte wire record.
    pub fn to_wire(&self) -> [u8; POINT_WIRE_LEN] {
        let mut buf = [0u8; POINT_WIRE_LEN];
        buf[0..8].copy_from_slice(&self.longitude.to_le_bytes());
        buf[8..16].copy_from_slice(&self.latitude.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sog.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cog.to_le_bytes());
        buf[32..40].copy_from_slice(&self.angle.to_le_bytes());
        buf[40..48].copy_from_slice(&self.distance.to_le_bytes());
        buf[48] = u8::from(self.associated);
        // 49..56 stays zero
        buf[56..64].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }

    /// Decode a 64-byte wire record. Returns None when the slice is short.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() < POINT_WIRE_LEN {
            return None;
        }
        let f = |r: std::ops::Range<usize>| f64::from_le_bytes(buf[r].try_into().unwrap());
        Some(TrackPoint {
            longitude: f(0..8),
            latitude: f(8..16),
            sog: f(16..24),
            cog: f(24..32),
            angle: f(32..40),
            distance: f(40..48),
            associated: buf[48] != 0,
            timestamp_ms: i64::from_le_bytes(buf[56..64].try_into().unwrap()),
        })
    }
}

impl fmt::Display for TrackPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TrackPoint{{lon:{:.6}, lat:{:.6}, sog:{:.1}, cog:{:.1}, time:{}}}",
            self.longitude,
            self.latitude,
            self.sog,
            self.cog,
            format_timestamp_ms(self.timestamp_ms)
        )
    }
}

/// Per-track metadata. `id != 0` exactly when the slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackHeader {
    pub id: u32,
    /// Consecutive non-associated pushes since the last associated push.
    pub extrapolation_count: u32,
    /// Mirrors the window size.
    pub point_count: u32,
    pub state: TrackState,
}

impl TrackHeader {
    /// Initialize the header for a freshly allocated track.
    pub fn start(&mut self, id: u32) {
        self.id = id;
        self.extrapolation_count = 0;
        self.point_count = 0;
        self.state = TrackState::Normal;
    }

    /// Reset the header to the free-slot sentinel.
    pub fn clear(&mut self) {
        self.id = 0;
        self.extrapolation_count = 0;
        self.point_count = 0;
        self.state = TrackState::Free;
    }

    /// Encode into the 16-byte wire record.
    pub fn to_wire(&self) -> [u8; HEADER_WIRE_LEN] {
        let mut buf = [0u8; HEADER_WIRE_LEN];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.extrapolation_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.point_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.state.code().to_le_bytes());
        buf
    }

    /// Decode a 16-byte wire record. Returns None when the slice is short.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_WIRE_LEN {
            return None;
        }
        Some(TrackHeader {
            id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            extrapolation_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            point_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            state: TrackState::from_code(i32::from_le_bytes(buf[12..16].try_into().unwrap())),
        })
    }
}

/// Parse a packed track frame back into header and points. Inverse of
/// `TrackStore::pack`; used by the receive side and round-trip tests.
pub fn decode_track(buf: &[u8]) -> Option<(TrackHeader, Vec<TrackPoint>)> {
    let header = TrackHeader::from_wire(buf)?;
    let n = header.point_count as usize;
    let needed = HEADER_WIRE_LEN + n * POINT_WIRE_LEN;
    if buf.len() < needed {
        return None;
    }
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let off = HEADER_WIRE_LEN + i * POINT_WIRE_LEN;
        points.push(TrackPoint::from_wire(&buf[off..off + POINT_WIRE_LEN])?);
    }
    Some((header, points))
}

/// Render a millisecond Unix timestamp as local `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn format_timestamp_ms(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{}ms", ms),
    }
}
