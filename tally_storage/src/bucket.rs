//! Time bucketing for multi-resolution slice levels.
//!
//! Bucket boundaries are aligned to the Unix epoch, not to any calendar
//! unit or to the first sample seen, so every identity and every series
//! shares the same boundaries at a given bucket width.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Logical timestamp type (Unix epoch seconds).
pub type Timestamp = i64;

/// A point in time given either as raw epoch seconds or as a calendar
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// Unix epoch seconds.
    Epoch(Timestamp),
    /// UTC calendar timestamp.
    Calendar(OffsetDateTime),
}

impl Stamp {
    /// Epoch seconds, dropping any sub-second part.
    pub fn epoch(self) -> Timestamp {
        match self {
            Stamp::Epoch(secs) => secs,
            Stamp::Calendar(dt) => dt.unix_timestamp(),
        }
    }

    /// Convert to the requested representation.
    pub fn to_form(self, form: StampForm) -> Result<Stamp, BucketError> {
        match form {
            StampForm::Epoch => Ok(Stamp::Epoch(self.epoch())),
            StampForm::Calendar => OffsetDateTime::from_unix_timestamp(self.epoch())
                .map(Stamp::Calendar)
                .map_err(|_| BucketError::OutOfRange(self.epoch())),
        }
    }
}

impl From<Timestamp> for Stamp {
    fn from(secs: Timestamp) -> Self {
        Stamp::Epoch(secs)
    }
}

impl From<OffsetDateTime> for Stamp {
    fn from(dt: OffsetDateTime) -> Self {
        Stamp::Calendar(dt)
    }
}

/// Which representation `floor_time` should hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StampForm {
    /// Epoch seconds.
    #[default]
    Epoch,
    /// Calendar timestamp.
    Calendar,
}

/// Invalid level definitions and unrepresentable instants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BucketError {
    /// Bucket widths are whole, positive seconds.
    #[error("bucket width must be a positive whole number of seconds, got {0:?}")]
    BadWidth(Duration),
    /// A level must retain at least one full bucket.
    #[error("window {window:?} is shorter than bucket width {width:?}")]
    WindowTooShort {
        /// Retention window.
        window: Duration,
        /// Bucket width.
        width: Duration,
    },
    /// Durations must fit in signed epoch seconds.
    #[error("duration {0:?} exceeds the timestamp range")]
    TooLarge(Duration),
    /// Timestamp outside the calendar range.
    #[error("timestamp {0} cannot be represented as a calendar date")]
    OutOfRange(Timestamp),
}

/// A resolution tier: buckets of `bucket_width` retained for `window`
/// before they must move to the next coarser tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Level {
    window: Duration,
    bucket_width: Duration,
}

impl Level {
    /// Create a level. The width must be a positive whole number of seconds
    /// and no longer than the window, which must fit in a `Timestamp`.
    pub fn new(window: Duration, bucket_width: Duration) -> Result<Self, BucketError> {
        if bucket_width.as_secs() == 0 || bucket_width.subsec_nanos() != 0 {
            return Err(BucketError::BadWidth(bucket_width));
        }
        if window.as_secs() > Timestamp::MAX as u64 {
            return Err(BucketError::TooLarge(window));
        }
        if window < bucket_width {
            return Err(BucketError::WindowTooShort {
                window,
                width: bucket_width,
            });
        }
        Ok(Self {
            window,
            bucket_width,
        })
    }

    /// Shorthand for `new` with both durations in seconds.
    pub fn from_secs(window: u64, bucket_width: u64) -> Result<Self, BucketError> {
        Self::new(Duration::from_secs(window), Duration::from_secs(bucket_width))
    }

    /// Retention window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Width of one bucket.
    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Bucket width in seconds.
    #[inline]
    pub fn width_secs(&self) -> i64 {
        self.bucket_width.as_secs() as i64
    }

    /// Retention window in seconds.
    #[inline]
    pub fn window_secs(&self) -> i64 {
        self.window.as_secs() as i64
    }

    /// Start of the bucket containing `ts`.
    #[inline]
    pub fn floor(&self, ts: Timestamp) -> Timestamp {
        ts.saturating_sub(ts.rem_euclid(self.width_secs()))
    }

    /// Exclusive end of the bucket starting at `bucket_start`.
    #[inline]
    pub fn end_of(&self, bucket_start: Timestamp) -> Timestamp {
        bucket_start.saturating_add(self.width_secs())
    }

    /// Earliest bucket start still inside the retention window at `now`.
    /// Buckets starting before it are due for compaction.
    pub fn recent_cutoff(&self, now: Timestamp) -> Timestamp {
        self.floor(now)
            .saturating_sub(self.window_secs())
            .saturating_add(self.width_secs())
    }
}

/// Floor `ts` to its bucket at `level`, returned in the requested form.
pub fn floor_time(ts: impl Into<Stamp>, level: &Level, form: StampForm) -> Result<Stamp, BucketError> {
    Stamp::Epoch(level.floor(ts.into().epoch())).to_form(form)
}

/// Shape of a reporting window ending at "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Floor "now" to this width first.
    pub trim: Option<Duration>,
    /// Window length.
    pub span: Duration,
    /// Shift the whole window into the past.
    pub offset: Duration,
    /// Trim this much off the upper edge only.
    pub clip: Duration,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            trim: None,
            span: Duration::from_secs(10 * 60),
            offset: Duration::ZERO,
            clip: Duration::ZERO,
        }
    }
}

/// Compute `(lower, upper)` for a window ending at `now`.
pub fn window_bounds(now: Timestamp, spec: &WindowSpec) -> (Timestamp, Timestamp) {
    let secs = |d: Duration| Timestamp::try_from(d.as_secs()).unwrap_or(Timestamp::MAX);
    let mut now = now;
    if let Some(trim) = spec.trim.map(secs).filter(|&t| t > 0) {
        now = now.saturating_sub(now.rem_euclid(trim));
    }
    let offset = secs(spec.offset);
    let upper = now.saturating_sub(offset).saturating_sub(secs(spec.clip));
    let lower = now.saturating_sub(secs(spec.span)).saturating_sub(offset);
    (lower, upper)
}
