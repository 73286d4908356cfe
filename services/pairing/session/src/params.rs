//! Session parameters exchanged during PASE and CASE.

use pairing_tlv::{Field, Schema, StructBuilder, StructView, TlvObject, ValidationError, Value};
use std::time::Duration;

const TAG_IDLE_INTERVAL: u8 = 1;
const TAG_ACTIVE_INTERVAL: u8 = 2;
const TAG_ACTIVE_THRESHOLD: u8 = 3;

/// Retransmission interval used while the peer is idle
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(500);
/// Retransmission interval used while the peer is active
pub const DEFAULT_ACTIVE_INTERVAL: Duration = Duration::from_millis(300);
/// How long the peer stays active after traffic
pub const DEFAULT_ACTIVE_THRESHOLD: Duration = Duration::from_millis(4000);

/// Peer timing hints; absent values mean the defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionParameters {
    /// Idle retransmission interval in milliseconds
    pub idle_interval_ms: Option<u32>,
    /// Active retransmission interval in milliseconds
    pub active_interval_ms: Option<u32>,
    /// Active threshold in milliseconds
    pub active_threshold_ms: Option<u16>,
}

impl SessionParameters {
    /// Parameters with every value set
    pub fn new(idle: Duration, active: Duration, threshold: Duration) -> Self {
        Self {
            idle_interval_ms: Some(idle.as_millis().min(u32::MAX as u128) as u32),
            active_interval_ms: Some(active.as_millis().min(u32::MAX as u128) as u32),
            active_threshold_ms: Some(threshold.as_millis().min(u16::MAX as u128) as u16),
        }
    }

    /// Idle interval, falling back to the default
    pub fn idle_interval(&self) -> Duration {
        self.idle_interval_ms
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_IDLE_INTERVAL)
    }

    /// Active interval, falling back to the default
    pub fn active_interval(&self) -> Duration {
        self.active_interval_ms
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_ACTIVE_INTERVAL)
    }

    /// Active threshold, falling back to the default
    pub fn active_threshold(&self) -> Duration {
        self.active_threshold_ms
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_ACTIVE_THRESHOLD)
    }

    pub(crate) fn from_optional(value: Option<&Value>) -> Result<Option<Self>, ValidationError> {
        value
            .map(|v| Self::from_tlv(v).map_err(|e| e.in_field("sessionParams")))
            .transpose()
    }
}

impl TlvObject for SessionParameters {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::optional(TAG_IDLE_INTERVAL, "idleIntervalMs", Schema::uint32()),
            Field::optional(TAG_ACTIVE_INTERVAL, "activeIntervalMs", Schema::uint32()),
            Field::optional(TAG_ACTIVE_THRESHOLD, "activeThresholdMs", Schema::uint16()),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .opt_uint(TAG_IDLE_INTERVAL, self.idle_interval_ms.map(u64::from))
            .opt_uint(TAG_ACTIVE_INTERVAL, self.active_interval_ms.map(u64::from))
            .opt_uint(TAG_ACTIVE_THRESHOLD, self.active_threshold_ms.map(u64::from))
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            idle_interval_ms: view.opt_uint_as(TAG_IDLE_INTERVAL, "idleIntervalMs")?,
            active_interval_ms: view.opt_uint_as(TAG_ACTIVE_INTERVAL, "activeIntervalMs")?,
            active_threshold_ms: view.opt_uint_as(TAG_ACTIVE_THRESHOLD, "activeThresholdMs")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_missing_values() {
        let params = SessionParameters {
            idle_interval_ms: Some(1000),
            ..Default::default()
        };
        assert_eq!(params.idle_interval(), Duration::from_secs(1));
        assert_eq!(params.active_interval(), DEFAULT_ACTIVE_INTERVAL);
        assert_eq!(params.active_threshold(), DEFAULT_ACTIVE_THRESHOLD);
    }

    #[test]
    fn test_empty_parameters_encode_as_empty_structure() {
        let params = SessionParameters::default();
        let decoded = SessionParameters::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(params.encoded_len(), 2);
    }

    #[test]
    fn test_threshold_bound() {
        let value = StructBuilder::new()
            .uint(TAG_ACTIVE_THRESHOLD, 70_000)
            .build();
        let err = SessionParameters::schema().validate(&value).unwrap_err();
        assert!(matches!(err.root_cause(), ValidationError::OutOfBounds { .. }));
    }
}
