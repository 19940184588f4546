//! Quality tiers, the constraints each tier maps to, and the threshold tables
//! that decide when the sent video is throttled down to a tier.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CallqError, CallqResult};

/// Quality of the sent video, ordered from lowest to highest fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QualityTier {
    Thumbnail = 0,
    VeryLow = 1,
    Low = 2,
    Medium = 3,
    High = 4,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Thumbnail,
        QualityTier::VeryLow,
        QualityTier::Low,
        QualityTier::Medium,
        QualityTier::High,
    ];

    /// Tiers a threshold can select, lowest fidelity first. HIGH is the
    /// fallback when no threshold is reached.
    pub const THROTTLED: [QualityTier; 4] = [
        QualityTier::Thumbnail,
        QualityTier::VeryLow,
        QualityTier::Low,
        QualityTier::Medium,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Thumbnail => "THUMBNAIL",
            Self::VeryLow => "VERY_LOW",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    /// Constraints to apply to the local video track for this tier.
    ///
    /// HIGH sets the frame rate explicitly; without it a capture device may
    /// keep the previous, stricter stream when relaxing constraints.
    pub fn constraints(self) -> VideoConstraints {
        match self {
            Self::High => VideoConstraints {
                max_width: None,
                max_height: None,
                max_frame_rate: 30,
            },
            Self::Medium => VideoConstraints::capped(640, 480, 24),
            Self::Low => VideoConstraints::capped(480, 320, 15),
            Self::VeryLow => VideoConstraints::capped(320, 240, 8),
            Self::Thumbnail => VideoConstraints::capped(320, 240, 1),
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QualityTier {
    type Err = CallqError;

    /// Accepts the numeric value ("3") or the name in any case ("MEDIUM",
    /// "very_low").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.parse::<u8>() {
            return Self::from_u8(value).ok_or_else(|| CallqError::UnknownTier(s.to_owned()));
        }

        Self::ALL
            .into_iter()
            .find(|tier| tier.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CallqError::UnknownTier(s.to_owned()))
    }
}

impl Serialize for QualityTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

struct TierVisitor;

impl Visitor<'_> for TierVisitor {
    type Value = QualityTier;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a quality tier number (0-4) or name")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        u8::try_from(v)
            .ok()
            .and_then(QualityTier::from_u8)
            .ok_or_else(|| E::custom(format!("unknown quality tier {v}")))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map_err(|_| E::custom(format!("unknown quality tier {v}")))
            .and_then(|v| self.visit_u64(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for QualityTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Map keys arrive as strings ("3"), plain values as numbers.
        deserializer.deserialize_any(TierVisitor)
    }
}

/// Resolution and frame rate limits requested from the local video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    pub max_frame_rate: u32,
}

impl VideoConstraints {
    fn capped(max_width: u32, max_height: u32, max_frame_rate: u32) -> Self {
        Self {
            max_width: Some(max_width),
            max_height: Some(max_height),
            max_frame_rate,
        }
    }
}

/// Minimum number of peers (with video or with audio available) at which the
/// sent video is throttled down to a tier.
///
/// Every tier except HIGH must have an entry. Entries are expected to shrink
/// as fidelity grows; a table that does not is accepted but logged, as a
/// moderator may widen thresholds on purpose.
///
/// Keys deserialize from the tier number or name. Two keys naming the same
/// tier (`"3"` and `"MEDIUM"`) are rejected rather than one silently winning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ThresholdTable(BTreeMap<QualityTier, usize>);

struct TableVisitor;

impl<'de> Visitor<'de> for TableVisitor {
    type Value = ThresholdTable;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map from quality tier to peer count")
    }

    fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((tier, count)) = map.next_entry::<QualityTier, usize>()? {
            if entries.insert(tier, count).is_some() {
                return Err(de::Error::custom(format!(
                    "duplicate threshold for quality {tier}"
                )));
            }
        }
        Ok(ThresholdTable(entries))
    }
}

impl<'de> Deserialize<'de> for ThresholdTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(TableVisitor)
    }
}

impl ThresholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default table for the number of peers with video available.
    pub fn default_available_videos() -> Self {
        Self::from([
            (QualityTier::High, 2),
            (QualityTier::Medium, 4),
            (QualityTier::Low, 7),
            (QualityTier::VeryLow, 10),
            (QualityTier::Thumbnail, 15),
        ])
    }

    /// Default table for the number of peers with audio available.
    pub fn default_available_audios() -> Self {
        Self::from([
            (QualityTier::High, 10),
            (QualityTier::Medium, 20),
            (QualityTier::Low, 30),
            (QualityTier::VeryLow, 40),
            (QualityTier::Thumbnail, 50),
        ])
    }

    pub fn with(mut self, tier: QualityTier, count: usize) -> Self {
        self.0.insert(tier, count);
        self
    }

    pub fn remove(&mut self, tier: QualityTier) -> Option<usize> {
        self.0.remove(&tier)
    }

    pub fn get(&self, tier: QualityTier) -> Option<usize> {
        self.0.get(&tier).copied()
    }

    /// Whether `count` peers reach the threshold of `tier`. A missing entry
    /// is never reached.
    pub fn is_reached(&self, tier: QualityTier, count: usize) -> bool {
        self.get(tier).is_some_and(|threshold| count >= threshold)
    }

    /// Adjacent tier pairs `(lower, higher)` whose higher-fidelity entry is
    /// larger than the lower-fidelity one.
    pub fn non_monotonic_pairs(&self) -> Vec<(QualityTier, QualityTier)> {
        QualityTier::ALL
            .windows(2)
            .filter_map(|pair| {
                let (lower, higher) = (pair[0], pair[1]);
                match (self.get(lower), self.get(higher)) {
                    (Some(l), Some(h)) if h > l => Some((lower, higher)),
                    _ => None,
                }
            })
            .collect()
    }

    /// Check that every throttled tier has an entry, warning about entries
    /// that are out of order.
    pub fn validate(&self) -> CallqResult<()> {
        if let Some(tier) = QualityTier::THROTTLED
            .into_iter()
            .find(|tier| !self.0.contains_key(tier))
        {
            return Err(CallqError::MissingThreshold { tier });
        }

        for (lower, higher) in self.non_monotonic_pairs() {
            tracing::warn!(
                tier = %higher,
                threshold = ?self.get(higher),
                lower_tier = %lower,
                lower_threshold = ?self.get(lower),
                "Threshold is larger than the threshold of a lower quality, it will be ignored"
            );
        }

        Ok(())
    }
}

impl<const N: usize> From<[(QualityTier, usize); N]> for ThresholdTable {
    fn from(entries: [(QualityTier, usize); N]) -> Self {
        Self(BTreeMap::from(entries))
    }
}

impl FromIterator<(QualityTier, usize)> for ThresholdTable {
    fn from_iter<I: IntoIterator<Item = (QualityTier, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tiers_are_ordered_by_fidelity() {
        assert!(QualityTier::Thumbnail < QualityTier::VeryLow);
        assert!(QualityTier::Medium < QualityTier::High);
        assert_eq!(QualityTier::from_u8(2), Some(QualityTier::Low));
        assert_eq!(QualityTier::from_u8(5), None);
    }

    #[test]
    fn tier_parses_numbers_and_names() {
        assert_eq!("3".parse::<QualityTier>().unwrap(), QualityTier::Medium);
        assert_eq!("VERY_LOW".parse::<QualityTier>().unwrap(), QualityTier::VeryLow);
        assert_eq!("thumbnail".parse::<QualityTier>().unwrap(), QualityTier::Thumbnail);
        assert!("9".parse::<QualityTier>().is_err());
        assert!("ULTRA".parse::<QualityTier>().is_err());
    }

    #[test]
    fn constraints_match_tier_table() {
        let high = QualityTier::High.constraints();
        assert_eq!(high.max_width, None);
        assert_eq!(high.max_frame_rate, 30);

        let medium = QualityTier::Medium.constraints();
        assert_eq!((medium.max_width, medium.max_height), (Some(640), Some(480)));
        assert_eq!(medium.max_frame_rate, 24);

        assert_eq!(QualityTier::Low.constraints().max_frame_rate, 15);
        assert_eq!(QualityTier::VeryLow.constraints().max_frame_rate, 8);

        let thumbnail = QualityTier::Thumbnail.constraints();
        assert_eq!(thumbnail.max_width, Some(320));
        assert_eq!(thumbnail.max_frame_rate, 1);
    }

    #[test]
    fn high_constraints_omit_resolution_on_the_wire() {
        let json = serde_json::to_value(QualityTier::High.constraints()).unwrap();
        assert_eq!(json, serde_json::json!({ "max_frame_rate": 30 }));
    }

    #[test]
    fn default_tables_validate() {
        assert!(ThresholdTable::default_available_videos().validate().is_ok());
        assert!(ThresholdTable::default_available_audios().validate().is_ok());
        assert!(ThresholdTable::default_available_videos().non_monotonic_pairs().is_empty());
    }

    #[test]
    fn missing_low_threshold_is_rejected() {
        let mut table = ThresholdTable::default_available_videos();
        table.remove(QualityTier::Low);

        match table.validate() {
            Err(CallqError::MissingThreshold { tier }) => assert_eq!(tier, QualityTier::Low),
            other => panic!("expected missing threshold, got {other:?}"),
        }
    }

    #[test]
    fn high_entry_is_optional() {
        let mut table = ThresholdTable::default_available_audios();
        table.remove(QualityTier::High);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn non_monotonic_table_is_accepted() {
        let table = ThresholdTable::default_available_videos().with(QualityTier::Medium, 12);

        assert_eq!(
            table.non_monotonic_pairs(),
            vec![(QualityTier::Low, QualityTier::Medium)]
        );
        assert!(table.validate().is_ok());
    }

    #[test]
    fn table_deserializes_from_numeric_keys() {
        let table: ThresholdTable = serde_json::from_str(
            r#"{"0": 15, "1": 10, "2": 7, "3": 4, "4": 2}"#,
        )
        .unwrap();
        assert_eq!(table, ThresholdTable::default_available_videos());
    }

    #[test]
    fn table_deserializes_from_named_keys() {
        let table: ThresholdTable =
            serde_json::from_str(r#"{"THUMBNAIL": 1, "VERY_LOW": 2, "LOW": 3, "MEDIUM": 4}"#)
                .unwrap();
        assert_eq!(table.get(QualityTier::Low), Some(3));
        assert_eq!(table.get(QualityTier::High), None);
    }

    #[test]
    fn table_rejects_two_keys_for_one_tier() {
        let err = serde_json::from_str::<ThresholdTable>(
            r#"{"0": 15, "1": 10, "2": 7, "3": 4, "MEDIUM": 5}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate threshold for quality MEDIUM"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn validate(&self, table: &ThresholdTable) -> String {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, || table.validate().unwrap());
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn non_monotonic_table_logs_a_warning() {
        let table = ThresholdTable::default_available_videos().with(QualityTier::Medium, 12);
        let logs = CapturedLogs::default().validate(&table);

        assert!(logs.contains("WARN"));
        assert!(logs.contains("Threshold is larger than the threshold of a lower quality"));
        assert!(logs.contains("tier=MEDIUM"));
        assert!(logs.contains("lower_tier=LOW"));
    }

    #[test]
    fn monotonic_table_logs_nothing() {
        let logs = CapturedLogs::default().validate(&ThresholdTable::default_available_videos());
        assert!(logs.is_empty());
    }

    #[test]
    fn is_reached_compares_inclusively() {
        let table = ThresholdTable::default_available_videos();
        assert!(table.is_reached(QualityTier::Medium, 4));
        assert!(!table.is_reached(QualityTier::Medium, 3));
        assert!(!ThresholdTable::new().is_reached(QualityTier::Medium, 100));
    }
}
