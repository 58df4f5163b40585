use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Serializes Duration as fractional milliseconds
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_secs_f64() * 1000.0).serialize(serializer)
}

/// Deserializes Duration from fractional milliseconds
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = f64::deserialize(deserializer)?;
    if !millis.is_finite() || millis < 0.0 {
        return Err(serde::de::Error::custom(format!("invalid duration: {} ms", millis)));
    }
    Ok(Duration::from_secs_f64(millis / 1000.0))
}
