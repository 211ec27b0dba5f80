//! serde helpers for `Duration` fields in the config file.
//! Values may be humantime strings ("90s", "5 minutes") or plain
//! integer or floating point numbers of seconds.
use serde::{Deserialize, Deserializer};
use std::time::Duration;

struct Wrap(Duration);

impl<'de> Deserialize<'de> for Wrap {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Duration::try_from_secs_f64(v).map_err(E::custom)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                match v.try_into() {
                    Ok(secs) => Ok(Duration::from_secs(secs)),
                    Err(err) => Err(E::custom(format!(
                        "duration must either be a string or a \
                         positive integer specifying the number of seconds. \
                         (error: {err:#})"
                    ))),
                }
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(V).map(Wrap)
    }
}

pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Wrap::deserialize(d).map(|w| w.0)
}

/// For `Option<Duration>` fields. A zero duration also means None,
/// so that a value can be switched off from the config file.
pub mod optional {
    use super::Wrap;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Wrap(duration) = Wrap::deserialize(d)?;
        Ok(if duration.is_zero() {
            None
        } else {
            Some(duration)
        })
    }
}
