use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                $name(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

uuid_id!(ScheduleId);
uuid_id!(RunId);
uuid_id!(AssetId);
uuid_id!(RuleId);
uuid_id!(NotificationId);
uuid_id!(WebhookId);

/// Marmot Resource Name — the opaque stable key identifying an asset by
/// `(type, provider, qualified name)`. Unlike the uuid-backed ids above this
/// is a derived, content-addressed string key, not a random identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mrn(pub String);

impl Mrn {
    /// `mrn://<type>/<provider>/<name>`, lower-cased and percent-free —
    /// matches the worked example in spec.md Scenario 1
    /// (`mrn://topic/kafka/orders.created`).
    pub fn compute(asset_type: &str, primary_provider: &str, name: &str) -> Self {
        let slug = |s: &str| {
            s.trim()
                .to_lowercase()
                .chars()
                .map(|c| if c.is_whitespace() { '-' } else { c })
                .collect::<String>()
        };
        Mrn(format!(
            "mrn://{}/{}/{}",
            slug(asset_type),
            slug(primary_provider),
            name.trim()
        ))
    }

    /// The trailing `name` segment, for display when materializing a
    /// brand-new stub with nothing else known about it yet.
    pub fn name(&self) -> Option<&str> {
        self.0.rsplit('/').next()
    }
}

impl Display for Mrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginId(pub String);

impl Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mrn_matches_scenario_1() {
        let mrn = Mrn::compute("Topic", "Kafka", "orders.created");
        assert_eq!(mrn.0, "mrn://topic/kafka/orders.created");
    }
}
