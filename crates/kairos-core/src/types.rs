use serde::{Deserialize, Serialize};

/// How a job definition is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fixed period: `seconds minutes hours days weeks`.
    Interval,
    /// Six or seven field cron expression, seconds first.
    Cron,
    /// Fires once at an absolute instant.
    Date,
    /// Fires once, immediately. Carries no expression.
    Once,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Interval => "interval",
            TriggerKind::Cron => "cron",
            TriggerKind::Date => "date",
            TriggerKind::Once => "once",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "interval" => Ok(TriggerKind::Interval),
            "cron" => Ok(TriggerKind::Cron),
            "date" => Ok(TriggerKind::Date),
            "once" => Ok(TriggerKind::Once),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}
