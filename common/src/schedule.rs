//! Programación recurrente: forma serializada de los disparadores y la
//! vista que expone el scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ExecutionId, JobId};

/// Cuándo se vuelve a encolar un job. Las horas se interpretan en la zona
/// del job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    /// Expresión de 6 campos (segundo primero) o de 5 (sin segundos).
    Cron { cron: String },
    Interval { interval: IntervalSpec },
    /// Una sola vez. RFC 3339, u hora de pared `YYYY-mm-ddTHH:MM:SS`.
    #[serde(alias = "once")]
    Date { run_date: String },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::Date { .. } => "date",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(default)]
    pub weeks: u64,
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl IntervalSpec {
    /// Total en segundos; `None` si desborda.
    pub fn total_seconds(&self) -> Option<u64> {
        let parts = [
            (self.weeks, 7 * 24 * 3600),
            (self.days, 24 * 3600),
            (self.hours, 3600),
            (self.minutes, 60),
            (self.seconds, 1),
        ];
        parts
            .iter()
            .try_fold(0u64, |acc, (n, unit)| acc.checked_add(n.checked_mul(*unit)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleView {
    pub job_id: JobId,
    pub job_name: String,
    pub timezone: String,
    pub trigger: Trigger,
    pub priority: i32,
    pub paused: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_execution_id: Option<ExecutionId>,
    pub run_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervalo_suma_todas_las_unidades() {
        let spec = IntervalSpec {
            days: 1,
            minutes: 2,
            seconds: 3,
            ..IntervalSpec::default()
        };
        assert_eq!(spec.total_seconds(), Some(86_400 + 123));
        let huge = IntervalSpec {
            weeks: u64::MAX,
            ..IntervalSpec::default()
        };
        assert_eq!(huge.total_seconds(), None);
    }

    #[test]
    fn once_es_alias_de_date() {
        let t: Trigger =
            serde_json::from_str(r#"{"type": "once", "run_date": "2024-03-10T09:00:00"}"#).unwrap();
        assert_eq!(t.kind(), "date");
    }
}
