use std::{fmt, str::FromStr};

use crate::{
    catalog::EventName,
    cpu::CpuId,
    error::{new_error, Error, ErrorKind},
};

/// One event count read from one CPU at the end of a measurement.
///
/// A sample is written to a record file as a single `CPU:Value:Unit:Event`
/// line (see [`ResultSink`]); `Display` and `FromStr` convert between the
/// two. The unit is empty for plain event counts.
///
/// ```
/// use pmc_session::RawSample;
///
/// let sample: RawSample = "2:1234::instructions".parse()?;
/// assert_eq!(sample.cpu, 2);
/// assert_eq!(sample.value, 1234);
/// assert_eq!(sample.unit, None);
/// assert_eq!(sample.to_string(), "2:1234::instructions");
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
///
/// [`ResultSink`]: crate::ResultSink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub cpu: CpuId,
    pub value: i64,
    pub unit: Option<String>,
    pub event: EventName,
}

impl RawSample {
    pub fn new(cpu: CpuId, value: i64, unit: Option<String>, event: impl Into<EventName>) -> Self {
        RawSample {
            cpu,
            value,
            unit,
            event: event.into(),
        }
    }
}

impl fmt::Display for RawSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.cpu,
            self.value,
            self.unit.as_deref().unwrap_or(""),
            self.event
        )
    }
}

impl FromStr for RawSample {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Error> {
        let bad = |why: &str| {
            new_error(ErrorKind::MalformedInput(format!(
                "{} in record {:?}",
                why, line
            )))
        };

        // Event names may contain ':' themselves (perf::CYCLES), so the last
        // field takes the rest of the line.
        let mut fields = line.trim_end_matches(&['\r', '\n'][..]).splitn(4, ':');
        let (cpu, value, unit, event) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(cpu), Some(value), Some(unit), Some(event)) => (cpu, value, unit, event),
            _ => return Err(bad("expected 4 fields")),
        };

        let cpu = cpu.trim().parse().map_err(|_| bad("invalid cpu"))?;
        let value = value.trim().parse().map_err(|_| bad("invalid value"))?;
        let event = event.trim();
        if event.is_empty() {
            return Err(bad("missing event name"));
        }

        Ok(RawSample {
            cpu,
            value,
            unit: match unit.trim() {
                "" => None,
                u => Some(u.to_string()),
            },
            event: event.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_unit() {
        let sample = RawSample::new(0, 1_500_000, Some("ns".to_string()), "task-clock");
        assert_eq!(sample.to_string(), "0:1500000:ns:task-clock");
    }

    #[test]
    fn test_parse_event_with_colons() {
        let sample: RawSample = "12:-3::perf::CYCLES".parse().unwrap();
        assert_eq!(sample, RawSample::new(12, -3, None, "perf::CYCLES"));
    }

    #[test]
    fn test_parse_malformed() {
        for line in &["", "0:1:cycles", "x:1::cycles", "0:y::cycles", "0:1::", "-1:1::cycles"] {
            let err = line.parse::<RawSample>().unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::MalformedInput(_)),
                "{:?} parsed",
                line
            );
        }
    }
}
