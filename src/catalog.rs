use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    ops::Deref,
    path::Path,
    str::FromStr,
    sync::Arc,
};

use crate::error::{ConfigurationError, Error};

/// The name of a hardware or software event, such as `cycles`,
/// `instructions` or `fp_arith_inst_retired.256b_packed_double`.
pub type EventName = String;

/// An ordered, non-empty list of distinct events to count together.
///
/// The order of the events is the order of the values returned by
/// [`CounterBinding::stop`] and of the columns of a [`ResultTable`].
///
/// Cloning a catalog is cheap; every [`CounterBinding`] of a session shares
/// the same list.
///
/// ```no_run
/// use pmc_session::EventCatalog;
///
/// let catalog = EventCatalog::load("conf/events.cfg")?;
/// for event in catalog.iter() {
///     println!("{}", event);
/// }
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
///
/// [`CounterBinding`]: crate::CounterBinding
/// [`CounterBinding::stop`]: crate::CounterBinding::stop
/// [`ResultTable`]: crate::ResultTable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCatalog {
    events: Arc<[EventName]>,
}

impl EventCatalog {
    /// Read an event list file: one event per line, surrounding whitespace
    /// trimmed, blank lines ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let unreadable = || ConfigurationError::Unreadable(path.display().to_string());

        let file = File::open(path).map_err(|_| unreadable())?;
        Self::from_reader(BufReader::new(file)).map_err(|e| match e.kind() {
            crate::ErrorKind::Io(_) => unreadable().into(),
            _ => e,
        })
    }

    /// Read an event list from any buffered source.
    pub fn from_reader(source: impl BufRead) -> Result<Self, Error> {
        let mut events = Vec::new();
        for line in source.lines() {
            let line = line.map_err(|e| crate::error::new_io_error("event list", e))?;
            let name = line.trim();
            if !name.is_empty() {
                events.push(name.to_string());
            }
        }
        Self::new(events)
    }

    /// Build a catalog from already split event names.
    pub fn new<I, S>(events: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<EventName>,
    {
        let events: Vec<EventName> = events.into_iter().map(Into::into).collect();
        if events.is_empty() {
            return Err(ConfigurationError::Empty.into());
        }

        let mut seen = HashSet::with_capacity(events.len());
        for event in &events {
            if !seen.insert(event.as_str()) {
                return Err(ConfigurationError::Duplicate(event.clone()).into());
            }
        }

        Ok(EventCatalog {
            events: events.into(),
        })
    }

    /// Position of `event` in the catalog.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.iter().position(|e| e == event)
    }
}

impl Deref for EventCatalog {
    type Target = [EventName];

    fn deref(&self) -> &[EventName] {
        &self.events
    }
}

impl FromStr for EventCatalog {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_reader(s.as_bytes())
    }
}

impl fmt::Display for EventCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.events.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse_trims_and_skips_blank_lines() {
        let catalog: EventCatalog = "  cycles \n\ninstructions\r\n   \nbranch-misses"
            .parse()
            .unwrap();

        assert_eq!(&*catalog, &["cycles", "instructions", "branch-misses"]);
        assert_eq!(catalog.position("instructions"), Some(1));
        assert_eq!(catalog.position("nope"), None);
    }

    #[test]
    fn test_empty_list() {
        let err = "\n  \n".parse::<EventCatalog>().unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Configuration(ConfigurationError::Empty)
        );
    }

    #[test]
    fn test_duplicate_event() {
        let err = EventCatalog::new(vec!["cycles", "instructions", "cycles"]).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Configuration(ConfigurationError::Duplicate("cycles".to_string()))
        );
    }

    #[test]
    fn test_unreadable_file() {
        let err = EventCatalog::load("/definitely/not/here.cfg").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Configuration(ConfigurationError::Unreadable(
                "/definitely/not/here.cfg".to_string()
            ))
        );
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.cfg");
        std::fs::write(&path, "cycles\ninstructions\n").unwrap();

        let catalog = EventCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.to_string(), "cycles, instructions");
    }
}
