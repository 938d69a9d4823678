//! Named statistics collection.
//!
//! Components expose `collect_stats(&self, scope)` and push their
//! counters into a [`StatSet`] under a hierarchical name; the system
//! prints one line per stat in the form
//!
//! ```text
//! i<interval>.<qualified.name> <value>[\t; units]
//! ```
//!
//! Printing never mutates the components; resetting walks the same
//! component tree through `reset_stats`.

use std::fmt;
use std::io::{self, Write};

#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Counter(u64),
    Gauge(f64),
    Text(String),
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Counter(v) => write!(f, "{}", v),
            StatValue::Gauge(v) => write!(f, "{}", v),
            StatValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Counter(v)
    }
}

impl From<u32> for StatValue {
    fn from(v: u32) -> Self {
        StatValue::Counter(v as u64)
    }
}

impl From<usize> for StatValue {
    fn from(v: usize) -> Self {
        StatValue::Counter(v as u64)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Gauge(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_owned())
    }
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub name: String,
    pub value: StatValue,
    pub units: Option<&'static str>,
}

/// A flat collection of qualified stats gathered in one pass.
#[derive(Debug, Default)]
pub struct StatSet {
    entries: Vec<Stat>,
}

impl StatSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root scope for collection.
    pub fn scope(&mut self, prefix: &str) -> StatScope<'_> {
        StatScope {
            set: self,
            prefix: prefix.to_owned(),
        }
    }

    pub fn entries(&self) -> &[Stat] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&Stat> {
        self.entries.iter().find(|s| s.name == name)
    }

    /// Write every stat, one per line, prefixed with the interval tag.
    pub fn print(&self, interval: u64, out: &mut dyn Write) -> io::Result<()> {
        for stat in &self.entries {
            match stat.units {
                Some(units) => {
                    writeln!(out, "i{}.{} {}\t; {}", interval, stat.name, stat.value, units)?
                }
                None => writeln!(out, "i{}.{} {}", interval, stat.name, stat.value)?,
            }
        }
        Ok(())
    }
}

/// A naming scope within a [`StatSet`].
pub struct StatScope<'a> {
    set: &'a mut StatSet,
    prefix: String,
}

impl StatScope<'_> {
    /// A child scope named `<prefix>.<name>`.
    pub fn sub(&mut self, name: &str) -> StatScope<'_> {
        let prefix = if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        StatScope {
            set: &mut *self.set,
            prefix,
        }
    }

    pub fn record(&mut self, name: &str, value: impl Into<StatValue>) {
        self.record_units(name, value, None);
    }

    pub fn record_units(
        &mut self,
        name: &str,
        value: impl Into<StatValue>,
        units: Option<&'static str>,
    ) {
        let qualified = if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        self.set.entries.push(Stat {
            name: qualified,
            value: value.into(),
            units,
        });
    }
}
