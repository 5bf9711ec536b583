//! Instruments: sessions, capability traits, dialects and the registry.

pub mod capabilities;
pub mod dialect;
pub mod mock;
pub mod registry;
pub mod scpi;
pub mod session;

use crate::config::{InstrumentDefinition, InstrumentsConfig};
use capabilities::{LoadControl, MeterControl, ScopeControl, SourceControl};
use std::fmt;
use std::sync::Arc;

/// The part an instrument plays on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentRole {
    /// Device under test.
    Source,
    /// Electronic load.
    Load,
    /// Reference meter.
    Meter,
    /// Oscilloscope.
    Scope,
    /// Supply feeding the DUT input.
    LineSupply,
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentRole::Source => "source",
            InstrumentRole::Load => "load",
            InstrumentRole::Meter => "meter",
            InstrumentRole::Scope => "scope",
            InstrumentRole::LineSupply => "line_supply",
        };
        f.write_str(name)
    }
}

impl InstrumentsConfig {
    /// Every configured role with its definition.
    pub fn assignments(&self) -> Vec<(InstrumentRole, &InstrumentDefinition)> {
        let mut roles = vec![
            (InstrumentRole::Source, &self.source),
            (InstrumentRole::Load, &self.load),
            (InstrumentRole::Meter, &self.meter),
        ];
        if let Some(scope) = &self.scope {
            roles.push((InstrumentRole::Scope, scope));
        }
        if let Some(line) = &self.line_supply {
            roles.push((InstrumentRole::LineSupply, line));
        }
        roles
    }
}

/// The instruments one run owns.
#[derive(Clone)]
pub struct InstrumentSet {
    /// Device under test.
    pub source: Arc<dyn SourceControl>,
    /// Electronic load.
    pub load: Arc<dyn LoadControl>,
    /// Reference meter.
    pub meter: Arc<dyn MeterControl>,
    /// Optional oscilloscope.
    pub scope: Option<Arc<dyn ScopeControl>>,
    /// Optional line supply.
    pub line_supply: Option<Arc<dyn SourceControl>>,
}

impl fmt::Debug for InstrumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSet")
            .field("source", &self.source.name())
            .field("load", &self.load.name())
            .field("meter", &self.meter.name())
            .field("scope", &self.scope.as_ref().map(|s| s.name().to_string()))
            .field(
                "line_supply",
                &self.line_supply.as_ref().map(|s| s.name().to_string()),
            )
            .finish()
    }
}
