//! Instrument Registry
//!
//! Maps configured instrument kinds onto capability implementations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         InstrumentSet                        │
//! │  source | load | meter | scope? | line_supply?               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      Capability Traits                       │
//! │  SourceControl | LoadControl | MeterControl | ScopeControl   │
//! ├──────────────────────────────────────────────────────────────┤
//! │              SCPI adapters + dialect table                   │
//! │  ScpiSource | ScpiLoad | ScpiMeter | ScpiScope | Simulated   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Known Instruments
//!
//! | Kind | Roles | Dialect |
//! |------|-------|---------|
//! | `keysight_n6700` | source, line_supply | [`KEYSIGHT_N6700`] |
//! | `chroma_63600` | load | [`CHROMA_63600`] |
//! | `keysight_34465a` | meter | [`KEYSIGHT_34465A`] |
//! | `keysight_dsox` | scope | [`KEYSIGHT_DSOX`] |
//! | `simulated` | every role | shared [`SimulatedBench`] |

use crate::config::{InstrumentDefinition, TestConfig};
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{LoadControl, MeterControl, ScopeControl, SourceControl};
use crate::instrument::dialect::{CHROMA_63600, KEYSIGHT_34465A, KEYSIGHT_DSOX, KEYSIGHT_N6700};
use crate::instrument::mock::SimulatedBench;
use crate::instrument::scpi::{ScpiLoad, ScpiMeter, ScpiScope, ScpiSource};
use crate::instrument::session::{InstrumentSession, TcpScpiTransport};
use crate::instrument::{InstrumentRole, InstrumentSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Supported instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Keysight N6700 modular DC power system.
    #[serde(rename = "keysight_n6700")]
    KeysightN6700,
    /// Chroma 63600 modular DC electronic load.
    #[serde(rename = "chroma_63600")]
    Chroma63600,
    /// Keysight 34465A digital multimeter.
    #[serde(rename = "keysight_34465a")]
    Keysight34465A,
    /// Keysight InfiniiVision DSOX oscilloscope.
    #[serde(rename = "keysight_dsox")]
    KeysightDsox,
    /// In-process simulation.
    #[serde(rename = "simulated")]
    Simulated,
}

impl InstrumentKind {
    /// Configuration name of this kind.
    pub fn kind_name(self) -> &'static str {
        match self {
            InstrumentKind::KeysightN6700 => "keysight_n6700",
            InstrumentKind::Chroma63600 => "chroma_63600",
            InstrumentKind::Keysight34465A => "keysight_34465a",
            InstrumentKind::KeysightDsox => "keysight_dsox",
            InstrumentKind::Simulated => "simulated",
        }
    }

    /// Roles this kind can play.
    pub fn roles(self) -> &'static [InstrumentRole] {
        match self {
            InstrumentKind::KeysightN6700 => &[InstrumentRole::Source, InstrumentRole::LineSupply],
            InstrumentKind::Chroma63600 => &[InstrumentRole::Load],
            InstrumentKind::Keysight34465A => &[InstrumentRole::Meter],
            InstrumentKind::KeysightDsox => &[InstrumentRole::Scope],
            InstrumentKind::Simulated => &[
                InstrumentRole::Source,
                InstrumentRole::Load,
                InstrumentRole::Meter,
                InstrumentRole::Scope,
                InstrumentRole::LineSupply,
            ],
        }
    }

    /// `ConfigValidation` unless this kind can play `role`.
    pub fn check_role(self, role: InstrumentRole) -> AppResult<()> {
        if self.roles().contains(&role) {
            Ok(())
        } else {
            Err(BenchError::ConfigValidation(format!(
                "Instrument kind '{}' cannot act as {role}",
                self.kind_name()
            )))
        }
    }
}

async fn open_session(
    role: InstrumentRole,
    def: &InstrumentDefinition,
) -> AppResult<InstrumentSession> {
    let name = role.to_string();
    let transport = TcpScpiTransport::connect(&name, &def.address, def.timeout).await?;
    Ok(InstrumentSession::new(name, Arc::new(transport)))
}

async fn build_source(
    role: InstrumentRole,
    def: &InstrumentDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn SourceControl>> {
    def.kind.check_role(role)?;
    let source: Arc<dyn SourceControl> = match def.kind {
        InstrumentKind::Simulated if role == InstrumentRole::LineSupply => {
            Arc::new(bench.line_supply(&role.to_string()))
        }
        InstrumentKind::Simulated => Arc::new(bench.source(&role.to_string())),
        _ => Arc::new(ScpiSource::new(
            open_session(role, def).await?,
            KEYSIGHT_N6700,
            def.channel,
        )),
    };
    Ok(source)
}

async fn build_load(
    def: &InstrumentDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn LoadControl>> {
    let role = InstrumentRole::Load;
    def.kind.check_role(role)?;
    let load: Arc<dyn LoadControl> = match def.kind {
        InstrumentKind::Simulated => Arc::new(bench.load(&role.to_string())),
        _ => Arc::new(ScpiLoad::new(
            open_session(role, def).await?,
            CHROMA_63600,
            def.channel,
        )),
    };
    Ok(load)
}

async fn build_meter(
    def: &InstrumentDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn MeterControl>> {
    let role = InstrumentRole::Meter;
    def.kind.check_role(role)?;
    let meter: Arc<dyn MeterControl> = match def.kind {
        InstrumentKind::Simulated => Arc::new(bench.meter(&role.to_string(), def.trigger)),
        _ => Arc::new(ScpiMeter::new(
            open_session(role, def).await?,
            KEYSIGHT_34465A,
            def.trigger,
        )),
    };
    Ok(meter)
}

async fn build_scope(
    def: &InstrumentDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn ScopeControl>> {
    let role = InstrumentRole::Scope;
    def.kind.check_role(role)?;
    let scope: Arc<dyn ScopeControl> = match def.kind {
        InstrumentKind::Simulated => Arc::new(bench.scope(&role.to_string())),
        _ => Arc::new(ScpiScope::new(open_session(role, def).await?, KEYSIGHT_DSOX)),
    };
    Ok(scope)
}

/// Connect every configured instrument.
///
/// Simulated roles share one [`SimulatedBench`] built from
/// `[simulation]`. Roles are checked before any connection is opened.
pub async fn connect(config: &TestConfig) -> AppResult<InstrumentSet> {
    let instruments = &config.instruments;
    for (role, def) in instruments.assignments() {
        def.kind.check_role(role)?;
    }

    let bench = SimulatedBench::new(&config.simulation);
    let source = build_source(InstrumentRole::Source, &instruments.source, &bench).await?;
    let load = build_load(&instruments.load, &bench).await?;
    let meter = build_meter(&instruments.meter, &bench).await?;
    let scope = match &instruments.scope {
        Some(def) => Some(build_scope(def, &bench).await?),
        None => None,
    };
    let line_supply = match &instruments.line_supply {
        Some(def) => Some(build_source(InstrumentRole::LineSupply, def, &bench).await?),
        None => None,
    };

    tracing::info!(
        source = instruments.source.kind.kind_name(),
        load = instruments.load.kind.kind_name(),
        meter = instruments.meter.kind.kind_name(),
        scope = scope.is_some(),
        line_supply = line_supply.is_some(),
        "Instrument set ready"
    );

    Ok(InstrumentSet {
        source,
        load,
        meter,
        scope,
        line_supply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_per_kind() {
        assert!(InstrumentKind::KeysightN6700
            .check_role(InstrumentRole::LineSupply)
            .is_ok());
        let err = InstrumentKind::Chroma63600
            .check_role(InstrumentRole::Meter)
            .unwrap_err();
        assert!(matches!(err, BenchError::ConfigValidation(_)));
        assert!(err.to_string().contains("cannot act as meter"));
    }

    #[tokio::test]
    async fn test_connect_simulated_set() {
        let config = TestConfig::from_flat_map([
            ("instruments.source.kind", "simulated"),
            ("instruments.load.kind", "simulated"),
            ("instruments.meter.kind", "simulated"),
            ("instruments.scope.kind", "simulated"),
        ])
        .unwrap();

        let set = connect(&config).await.unwrap();
        assert_eq!(set.source.name(), "source");
        assert!(set.scope.is_some());
        assert!(set.line_supply.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_role_before_io() {
        let config = TestConfig::from_flat_map([
            ("instruments.source.kind", "keysight_34465a"),
            ("instruments.source.address", "192.0.2.1"),
            ("instruments.load.kind", "simulated"),
            ("instruments.meter.kind", "simulated"),
        ])
        .unwrap();

        let err = connect(&config).await.err().unwrap();
        assert!(matches!(err, BenchError::ConfigValidation(_)));
    }
}
