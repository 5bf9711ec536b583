//! SCPI capability adapters.
//!
//! Each adapter pairs an [`InstrumentSession`] with a dialect from
//! [`crate::instrument::dialect`] and implements one capability trait.
//! State-changing commands go through
//! [`InstrumentSession::write_and_wait`]; acquisition commands on the meter
//! do not, since `*OPC?` would block until the reading finished and hide the
//! status polling the sync engine relies on.

use crate::error::AppResult;
use crate::instrument::capabilities::{
    LoadControl, LoadMode, MeterControl, MeterFunction, ProtectionKind, ProtectionStatus,
    RegulationMode, ScopeControl, SourceControl, TopologyMode, TriggerSource,
};
use crate::instrument::dialect::{render, LoadDialect, MeterDialect, ScopeDialect, SourceDialect};
use crate::instrument::session::InstrumentSession;
use async_trait::async_trait;

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}

fn is_on(response: &str) -> bool {
    matches!(response.trim().to_uppercase().as_str(), "1" | "ON" | "+1")
}

// =============================================================================
// Source
// =============================================================================

/// Programmable source driven over SCPI.
#[derive(Debug)]
pub struct ScpiSource {
    session: InstrumentSession,
    dialect: SourceDialect,
    channel: u32,
}

impl ScpiSource {
    /// Bind a session to a dialect and output channel.
    pub fn new(session: InstrumentSession, dialect: SourceDialect, channel: u32) -> Self {
        Self {
            session,
            dialect,
            channel,
        }
    }

    async fn send(&self, template: &str, value: impl ToString + Send) -> AppResult<()> {
        let command = render(template, self.channel, value)?;
        self.session.write_and_wait(&command).await
    }

    async fn read(&self, template: &str) -> AppResult<f64> {
        let command = render(template, self.channel, "")?;
        self.session.query_f64(&command).await
    }

    async fn register(&self, template: &str) -> AppResult<u32> {
        let command = render(template, self.channel, "")?;
        self.session.query_u32(&command).await
    }
}

#[async_trait]
impl SourceControl for ScpiSource {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.send(self.dialect.set_voltage, volts).await
    }

    async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.send(self.dialect.set_current, amps).await
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.send(self.dialect.output, on_off(enabled)).await
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        self.read(self.dialect.measure_voltage).await
    }

    async fn measure_current(&self) -> AppResult<f64> {
        self.read(self.dialect.measure_current).await
    }

    async fn set_protection_level(&self, kind: ProtectionKind, level: f64) -> AppResult<()> {
        let template = match kind {
            ProtectionKind::Ovp => self.dialect.ovp_level,
            ProtectionKind::Ocp => self.dialect.ocp_level,
        };
        self.send(template, level).await
    }

    async fn set_protection_enabled(&self, kind: ProtectionKind, enabled: bool) -> AppResult<()> {
        let template = match kind {
            ProtectionKind::Ovp => self.dialect.ovp_state,
            ProtectionKind::Ocp => self.dialect.ocp_state,
        };
        self.send(template, on_off(enabled)).await
    }

    async fn protection_status(&self, kind: ProtectionKind) -> AppResult<ProtectionStatus> {
        let raw = self.register(self.dialect.questionable_status).await?;
        let tripped = match kind {
            ProtectionKind::Ovp => self.dialect.ov_tripped,
            ProtectionKind::Ocp => self.dialect.oc_tripped,
        };
        if tripped.matches(raw) {
            return Ok(ProtectionStatus::Tripped);
        }
        let command = render(self.dialect.output_state, self.channel, "")?;
        let state = self.session.query(&command).await?;
        Ok(if is_on(&state) {
            ProtectionStatus::Normal
        } else {
            ProtectionStatus::OutputOff
        })
    }

    async fn clear_protection(&self) -> AppResult<()> {
        self.send(self.dialect.clear_protection, "").await
    }

    async fn regulation_mode(&self) -> AppResult<RegulationMode> {
        let raw = self.register(self.dialect.operation_status).await?;
        Ok(if self.dialect.cv_mode.matches(raw) {
            RegulationMode::Cv
        } else if self.dialect.cc_mode.matches(raw) {
            RegulationMode::Cc
        } else {
            RegulationMode::Unregulated
        })
    }

    async fn set_topology(&self, mode: TopologyMode) -> AppResult<()> {
        let [independent, series, parallel] = self.dialect.topology_names;
        let name = match mode {
            TopologyMode::Independent => independent,
            TopologyMode::Series => series,
            TopologyMode::Parallel => parallel,
        };
        self.send(self.dialect.topology, name).await
    }

    async fn reset(&self) -> AppResult<()> {
        self.session.reset().await?;
        self.session.clear().await
    }
}

// =============================================================================
// Load
// =============================================================================

/// Electronic load driven over SCPI.
#[derive(Debug)]
pub struct ScpiLoad {
    session: InstrumentSession,
    dialect: LoadDialect,
    channel: u32,
}

impl ScpiLoad {
    /// Bind a session to a dialect and load channel.
    pub fn new(session: InstrumentSession, dialect: LoadDialect, channel: u32) -> Self {
        Self {
            session,
            dialect,
            channel,
        }
    }

    async fn select(&self) -> AppResult<()> {
        if let Some(template) = self.dialect.select_channel {
            let command = render(template, self.channel, "")?;
            self.session.write_and_wait(&command).await?;
        }
        Ok(())
    }

    async fn send(&self, template: &str, value: impl ToString + Send) -> AppResult<()> {
        self.select().await?;
        let command = render(template, self.channel, value)?;
        self.session.write_and_wait(&command).await
    }

    async fn read(&self, template: &str) -> AppResult<f64> {
        self.select().await?;
        let command = render(template, self.channel, "")?;
        self.session.query_f64(&command).await
    }
}

#[async_trait]
impl LoadControl for ScpiLoad {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn set_mode(&self, mode: LoadMode) -> AppResult<()> {
        let [cc, cv, cp, cr] = self.dialect.mode_names;
        let name = match mode {
            LoadMode::Cc => cc,
            LoadMode::Cv => cv,
            LoadMode::Cp => cp,
            LoadMode::Cr => cr,
        };
        self.send(self.dialect.mode, name).await
    }

    async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.send(self.dialect.set_current, amps).await
    }

    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.send(self.dialect.set_voltage, volts).await
    }

    async fn set_power(&self, watts: f64) -> AppResult<()> {
        self.send(self.dialect.set_power, watts).await
    }

    async fn set_input(&self, enabled: bool) -> AppResult<()> {
        let [on, off] = self.dialect.input_names;
        self.send(self.dialect.input, if enabled { on } else { off })
            .await
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        self.read(self.dialect.measure_voltage).await
    }

    async fn measure_current(&self) -> AppResult<f64> {
        self.read(self.dialect.measure_current).await
    }

    async fn reset(&self) -> AppResult<()> {
        self.session.reset().await?;
        self.session.clear().await
    }
}

// =============================================================================
// Meter
// =============================================================================

/// Reference DMM driven over SCPI.
#[derive(Debug)]
pub struct ScpiMeter {
    session: InstrumentSession,
    dialect: MeterDialect,
    trigger_source: TriggerSource,
}

impl ScpiMeter {
    /// Bind a session to a dialect and trigger source.
    pub fn new(
        session: InstrumentSession,
        dialect: MeterDialect,
        trigger_source: TriggerSource,
    ) -> Self {
        Self {
            session,
            dialect,
            trigger_source,
        }
    }
}

#[async_trait]
impl MeterControl for ScpiMeter {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn configure(&self, function: MeterFunction, nplc: f64) -> AppResult<()> {
        let (select, integration) = match function {
            MeterFunction::DcVoltage => (self.dialect.configure_voltage, self.dialect.nplc_voltage),
            MeterFunction::DcCurrent => (self.dialect.configure_current, self.dialect.nplc_current),
        };
        self.session.write_and_wait(select).await?;
        self.session
            .write_and_wait(&render(integration, 1, nplc)?)
            .await?;
        let source = match self.trigger_source {
            TriggerSource::Bus => "BUS",
            TriggerSource::Immediate => "IMM",
        };
        self.session
            .write_and_wait(&render(self.dialect.trigger_source, 1, source)?)
            .await
    }

    async fn initiate(&self) -> AppResult<()> {
        self.session.write(self.dialect.initiate).await
    }

    async fn trigger(&self) -> AppResult<()> {
        self.session.write(self.dialect.trigger).await
    }

    async fn operation_status(&self) -> AppResult<u32> {
        self.session.query_u32(self.dialect.operation_status).await
    }

    fn is_acquisition_complete(&self, raw_status: u32) -> bool {
        self.dialect.acquisition_complete.matches(raw_status)
    }

    async fn fetch(&self) -> AppResult<f64> {
        self.session.query_f64(self.dialect.fetch).await
    }

    fn trigger_source(&self) -> TriggerSource {
        self.trigger_source
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Oscilloscope driven over SCPI.
#[derive(Debug)]
pub struct ScpiScope {
    session: InstrumentSession,
    dialect: ScopeDialect,
}

impl ScpiScope {
    /// Bind a session to a dialect.
    pub fn new(session: InstrumentSession, dialect: ScopeDialect) -> Self {
        Self { session, dialect }
    }
}

#[async_trait]
impl ScopeControl for ScpiScope {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn measure_peak_to_peak(&self, channel: u32) -> AppResult<f64> {
        let command = render(self.dialect.measure_vpp, channel, "")?;
        self.session.query_f64(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::dialect::{CHROMA_63600, KEYSIGHT_34465A, KEYSIGHT_N6700};
    use crate::instrument::mock::ScriptedTransport;
    use std::sync::Arc;

    fn source(transport: &Arc<ScriptedTransport>) -> ScpiSource {
        ScpiSource::new(
            InstrumentSession::new("psu", transport.clone()),
            KEYSIGHT_N6700,
            2,
        )
    }

    #[tokio::test]
    async fn test_every_source_setting_waits_for_opc() {
        let transport = Arc::new(ScriptedTransport::new("psu"));
        let psu = source(&transport);

        psu.set_voltage(5.0).await.unwrap();
        psu.set_output(true).await.unwrap();
        psu.set_topology(TopologyMode::Independent).await.unwrap();

        assert_eq!(
            transport.log(),
            vec![
                "VOLT 5,(@2)",
                "*OPC?",
                "OUTP 1,(@2)",
                "*OPC?",
                "OUTP:PAIR OFF",
                "*OPC?"
            ]
        );
    }

    #[tokio::test]
    async fn test_protection_status_from_registers() {
        let transport = Arc::new(ScriptedTransport::new("psu"));
        let psu = source(&transport);

        transport.respond("STAT:QUES:COND? (@2)", "2");
        assert_eq!(
            psu.protection_status(ProtectionKind::Ocp).await.unwrap(),
            ProtectionStatus::Tripped
        );

        transport.respond("STAT:QUES:COND? (@2)", "0");
        transport.respond("OUTP? (@2)", "1");
        assert_eq!(
            psu.protection_status(ProtectionKind::Ovp).await.unwrap(),
            ProtectionStatus::Normal
        );

        transport.respond("OUTP? (@2)", "0");
        assert_eq!(
            psu.protection_status(ProtectionKind::Ovp).await.unwrap(),
            ProtectionStatus::OutputOff
        );
    }

    #[tokio::test]
    async fn test_regulation_mode_flags() {
        let transport = Arc::new(ScriptedTransport::new("psu"));
        let psu = source(&transport);

        transport.respond("STAT:OPER:COND? (@2)", "+2");
        assert_eq!(psu.regulation_mode().await.unwrap(), RegulationMode::Cc);

        transport.respond("STAT:OPER:COND? (@2)", "0");
        assert_eq!(
            psu.regulation_mode().await.unwrap(),
            RegulationMode::Unregulated
        );
    }

    #[tokio::test]
    async fn test_load_selects_channel_first() {
        let transport = Arc::new(ScriptedTransport::new("load"));
        let load = ScpiLoad::new(
            InstrumentSession::new("load", transport.clone()),
            CHROMA_63600,
            3,
        );

        load.set_mode(LoadMode::Cp).await.unwrap();

        assert_eq!(
            transport.log(),
            vec!["CHAN 3", "*OPC?", "MODE CPH", "*OPC?"]
        );
    }

    #[tokio::test]
    async fn test_meter_initiate_does_not_wait() {
        let transport = Arc::new(ScriptedTransport::new("dmm"));
        let dmm = ScpiMeter::new(
            InstrumentSession::new("dmm", transport.clone()),
            KEYSIGHT_34465A,
            TriggerSource::Bus,
        );

        dmm.initiate().await.unwrap();
        dmm.trigger().await.unwrap();

        assert_eq!(transport.log(), vec!["INIT", "*TRG"]);
        assert!(dmm.is_acquisition_complete(0));
        assert!(!dmm.is_acquisition_complete(1 << 4));
    }
}
