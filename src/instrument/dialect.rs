//! Built-in SCPI dialect table.
//!
//! Command templates use `{ch}` and `{value}` placeholders and are rendered
//! with `strfmt`. Status registers are interpreted through [`StatusBit`]
//! predicates so engines never see vendor bit layouts.

use crate::error::{AppResult, BenchError};
use std::collections::HashMap;
use strfmt::strfmt;

/// A predicate over one raw status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBit {
    /// Bits to inspect.
    pub mask: u32,
    /// True when the condition holds with the bits set; false when it holds
    /// with all of them clear.
    pub when_set: bool,
}

impl StatusBit {
    /// Condition holds when any masked bit is set.
    pub const fn set(mask: u32) -> Self {
        Self {
            mask,
            when_set: true,
        }
    }

    /// Condition holds when every masked bit is clear.
    pub const fn clear(mask: u32) -> Self {
        Self {
            mask,
            when_set: false,
        }
    }

    /// Evaluate against a raw register value.
    pub fn matches(&self, raw: u32) -> bool {
        let any_set = raw & self.mask != 0;
        any_set == self.when_set
    }
}

/// Commands and status layout for a programmable source.
#[derive(Debug, Clone)]
pub struct SourceDialect {
    /// Dialect name for logs.
    pub name: &'static str,
    /// Voltage set-point.
    pub set_voltage: &'static str,
    /// Current set-point / limit.
    pub set_current: &'static str,
    /// Output state, `{value}` is `1` or `0`.
    pub output: &'static str,
    /// Output voltage read-back.
    pub measure_voltage: &'static str,
    /// Output current read-back.
    pub measure_current: &'static str,
    /// Output state query.
    pub output_state: &'static str,
    /// OVP level.
    pub ovp_level: &'static str,
    /// OVP arm, `{value}` is `1` or `0`.
    pub ovp_state: &'static str,
    /// OCP level.
    pub ocp_level: &'static str,
    /// OCP arm, `{value}` is `1` or `0`.
    pub ocp_state: &'static str,
    /// Clear latched protection.
    pub clear_protection: &'static str,
    /// Questionable-condition register query.
    pub questionable_status: &'static str,
    /// Operation-condition register query.
    pub operation_status: &'static str,
    /// Channel grouping, `{value}` from the topology names below.
    pub topology: &'static str,
    /// Topology names: independent, series, parallel.
    pub topology_names: [&'static str; 3],
    /// OV latched, questionable register.
    pub ov_tripped: StatusBit,
    /// OC latched, questionable register.
    pub oc_tripped: StatusBit,
    /// CV flag, operation register.
    pub cv_mode: StatusBit,
    /// CC flag, operation register.
    pub cc_mode: StatusBit,
}

/// Commands for an electronic load.
#[derive(Debug, Clone)]
pub struct LoadDialect {
    /// Dialect name for logs.
    pub name: &'static str,
    /// Channel select sent before channel-scoped commands, if the load needs one.
    pub select_channel: Option<&'static str>,
    /// Mode select.
    pub mode: &'static str,
    /// Mode names: CC, CV, CP, CR.
    pub mode_names: [&'static str; 4],
    /// CC set-point.
    pub set_current: &'static str,
    /// CV set-point.
    pub set_voltage: &'static str,
    /// CP set-point.
    pub set_power: &'static str,
    /// Input state, `{value}` from `input_names`.
    pub input: &'static str,
    /// Input state names: on, off.
    pub input_names: [&'static str; 2],
    /// Input voltage read-back.
    pub measure_voltage: &'static str,
    /// Input current read-back.
    pub measure_current: &'static str,
}

/// Commands and status layout for a reference meter.
#[derive(Debug, Clone)]
pub struct MeterDialect {
    /// Dialect name for logs.
    pub name: &'static str,
    /// Select DC voltage.
    pub configure_voltage: &'static str,
    /// Select DC current.
    pub configure_current: &'static str,
    /// Integration time for the voltage function.
    pub nplc_voltage: &'static str,
    /// Integration time for the current function.
    pub nplc_current: &'static str,
    /// Trigger source, `{value}` is `BUS` or `IMM`.
    pub trigger_source: &'static str,
    /// Arm.
    pub initiate: &'static str,
    /// Bus trigger.
    pub trigger: &'static str,
    /// Operation-condition register query.
    pub operation_status: &'static str,
    /// Acquisition complete predicate.
    pub acquisition_complete: StatusBit,
    /// Fetch the completed reading.
    pub fetch: &'static str,
}

/// Commands for an oscilloscope.
#[derive(Debug, Clone)]
pub struct ScopeDialect {
    /// Dialect name for logs.
    pub name: &'static str,
    /// Peak-to-peak measurement query.
    pub measure_vpp: &'static str,
}

/// Keysight N6700 modular power system.
pub const KEYSIGHT_N6700: SourceDialect = SourceDialect {
    name: "Keysight N6700",
    set_voltage: "VOLT {value},(@{ch})",
    set_current: "CURR {value},(@{ch})",
    output: "OUTP {value},(@{ch})",
    measure_voltage: "MEAS:VOLT? (@{ch})",
    measure_current: "MEAS:CURR? (@{ch})",
    output_state: "OUTP? (@{ch})",
    ovp_level: "VOLT:PROT {value},(@{ch})",
    ovp_state: "VOLT:PROT:REM {value},(@{ch})",
    ocp_level: "CURR:LIM {value},(@{ch})",
    ocp_state: "CURR:PROT:STAT {value},(@{ch})",
    clear_protection: "OUTP:PROT:CLE (@{ch})",
    questionable_status: "STAT:QUES:COND? (@{ch})",
    operation_status: "STAT:OPER:COND? (@{ch})",
    topology: "OUTP:PAIR {value}",
    topology_names: ["OFF", "SER", "PAR"],
    ov_tripped: StatusBit::set(1 << 0),
    oc_tripped: StatusBit::set(1 << 1),
    cv_mode: StatusBit::set(1 << 0),
    cc_mode: StatusBit::set(1 << 1),
};

/// Chroma 63600 series modular load.
pub const CHROMA_63600: LoadDialect = LoadDialect {
    name: "Chroma 63600",
    select_channel: Some("CHAN {ch}"),
    mode: "MODE {value}",
    mode_names: ["CCH", "CVH", "CPH", "CRH"],
    set_current: "CURR:STAT:L1 {value}",
    set_voltage: "VOLT:STAT:L1 {value}",
    set_power: "POW:STAT:L1 {value}",
    input: "LOAD {value}",
    input_names: ["ON", "OFF"],
    measure_voltage: "MEAS:VOLT?",
    measure_current: "MEAS:CURR?",
};

/// Keysight 34465A Truevolt DMM.
pub const KEYSIGHT_34465A: MeterDialect = MeterDialect {
    name: "Keysight 34465A",
    configure_voltage: "CONF:VOLT:DC AUTO",
    configure_current: "CONF:CURR:DC AUTO",
    nplc_voltage: "VOLT:DC:NPLC {value}",
    nplc_current: "CURR:DC:NPLC {value}",
    trigger_source: "TRIG:SOUR {value}",
    initiate: "INIT",
    trigger: "*TRG",
    operation_status: "STAT:OPER:COND?",
    // Bit 4 measuring, bit 5 waiting for trigger.
    acquisition_complete: StatusBit::clear((1 << 4) | (1 << 5)),
    fetch: "FETC?",
};

/// Keysight InfiniiVision DSOX scopes.
pub const KEYSIGHT_DSOX: ScopeDialect = ScopeDialect {
    name: "Keysight DSOX",
    measure_vpp: ":MEAS:VPP? CHAN{ch}",
};

/// Render a template with channel and value.
pub fn render(template: &str, channel: u32, value: impl ToString) -> AppResult<String> {
    let mut vars = HashMap::new();
    vars.insert("ch".to_string(), channel.to_string());
    vars.insert("value".to_string(), value.to_string());
    strfmt(template, &vars).map_err(|e| {
        BenchError::Internal(format!("Failed to format command '{template}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders() {
        let cmd = render(KEYSIGHT_N6700.set_voltage, 2, 12.5).unwrap();
        assert_eq!(cmd, "VOLT 12.5,(@2)");

        let cmd = render(KEYSIGHT_34465A.fetch, 1, "").unwrap();
        assert_eq!(cmd, "FETC?");
    }

    #[test]
    fn test_status_bits() {
        assert!(KEYSIGHT_N6700.ov_tripped.matches(0b01));
        assert!(!KEYSIGHT_N6700.ov_tripped.matches(0b10));
        assert!(KEYSIGHT_N6700.oc_tripped.matches(0b10));

        let done = KEYSIGHT_34465A.acquisition_complete;
        assert!(!done.matches(1 << 4));
        assert!(!done.matches(1 << 5));
        assert!(done.matches(1 << 9));
    }
}
