//! SCPI vocabulary of the pressure reference.
//!
//! Tokens are sent verbatim in the instrument's mixed-case long form.

pub const IDENTIFY: &str = "*IDN?";

pub const OUTPUT_STATE_QUERY: &str = "OUTPut:STATe?";
pub const OUTPUT_STATE_ON: &str = "OUTPut:STATe ON";

pub const PRESSURE_MODE_QUERY: &str = "OUTPut:PRESsure:MODE?";
pub const PRESSURE_MODE_CONTROL: &str = "OUTPut:PRESsure:MODE CONTrol";

pub const STATIC_MODE_QUERY: &str = "SOURce:PRESsure:STATic?";
pub const STATIC_MODE_OFF: &str = "SOURce:PRESsure:STATic 0";

pub const TOLERANCE_QUERY: &str = "SOURce:PRESsure:TOLerance?";

pub const MEASURE_PRESSURE: &str = "MEASure:PRESsure?";

/// Operation status register (bitmask).
pub const OPERATION_CONDITION: &str = "STATus:OPERation:CONDition?";

/// Operation-condition bit set once the regulated pressure has stabilised.
pub const SETTLED_BIT: u32 = 16;

/// `SOURce:PRESsure:TOLerance <value>`
pub fn set_tolerance(value: f64) -> String {
    format!("SOURce:PRESsure:TOLerance {value}")
}

/// `SOURce:PRESsure:LEVel:IMMediate:AMPLitude <value>`
///
/// Fire-and-forget: arrival at the setpoint is observed through the status register.
pub fn set_amplitude(value: f64) -> String {
    format!("SOURce:PRESsure:LEVel:IMMediate:AMPLitude {value}")
}
