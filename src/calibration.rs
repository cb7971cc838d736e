//! # RTD Calibration Table
//!
//! Maps raw MAX31865 RTD codes (15 bit, `0..32768`) to bath temperatures.
//!
//! The platinum RTD follows the Callendar–Van Dusen equation:
//!
//! ```text
//! R(T) / R0 = 1 + A·T + B·T² + C·(T − 100)·T³    (T < 0 °C)
//! R(T) / R0 = 1 + A·T + B·T²                     (T ≥ 0 °C)
//! ```
//!
//! The inverse has no closed form, so every stored entry is solved with
//! Newton–Raphson against the analytic derivative. Only the codes whose
//! resistance lies inside `[R(temperature_min), R(temperature_max)]` are
//! stored; everything outside clamps to the configured bounds at lookup.
//!
//! ## Example
//!
//! ```rust
//! use sousvide_rs::calibration::{CalibrationTable, RtdParameters};
//!
//! let table = CalibrationTable::build(&RtdParameters {
//!     r0: 1000.0,
//!     reference_resistance: 3600.0,
//!     temperature_min: 0.0,
//!     temperature_max: 100.0,
//! })
//! .unwrap();
//! assert_eq!(table.lookup(0), 0.0);
//! assert_eq!(table.lookup(32767), 100.0);
//! ```

use thiserror::Error;

/// Callendar–Van Dusen coefficients for IEC 60751 platinum.
pub const CVD_A: f64 = 3.9083e-3;
pub const CVD_B: f64 = -5.775e-7;
pub const CVD_C: f64 = -4.183e-12;

/// Number of distinct codes the 15-bit RTD register can hold.
pub const CODE_RANGE: u32 = 32768;

/// Newton stops once the resistance residual drops below this (ohms).
pub const NEWTON_TOLERANCE: f64 = 1e-6;
const NEWTON_MAX_ITERATIONS: usize = 100;

/// Smallest nominal resistance accepted for a standard RTD (Pt100 and up).
const MIN_R0: f64 = 100.0;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("R0 too small ({0} < 100)")]
    R0TooSmall(f64),
    #[error("reference resistance smaller than R0 ({reference} < {r0})")]
    ReferenceBelowR0 { reference: f64, r0: f64 },
    #[error("invalid temperature boundaries ({min} >= {max})")]
    InvalidBounds { min: f64, max: f64 },
    #[error("no sensor code falls between {min} and {max} °C with this reference resistor")]
    EmptyRange { min: f64, max: f64 },
    #[error("Newton iteration did not converge for {resistance} ohm")]
    NoConvergence { resistance: f64 },
}

/// Physical parameters of the sensor front end and the table bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtdParameters {
    /// Nominal RTD resistance at 0 °C (ohms).
    pub r0: f64,
    /// Reference resistor on the MAX31865 (ohms).
    pub reference_resistance: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
}

/// Resistance of the RTD at `temperature` (°C).
pub fn resistance_at(temperature: f64, r0: f64) -> f64 {
    let t = temperature;
    let ratio = if t < 0.0 {
        1.0 + CVD_A * t + CVD_B * t * t + CVD_C * (t - 100.0) * t * t * t
    } else {
        1.0 + CVD_A * t + CVD_B * t * t
    };
    r0 * ratio
}

/// dR/dT of [`resistance_at`].
fn resistance_slope(temperature: f64, r0: f64) -> f64 {
    let t = temperature;
    let slope = if t < 0.0 {
        CVD_A + 2.0 * CVD_B * t + CVD_C * (4.0 * t * t * t - 300.0 * t * t)
    } else {
        CVD_A + 2.0 * CVD_B * t
    };
    r0 * slope
}

/// Solve `R(T) = resistance` for `T`.
pub fn solve_temperature(resistance: f64, r0: f64) -> Result<f64, CalibrationError> {
    // Linear model is within a few degrees over the useful range
    let mut t = (resistance / r0 - 1.0) / CVD_A;
    for _ in 0..NEWTON_MAX_ITERATIONS {
        let residual = resistance - resistance_at(t, r0);
        if residual.abs() < NEWTON_TOLERANCE {
            return Ok(t);
        }
        t += residual / resistance_slope(t, r0);
    }
    Err(CalibrationError::NoConvergence { resistance })
}

/// Resistance represented by a raw RTD code.
pub fn code_to_resistance(code: u16, reference_resistance: f64) -> f64 {
    f64::from(code) * reference_resistance / f64::from(CODE_RANGE)
}

/// Immutable code → temperature table.
#[derive(Debug, Clone)]
pub struct CalibrationTable {
    base: u16,
    temperatures: Vec<f64>,
    min_temp: f64,
    max_temp: f64,
}

impl CalibrationTable {
    /// Solve every in-range code. Either the whole table is built or an error
    /// is returned.
    pub fn build(params: &RtdParameters) -> Result<Self, CalibrationError> {
        let RtdParameters {
            r0,
            reference_resistance,
            temperature_min,
            temperature_max,
        } = *params;

        if !(r0 >= MIN_R0) {
            return Err(CalibrationError::R0TooSmall(r0));
        }
        if reference_resistance < r0 {
            return Err(CalibrationError::ReferenceBelowR0 {
                reference: reference_resistance,
                r0,
            });
        }
        if !(temperature_min < temperature_max) {
            return Err(CalibrationError::InvalidBounds {
                min: temperature_min,
                max: temperature_max,
            });
        }

        let ohms_per_code = reference_resistance / f64::from(CODE_RANGE);
        let r_min = resistance_at(temperature_min, r0);
        let r_max = resistance_at(temperature_max, r0);

        // First code at or above R(min), last code at or below R(max)
        let first = (r_min / ohms_per_code).ceil().max(0.0);
        let last = (r_max / ohms_per_code)
            .floor()
            .min(f64::from(CODE_RANGE - 1));
        if first > last {
            return Err(CalibrationError::EmptyRange {
                min: temperature_min,
                max: temperature_max,
            });
        }
        let first = first as u16;
        let last = last as u16;

        let mut temperatures = Vec::with_capacity(usize::from(last - first) + 1);
        for code in first..=last {
            let resistance = code_to_resistance(code, reference_resistance);
            let t = solve_temperature(resistance, r0)?;
            temperatures.push(t.clamp(temperature_min, temperature_max));
        }

        tracing::debug!(
            "Calibration table: codes {}..={} ({} entries) for {:.1}..{:.1} °C",
            first,
            last,
            temperatures.len(),
            temperature_min,
            temperature_max
        );

        Ok(Self {
            base: first,
            temperatures,
            min_temp: temperature_min,
            max_temp: temperature_max,
        })
    }

    /// Temperature for a raw code; codes outside the stored window clamp.
    #[inline]
    pub fn lookup(&self, code: u16) -> f64 {
        if code < self.base {
            return self.min_temp;
        }
        match self.temperatures.get(usize::from(code - self.base)) {
            Some(t) => *t,
            None => self.max_temp,
        }
    }

    /// First stored code.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Number of stored codes.
    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    pub fn min_temp(&self) -> f64 {
        self.min_temp
    }

    pub fn max_temp(&self) -> f64 {
        self.max_temp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slope_matches_finite_difference() {
        for t in [-150.0, -40.0, -0.5, 0.0, 25.0, 60.0, 180.0] {
            let h = 1e-4;
            let numeric = (resistance_at(t + h, 1000.0) - resistance_at(t - h, 1000.0)) / (2.0 * h);
            assert!((numeric - resistance_slope(t, 1000.0)).abs() < 1e-4, "t = {}", t);
        }
    }

    #[test]
    fn test_known_pt100_points() {
        // IEC 60751 reference values
        assert!((resistance_at(0.0, 100.0) - 100.0).abs() < 1e-9);
        assert!((resistance_at(100.0, 100.0) - 138.5055).abs() < 1e-3);
        assert!((resistance_at(-100.0, 100.0) - 60.2558).abs() < 1e-3);
    }

    #[test]
    fn test_code_to_resistance_is_linear() {
        assert_eq!(code_to_resistance(0, 3600.0), 0.0);
        assert_eq!(code_to_resistance(16384, 3600.0), 1800.0);
    }
}
