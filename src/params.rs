//! Immutable parameter bundles shared by the battery sub-models.
//!
//! Bundles are built once per simulation, validated at construction, and only
//! ever borrowed by the models. Units are explicit in field names: A, Ah, V,
//! kW, hours, kelvin; percentages run 0-100 unless the name says fraction.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::StorageError;
use crate::utils::{HOURS_PER_YEAR, T_MAX_K};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Chemistry {
    LeadAcid,
    LithiumIon,
    VanadiumRedox,
}

/// Simulation time resolution and horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeParams {
    pub dt_hour: f64,
    pub steps_per_hour: usize,
    pub years: usize,
    pub lifetime_output: bool,
}

impl TimeParams {
    pub fn new(dt_hour: f64, years: usize) -> Result<Self, StorageError> {
        if !(dt_hour > 0.0 && dt_hour <= 1.0) {
            return Err(StorageError::invalid(
                "time.dt_hour",
                format!("must be in (0, 1] hours, got {dt_hour}"),
            ));
        }
        let steps = 1.0 / dt_hour;
        if (steps - steps.round()).abs() > 1e-9 {
            return Err(StorageError::invalid(
                "time.dt_hour",
                format!("must divide one hour evenly, got {dt_hour}"),
            ));
        }
        if years == 0 {
            return Err(StorageError::invalid("time.years", "must be at least 1"));
        }
        Ok(Self {
            dt_hour,
            steps_per_hour: steps.round() as usize,
            years,
            lifetime_output: years > 1,
        })
    }
}

/// Reference discharge points used to fit the KiBaM rate constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KibamReference {
    /// Capacity at the 20-hour discharge rate [Ah].
    pub q20: f64,
    /// Capacity at the 10-hour discharge rate [Ah].
    pub q10: f64,
    /// Capacity at the `t1`-hour discharge rate [Ah].
    pub q1: f64,
    /// Discharge duration for `q1` [h].
    pub t1: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityParams {
    pub chemistry: Chemistry,
    /// Nameplate maximum charge [Ah].
    pub qmax_nominal: f64,
    pub soc_init: f64,
    pub soc_min: f64,
    pub soc_max: f64,
    /// Required for the lead-acid (KiBaM) chemistry, ignored otherwise.
    pub lead_acid: Option<KibamReference>,
}

impl CapacityParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.qmax_nominal <= 0.0 {
            return Err(StorageError::invalid("capacity.qmax_nominal", "must be > 0 Ah"));
        }
        if !(0.0..=100.0).contains(&self.soc_min)
            || !(0.0..=100.0).contains(&self.soc_max)
            || self.soc_min >= self.soc_max
        {
            return Err(StorageError::invalid(
                "capacity.soc_min/soc_max",
                format!(
                    "SOC window must satisfy 0 <= min < max <= 100, got [{}, {}]",
                    self.soc_min, self.soc_max
                ),
            ));
        }
        if !(self.soc_min..=self.soc_max).contains(&self.soc_init) {
            return Err(StorageError::invalid(
                "capacity.soc_init",
                format!("must lie inside the SOC window, got {}", self.soc_init),
            ));
        }
        if self.chemistry == Chemistry::LeadAcid {
            let reference = self.lead_acid.as_ref().ok_or_else(|| {
                StorageError::invalid(
                    "capacity.lead_acid",
                    "lead-acid chemistry requires KiBaM reference capacities",
                )
            })?;
            if !(reference.q1 > 0.0 && reference.q1 < reference.q10 && reference.q10 < reference.q20) {
                return Err(StorageError::invalid(
                    "capacity.lead_acid",
                    "reference capacities must satisfy 0 < q1 < q10 < q20",
                ));
            }
            if reference.t1 <= 0.0 {
                return Err(StorageError::invalid("capacity.lead_acid.t1", "must be > 0 hours"));
            }
        }
        Ok(())
    }
}

/// Terminal-voltage model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageVariant {
    /// Shepard-Tremblay dynamic model (lithium-ion / lead-acid) or, for the
    /// vanadium-redox chemistry, the Nernst stack model.
    Model {
        v_full: f64,
        v_exp: f64,
        v_nom: f64,
        q_full: f64,
        q_exp: f64,
        q_nom: f64,
        c_rate: f64,
    },
    /// Voltage-vs-DOD lookup table, rows of (DOD %, cell voltage V).
    Table { rows: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoltageParams {
    pub num_cells_series: usize,
    pub num_strings: usize,
    /// Default nominal cell voltage [V].
    pub v_nom_default: f64,
    /// Cell internal resistance [Ohm].
    pub resistance: f64,
    pub variant: VoltageVariant,
}

impl VoltageParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.num_cells_series == 0 || self.num_strings == 0 {
            return Err(StorageError::invalid(
                "voltage.num_cells_series/num_strings",
                "pack topology counts must be >= 1",
            ));
        }
        if self.v_nom_default <= 0.0 {
            return Err(StorageError::invalid("voltage.v_nom_default", "must be > 0 V"));
        }
        if self.resistance < 0.0 {
            return Err(StorageError::invalid("voltage.resistance", "must be >= 0 Ohm"));
        }
        match &self.variant {
            VoltageVariant::Model {
                v_full,
                v_exp,
                v_nom,
                q_full,
                q_exp,
                q_nom,
                c_rate,
            } => {
                if *v_full <= 0.0 || *v_exp <= 0.0 || *v_nom <= 0.0 {
                    return Err(StorageError::invalid(
                        "voltage.variant",
                        "model voltages must be > 0 V",
                    ));
                }
                if !(*q_exp > 0.0 && *q_nom > *q_exp && *q_full > *q_nom) {
                    return Err(StorageError::invalid(
                        "voltage.variant",
                        "model charges must satisfy 0 < q_exp < q_nom < q_full",
                    ));
                }
                if *c_rate <= 0.0 {
                    return Err(StorageError::invalid("voltage.variant.c_rate", "must be > 0"));
                }
            }
            VoltageVariant::Table { rows } => {
                if rows.len() < 2 {
                    return Err(StorageError::invalid(
                        "voltage.variant.rows",
                        format!("DOD-voltage table needs >= 2 rows, got {}", rows.len()),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalParams {
    pub mass_kg: f64,
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
    /// Internal resistance used for ohmic self-heating [Ohm].
    pub resistance_ohm: f64,
    /// Specific heat capacity [J/kg/K].
    pub cp_j_per_kg_k: f64,
    /// Surface heat-transfer coefficient [W/m2/K].
    pub h_w_per_m2_k: f64,
    /// Rows of (temperature K, usable capacity %).
    pub cap_vs_temp: Vec<[f64; 2]>,
    /// Ambient temperature over year one (or the whole lifetime) [K],
    /// indexed by the year-one step index and clamped at the end.
    pub t_room_k: Vec<f64>,
}

impl ThermalParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.mass_kg <= 0.0 || self.cp_j_per_kg_k <= 0.0 {
            return Err(StorageError::invalid(
                "thermal.mass_kg/cp_j_per_kg_k",
                "thermal mass and specific heat must be > 0",
            ));
        }
        if self.length_m <= 0.0 || self.width_m <= 0.0 || self.height_m <= 0.0 {
            return Err(StorageError::invalid(
                "thermal.length_m/width_m/height_m",
                "battery dimensions must be > 0 m",
            ));
        }
        if self.h_w_per_m2_k < 0.0 || self.resistance_ohm < 0.0 {
            return Err(StorageError::invalid(
                "thermal.h_w_per_m2_k/resistance_ohm",
                "heat transfer coefficient and resistance must be >= 0",
            ));
        }
        if self.cap_vs_temp.len() < 2 {
            return Err(StorageError::invalid(
                "thermal.cap_vs_temp",
                format!("capacity-vs-temperature table needs >= 2 rows, got {}", self.cap_vs_temp.len()),
            ));
        }
        if self.t_room_k.is_empty() {
            return Err(StorageError::invalid("thermal.t_room_k", "ambient series must be non-empty"));
        }
        if self.t_room_k.iter().any(|&t| t <= 0.0 || t >= T_MAX_K) {
            return Err(StorageError::invalid(
                "thermal.t_room_k",
                format!("ambient temperatures must lie in (0, {T_MAX_K}) K"),
            ));
        }
        Ok(())
    }

    /// Ambient temperature for a year-one step index, clamped to the series.
    pub fn room_temp_k(&self, year_one_index: usize) -> f64 {
        let idx = year_one_index.min(self.t_room_k.len() - 1);
        self.t_room_k[idx]
    }
}

/// Calendar-fade model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarFade {
    None,
    /// Square-root-in-time fade with Arrhenius-style temperature and SOC
    /// sensitivity. `q0` is the initial relative capacity as a fraction.
    Model { q0: f64, a: f64, b: f64, c: f64 },
    /// Rows of (day age, capacity %).
    Table { rows: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeParams {
    /// Rows of (DOD %, cycles to failure, relative capacity %).
    pub cycle_matrix: Vec<[f64; 3]>,
    pub calendar: CalendarFade,
}

impl LifetimeParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.cycle_matrix.len() < 3 {
            return Err(StorageError::invalid(
                "lifetime.cycle_matrix",
                format!("needs >= 3 rows of (DOD, cycles, capacity), got {}", self.cycle_matrix.len()),
            ));
        }
        match &self.calendar {
            CalendarFade::Table { rows } if rows.len() < 2 => Err(StorageError::invalid(
                "lifetime.calendar.rows",
                format!("calendar life table needs >= 2 rows, got {}", rows.len()),
            )),
            CalendarFade::Model { q0, .. } if *q0 <= 0.0 => Err(StorageError::invalid(
                "lifetime.calendar.q0",
                "initial relative capacity fraction must be > 0",
            )),
            _ => Ok(()),
        }
    }
}

/// Parasitic loss lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossParams {
    /// One kW figure per calendar month for each operating mode. Accepts a
    /// single value per mode, broadcast across all twelve months.
    Monthly {
        charging_kw: Vec<f64>,
        discharging_kw: Vec<f64>,
        idle_kw: Vec<f64>,
    },
    /// One kW figure per year-one step.
    Timeseries { series_kw: Vec<f64> },
}

impl LossParams {
    pub fn validate(&self, time: &TimeParams) -> Result<(), StorageError> {
        match self {
            Self::Monthly {
                charging_kw,
                discharging_kw,
                idle_kw,
            } => {
                for (field, values) in [
                    ("losses.charging_kw", charging_kw),
                    ("losses.discharging_kw", discharging_kw),
                    ("losses.idle_kw", idle_kw),
                ] {
                    if values.len() != 1 && values.len() != 12 {
                        return Err(StorageError::invalid(
                            field,
                            format!("monthly loss vector length must be 1 or 12, got {}", values.len()),
                        ));
                    }
                }
                Ok(())
            }
            Self::Timeseries { series_kw } => {
                let expected = HOURS_PER_YEAR * time.steps_per_hour;
                if series_kw.len() != expected {
                    return Err(StorageError::invalid(
                        "losses.series_kw",
                        format!("timeseries loss length must be {expected}, got {}", series_kw.len()),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// When and how degraded capacity is bought back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    None,
    /// Full replacement once total relative capacity reaches the threshold.
    Capacity { threshold_percent: f64 },
    /// `per_year[y]` evenly spaced replacements during year `y`, each
    /// augmenting capacity by `percent_per_year[y]`.
    Schedule {
        per_year: Vec<usize>,
        percent_per_year: Vec<f64>,
    },
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl ReplacementPolicy {
    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            Self::None => Ok(()),
            Self::Capacity { threshold_percent } => {
                if !(0.0..=100.0).contains(threshold_percent) {
                    return Err(StorageError::invalid(
                        "replacement.threshold_percent",
                        "must be in [0, 100]",
                    ));
                }
                Ok(())
            }
            Self::Schedule {
                per_year,
                percent_per_year,
            } => {
                if per_year.len() != percent_per_year.len() {
                    return Err(StorageError::invalid(
                        "replacement.per_year",
                        format!(
                            "schedule lengths differ: {} counts vs {} percents",
                            per_year.len(),
                            percent_per_year.len()
                        ),
                    ));
                }
                if percent_per_year.iter().any(|p| !(0.0..=100.0).contains(p)) {
                    return Err(StorageError::invalid(
                        "replacement.percent_per_year",
                        "each replacement percent must be in [0, 100]",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Everything a `Battery` needs, validated as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryParams {
    pub time: TimeParams,
    pub capacity: CapacityParams,
    pub voltage: VoltageParams,
    pub thermal: ThermalParams,
    pub lifetime: LifetimeParams,
    pub losses: LossParams,
    pub replacement: ReplacementPolicy,
}

impl BatteryParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        self.capacity.validate()?;
        self.voltage.validate()?;
        self.thermal.validate()?;
        self.lifetime.validate()?;
        self.losses.validate(&self.time)?;
        self.replacement.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    AcCoupled,
    DcCoupled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    None,
    RestrictCurrent,
    RestrictPower,
    RestrictBoth,
}

impl LimitPolicy {
    pub fn restricts_current(self) -> bool {
        matches!(self, Self::RestrictCurrent | Self::RestrictBoth)
    }

    pub fn restricts_power(self) -> bool {
        matches!(self, Self::RestrictPower | Self::RestrictBoth)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerParams {
    pub connection: Connection,
    pub limits: LimitPolicy,
    pub current_charge_max_a: f64,
    pub current_discharge_max_a: f64,
    pub power_charge_max_kwdc: f64,
    pub power_discharge_max_kwdc: f64,
    pub power_charge_max_kwac: f64,
    pub power_discharge_max_kwac: f64,
    /// Minimum time the battery must stay in a charging mode before the
    /// opposite mode is accepted [minutes].
    pub minimum_modetime_min: f64,
    /// AC-coupled conversion efficiencies [%].
    pub ac_dc_efficiency_pct: f64,
    pub dc_ac_efficiency_pct: f64,
    /// DC-coupled BMS conversion efficiency [%].
    pub dc_dc_bms_efficiency_pct: f64,
    /// DC-coupled: back the battery off when the shared inverter falls below
    /// this efficiency [%].
    pub inverter_efficiency_cutoff_pct: f64,
}

impl ControllerParams {
    pub fn validate(&self) -> Result<(), StorageError> {
        for (field, value) in [
            ("controller.ac_dc_efficiency_pct", self.ac_dc_efficiency_pct),
            ("controller.dc_ac_efficiency_pct", self.dc_ac_efficiency_pct),
            ("controller.dc_dc_bms_efficiency_pct", self.dc_dc_bms_efficiency_pct),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(StorageError::invalid(field, format!("must be in (0, 100] %, got {value}")));
            }
        }
        if !(0.0..=100.0).contains(&self.inverter_efficiency_cutoff_pct) {
            return Err(StorageError::invalid(
                "controller.inverter_efficiency_cutoff_pct",
                "must be in [0, 100] %",
            ));
        }
        for (field, value) in [
            ("controller.current_charge_max_a", self.current_charge_max_a),
            ("controller.current_discharge_max_a", self.current_discharge_max_a),
            ("controller.power_charge_max_kwdc", self.power_charge_max_kwdc),
            ("controller.power_discharge_max_kwdc", self.power_discharge_max_kwdc),
            ("controller.power_charge_max_kwac", self.power_charge_max_kwac),
            ("controller.power_discharge_max_kwac", self.power_discharge_max_kwac),
            ("controller.minimum_modetime_min", self.minimum_modetime_min),
        ] {
            if value < 0.0 {
                return Err(StorageError::invalid(field, format!("must be >= 0, got {value}")));
            }
        }
        Ok(())
    }
}
