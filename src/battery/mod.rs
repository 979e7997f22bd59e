//! The coupled battery model.
//!
//! `Battery` owns one instance of each sub-model and advances them together
//! each step. Temperature affects usable capacity, but the capacity model can
//! reduce the current, which in turn changes the heat input, so the two are
//! iterated to a fixed point (bounded, with snapshot restore) before voltage,
//! lifetime, and losses are evaluated.

pub mod capacity;
pub mod lifetime;
pub mod losses;
pub mod thermal;
pub mod voltage;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::StepClock;
use crate::error::StorageError;
use crate::params::{BatteryParams, ReplacementPolicy};
use crate::utils::{MessageLog, HOURS_PER_YEAR, MAX_COUPLING_ITERATIONS, TOLERANCE};

pub use capacity::{CapacityModel, CapacityState, ChargeMode, KibamTanks};
pub use lifetime::{CalendarLifetimeState, CycleLifetimeState, Lifetime, LifetimeState};
pub use thermal::{ThermalModel, ThermalState};
pub use voltage::VoltageModel;

const WATT_TO_KILOWATT: f64 = 1e-3;

/// Snapshot of everything that evolves step to step. Cheap to clone; restoring
/// it and replaying the same inputs reproduces identical behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub capacity: CapacityState,
    pub pack_voltage: f64,
    pub thermal: ThermalState,
    pub lifetime: LifetimeState,
    pub last_loss_kw: f64,
    pub last_idx: Option<usize>,
    pub replacements: u32,
}

pub struct Battery {
    params: BatteryParams,
    capacity: CapacityModel,
    voltage: VoltageModel,
    thermal: ThermalModel,
    lifetime: Lifetime,
    last_loss_kw: f64,
    last_idx: Option<usize>,
    replacements: u32,
    messages: MessageLog,
}

impl Battery {
    pub fn new(params: BatteryParams) -> Result<Self, StorageError> {
        params.validate()?;
        let capacity = CapacityModel::new(&params.capacity)?;
        let voltage = VoltageModel::new(params.capacity.chemistry, &params.voltage)?;
        let thermal = ThermalModel::new(&params.thermal);
        let lifetime = Lifetime::new(&params.lifetime, &params.time);
        Ok(Self {
            params,
            capacity,
            voltage,
            thermal,
            lifetime,
            last_loss_kw: 0.0,
            last_idx: None,
            replacements: 0,
            messages: MessageLog::default(),
        })
    }

    /// Advance one step at the requested current [A, positive = discharge].
    /// Returns the realized current, which may be smaller in magnitude.
    pub fn run(&mut self, clock: &StepClock, requested_current: f64) -> f64 {
        let mut current = requested_current;
        let mut reference = current;

        let capacity_snapshot = self.capacity.state().clone();
        let thermal_snapshot = self.thermal.state().clone();

        for _ in 0..MAX_COUPLING_ITERATIONS {
            self.run_thermal(current, clock);
            self.run_capacity(&mut current);

            let relative_change = if reference.abs() > 0.0 {
                (current - reference).abs() / reference.abs()
            } else {
                0.0
            };
            if relative_change > TOLERANCE {
                // capacity clamped the draw: rewind and re-run the coupled
                // pair at the feasible current
                self.thermal.set_state(thermal_snapshot.clone());
                self.capacity.set_state(capacity_snapshot.clone());
                reference = current;
            } else {
                break;
            }
        }

        self.run_voltage();
        self.run_lifetime(clock);
        let relative_q = self.lifetime.relative_q();
        self.capacity
            .update_for_lifetime(relative_q, &self.params.capacity, self.params.time.dt_hour);
        self.run_losses(clock);

        self.capacity.state().current
    }

    fn run_thermal(&mut self, current: f64, clock: &StepClock) {
        self.thermal.update(
            current,
            clock.year_one_index(),
            &self.params.thermal,
            self.params.time.dt_hour,
            &mut self.messages,
        );
    }

    fn run_capacity(&mut self, current: &mut f64) {
        // the thermal envelope only moves while current is flowing
        if current.abs() > TOLERANCE {
            let percent = self
                .thermal
                .capacity_percent(&self.params.thermal, &mut self.messages);
            self.capacity
                .update_for_thermal(percent, self.params.time.dt_hour);
        }
        self.capacity
            .update_for_current(current, &self.params.capacity, self.params.time.dt_hour);
    }

    fn run_voltage(&mut self) {
        self.voltage.update(
            self.capacity.state(),
            self.thermal.t_battery_k(),
            &self.params.voltage,
        );
    }

    fn run_lifetime(&mut self, clock: &StepClock) {
        let (dod, charge_changed) = {
            let cap = self.capacity.state();
            (cap.dod, cap.charge_mode_changed)
        };
        self.lifetime.run(
            clock.lifetime_index(),
            dod,
            charge_changed,
            self.thermal.t_battery_k(),
            &self.params.lifetime,
        );

        if let Some(percent) = self.replacement_due(clock) {
            debug!(percent, replacements = self.replacements + 1, "battery replacement");
            self.replace(percent, clock);
        }
    }

    fn replacement_due(&self, clock: &StepClock) -> Option<f64> {
        match &self.params.replacement {
            ReplacementPolicy::None => None,
            ReplacementPolicy::Capacity { threshold_percent } => {
                if self.lifetime.relative_q() - TOLERANCE <= *threshold_percent {
                    Some(100.0)
                } else {
                    None
                }
            }
            ReplacementPolicy::Schedule {
                per_year,
                percent_per_year,
            } => {
                if clock.step_of_hour() != 0 {
                    return None;
                }
                let count = *per_year.get(clock.year())?;
                if count == 0 {
                    return None;
                }
                let hour = clock.hour_of_year();
                let scheduled = (0..count).any(|j| hour == j * HOURS_PER_YEAR / count);
                if scheduled {
                    percent_per_year.get(clock.year()).copied()
                } else {
                    None
                }
            }
        }
    }

    /// Augment capacity by `percent` of nameplate; 100% is a full swap.
    pub fn replace(&mut self, percent: f64, clock: &StepClock) {
        let percent = percent.clamp(0.0, 100.0);
        self.lifetime.replace(percent, &self.params.lifetime);
        self.capacity.replace(percent, &self.params.capacity);
        self.thermal.replace(clock.year_one_index(), &self.params.thermal);
        self.replacements += 1;
    }

    fn run_losses(&mut self, clock: &StepClock) {
        let index = clock.lifetime_index();
        let advance = match self.last_idx {
            None => true,
            Some(last) => index > last,
        };
        if advance {
            self.last_loss_kw = losses::loss_kw(
                &self.params.losses,
                &self.params.time,
                clock.year_one_index(),
                self.capacity.state().charge_mode,
            );
            self.last_idx = Some(index);
        }
    }

    // --- state management -------------------------------------------------

    pub fn state(&self) -> BatteryState {
        BatteryState {
            capacity: self.capacity.state().clone(),
            pack_voltage: self.voltage.pack_voltage(&self.params.voltage),
            thermal: self.thermal.state().clone(),
            lifetime: self.lifetime.state(),
            last_loss_kw: self.last_loss_kw,
            last_idx: self.last_idx,
            replacements: self.replacements,
        }
    }

    pub fn set_state(&mut self, state: BatteryState) {
        self.capacity.set_state(state.capacity);
        self.voltage
            .set_pack_voltage(state.pack_voltage, &self.params.voltage);
        self.thermal.set_state(state.thermal);
        self.lifetime.set_state(state.lifetime);
        self.last_loss_kw = state.last_loss_kw;
        self.last_idx = state.last_idx;
        self.replacements = state.replacements;
    }

    /// Runtime diagnostics accumulated since the last drain.
    pub fn drain_messages(&mut self) -> Vec<String> {
        self.messages.drain()
    }

    // --- accessors --------------------------------------------------------

    pub fn params(&self) -> &BatteryParams {
        &self.params
    }

    pub fn current(&self) -> f64 {
        self.capacity.state().current
    }

    pub fn soc(&self) -> f64 {
        self.capacity.state().soc
    }

    pub fn dod(&self) -> f64 {
        self.capacity.state().dod
    }

    pub fn charge_mode(&self) -> ChargeMode {
        self.capacity.state().charge_mode
    }

    pub fn pack_voltage(&self) -> f64 {
        self.voltage.pack_voltage(&self.params.voltage)
    }

    pub fn cell_voltage(&self) -> f64 {
        self.voltage.cell_voltage()
    }

    pub fn pack_voltage_nominal(&self) -> f64 {
        self.voltage.pack_voltage_nominal(&self.params.voltage)
    }

    pub fn pack_resistance(&self) -> f64 {
        self.voltage.pack_resistance(&self.params.voltage)
    }

    /// Realized DC power this step [kW, positive = discharge].
    pub fn power_dc_kw(&self) -> f64 {
        self.current() * self.pack_voltage() * WATT_TO_KILOWATT
    }

    pub fn charge_maximum(&self) -> f64 {
        self.capacity.state().qmax
    }

    pub fn charge_maximum_thermal(&self) -> f64 {
        self.capacity.state().qmax_thermal
    }

    pub fn temperature_k(&self) -> f64 {
        self.thermal.t_battery_k()
    }

    pub fn thermal_capacity_percent(&self) -> f64 {
        self.thermal.state().capacity_percent
    }

    pub fn capacity_percent(&self) -> f64 {
        self.lifetime.relative_q()
    }

    pub fn capacity_percent_cycle(&self) -> f64 {
        self.lifetime.relative_q_cycle()
    }

    pub fn capacity_percent_calendar(&self) -> f64 {
        self.lifetime.relative_q_calendar()
    }

    pub fn cycles_elapsed(&self) -> usize {
        self.lifetime.cycles_elapsed()
    }

    pub fn average_cycle_range(&self) -> f64 {
        self.lifetime.average_cycle_range()
    }

    pub fn estimate_cycle_damage(&self) -> f64 {
        self.lifetime.estimate_cycle_damage(&self.params.lifetime)
    }

    pub fn loss_kw(&self) -> f64 {
        self.last_loss_kw
    }

    pub fn replacements(&self) -> u32 {
        self.replacements
    }

    // --- sizing helpers used by dispatch strategies -----------------------

    /// Charge needed to reach the given SOC ceiling [Ah].
    pub fn charge_needed(&self, soc_max: f64) -> f64 {
        let cap = self.capacity.state();
        (cap.qmax_thermal * soc_max * 0.01 - cap.q0).max(0.0)
    }

    /// Energy needed to reach the given SOC ceiling [kWh].
    pub fn energy_to_fill_kwh(&self, soc_max: f64) -> f64 {
        self.charge_needed(soc_max) * self.pack_voltage_nominal() * WATT_TO_KILOWATT
    }

    /// Constant power that would fill the battery in one step [kW].
    pub fn power_to_fill_kw(&self, soc_max: f64) -> f64 {
        self.energy_to_fill_kwh(soc_max) / self.params.time.dt_hour
    }

    /// Nameplate energy at nominal voltage [kWh].
    pub fn energy_nominal_kwh(&self) -> f64 {
        self.pack_voltage_nominal() * self.capacity.state().qmax * WATT_TO_KILOWATT
    }
}
