//! Charge controller.
//!
//! Clamps a requested DC power to what the SOC window, current limits, power
//! limits, and topology allow, then iterates the battery model until every
//! constraint holds. Over-limit requests degrade gracefully into a reduced
//! realized power; nothing in this path returns an error.

use tracing::{debug, trace};

use crate::battery::{Battery, ChargeMode};
use crate::clock::StepClock;
use crate::error::StorageError;
use crate::metrics::DispatchMetrics;
use crate::params::{Connection, ControllerParams};
use crate::power_flow::{PowerFlowModel, SharedInverter, StepInputs};
use crate::utils::{LOW_TOLERANCE, MAX_CONSTRAINT_PASSES, TOLERANCE};

const KILOWATT_TO_WATT: f64 = 1e3;
const MINUTES_PER_HOUR: f64 = 60.0;

pub struct ChargeController {
    battery: Battery,
    flow: PowerFlowModel,
    metrics: DispatchMetrics,
    params: ControllerParams,
    /// Last accepted active mode; idle requests leave it untouched.
    charging_mode: ChargeMode,
    /// Time spent since the last accepted mode change [min].
    time_at_mode_min: f64,
}

impl ChargeController {
    pub fn new(
        battery: Battery,
        params: ControllerParams,
        inverter: Option<SharedInverter>,
    ) -> Result<Self, StorageError> {
        params.validate()?;
        let flow = PowerFlowModel::new(params.connection, inverter)?;
        let metrics = DispatchMetrics::new(battery.params().time.dt_hour);
        Ok(Self {
            battery,
            flow,
            metrics,
            params,
            charging_mode: ChargeMode::NoCharge,
            time_at_mode_min: 0.0,
        })
    }

    /// Run one dispatch step. Returns the realized battery DC power
    /// [kW, positive = discharge], which may differ from the target.
    pub fn run_dispatch(
        &mut self,
        clock: &StepClock,
        target_power_dc_kw: f64,
        inputs: &StepInputs,
    ) -> f64 {
        let mut target = target_power_dc_kw;

        self.flow.begin_step(inputs);
        self.flow.state_mut().power_battery_target_kw = target_power_dc_kw;

        self.soc_gate(&mut target);
        self.switch_gate(&mut target);

        let mut current = self.target_current(target);

        let snapshot = self.battery.state();
        let mut count = 0;
        loop {
            let realized = self.battery.run(clock, current);
            current = realized;

            let state = self.flow.state_mut();
            state.power_system_loss_kw = self.battery.loss_kw();
            state.power_battery_dc_kw = self.battery.power_dc_kw();
            self.flow.calculate(&self.params, inputs.ambient_temp_k);

            let iterate = self.check_constraints(&mut current, count);
            count += 1;
            trace!(count, current, iterate, "constraint pass");
            if !iterate {
                break;
            }
            // roll the speculative step back and retry at the adjusted draw
            self.battery.set_state(snapshot.clone());
            self.flow.reset_battery_flows();
        }

        self.metrics.accumulate_step(self.flow.state());
        debug!(
            target_power_dc_kw,
            realized = self.flow.state().power_battery_dc_kw,
            soc = self.battery.soc(),
            "dispatch resolved"
        );
        self.flow.state().power_battery_dc_kw
    }

    /// Refuse to discharge at the SOC floor or charge at the SOC ceiling.
    fn soc_gate(&self, target: &mut f64) {
        let cap = &self.battery.params().capacity;
        if *target > 0.0 && self.battery.soc() <= cap.soc_min + TOLERANCE {
            *target = 0.0;
        } else if *target < 0.0 && self.battery.soc() >= cap.soc_max - TOLERANCE {
            *target = 0.0;
        }
    }

    /// Block charge<->discharge flips until the dwell time has elapsed. The
    /// tracked mode only changes when a flip is actually accepted; requests
    /// into or out of idle are never gated.
    fn switch_gate(&mut self, target: &mut f64) {
        let dt_min = self.battery.params().time.dt_hour * MINUTES_PER_HOUR;
        let target_mode = if *target > 0.0 {
            ChargeMode::Discharge
        } else if *target < 0.0 {
            ChargeMode::Charge
        } else {
            ChargeMode::NoCharge
        };

        if target_mode != ChargeMode::NoCharge && target_mode != self.charging_mode {
            let in_dwell = self.charging_mode != ChargeMode::NoCharge
                && self.time_at_mode_min <= self.params.minimum_modetime_min;
            if in_dwell {
                *target = 0.0;
            } else {
                self.charging_mode = target_mode;
                self.time_at_mode_min = 0.0;
            }
        }
        self.time_at_mode_min += dt_min;
    }

    /// Convert the target power to a current at nominal voltage and apply the
    /// current limits once up front.
    fn target_current(&self, target_power_dc_kw: f64) -> f64 {
        let mut current =
            KILOWATT_TO_WATT * target_power_dc_kw / self.battery.pack_voltage_nominal();
        self.restrict_current(&mut current);
        current
    }

    /// Check all operational constraints in order of precedence and adjust the
    /// current. Returns true when another battery pass is required.
    fn check_constraints(&self, current: &mut f64, count: usize) -> bool {
        let initial = *current;
        let mut iterate = true;
        let mut current_iterate = false;
        let mut power_iterate = false;

        let cap_params = &self.battery.params().capacity;
        let dt_hour = self.battery.params().time.dt_hour;
        let soc = self.battery.soc();
        let state = self.flow.state();

        if self.restrict_current(current) {
            current_iterate = true;
        } else if self.restrict_power(current) {
            power_iterate = true;
        } else if *current > 0.0 && soc < cap_params.soc_min - TOLERANCE {
            // drew past the floor: back the discharge off by the overshoot
            let dq = 0.01 * (cap_params.soc_min - soc) * self.battery.charge_maximum_thermal();
            *current -= dq / dt_hour;
        } else if *current < 0.0 && soc > cap_params.soc_max + TOLERANCE {
            let dq = 0.01 * (soc - cap_params.soc_max) * self.battery.charge_maximum_thermal();
            *current += dq / dt_hour;
        } else if *current < 0.0
            && state.power_grid_to_battery_kw > TOLERANCE
            && !state.can_grid_charge
        {
            // grid charging appeared but is not permitted: remove it
            *current += self.grid_charge_reduction();
        } else if self.params.connection == Connection::DcCoupled
            && state.power_grid_to_battery_kw > 0.0
            && (state.power_pv_to_grid_kw > 0.0 || state.power_pv_to_load_kw > 0.0)
        {
            // DC bus cannot grid-charge while PV is producing
            *current += self.grid_charge_reduction();
        } else if self.inverter_below_cutoff() {
            iterate = self.back_off_for_inverter(current);
        } else {
            iterate = false;
        }

        // adjustments above may have pushed the draw back over a limit
        if !current_iterate {
            current_iterate = self.restrict_current(current);
        }
        if !power_iterate {
            power_iterate = self.restrict_power(current);
        }
        iterate = iterate || current_iterate || power_iterate;

        if count > MAX_CONSTRAINT_PASSES {
            iterate = false;
        }

        // never flip between charging and discharging within a step
        if current.abs() > TOLERANCE && initial / *current < 0.0 {
            *current = 0.0;
            iterate = false;
        }

        iterate
    }

    /// Current adjustment that removes the booked grid-to-battery flow.
    fn grid_charge_reduction(&self) -> f64 {
        let state = self.flow.state();
        if state.power_battery_ac_kw.abs() < TOLERANCE {
            state.power_grid_to_battery_kw * KILOWATT_TO_WATT / self.battery.pack_voltage()
        } else {
            (state.power_grid_to_battery_kw / state.power_battery_ac_kw.abs())
                * self.battery.current().abs()
        }
    }

    fn inverter_below_cutoff(&self) -> bool {
        self.params.connection == Connection::DcCoupled
            && self
                .flow
                .inverter_efficiency_pct()
                .is_some_and(|eff| eff < self.params.inverter_efficiency_cutoff_pct)
    }

    /// The shared inverter is running too inefficiently for this operating
    /// point; shrink the battery's contribution.
    fn back_off_for_inverter(&self, current: &mut f64) -> bool {
        let state = self.flow.state();
        let voltage = self.battery.pack_voltage();
        if voltage <= 0.0 {
            return false;
        }

        if state.power_battery_dc_kw > 0.0 {
            let mut power_dc_kw = *current * voltage / KILOWATT_TO_WATT;
            if let Some(nameplate) = self.flow.inverter_nameplate_kw() {
                if power_dc_kw + state.power_pv_kw > nameplate {
                    power_dc_kw = (nameplate - state.power_pv_kw).max(0.0);
                }
            }
            *current = power_dc_kw * KILOWATT_TO_WATT / voltage;
            true
        } else if state.power_battery_dc_kw < 0.0 && state.power_grid_to_battery_kw > 0.0 {
            let efficiency = self.flow.inverter_efficiency_pct().unwrap_or(100.0) * 0.01;
            let reduction = (state.power_grid_to_battery_kw * efficiency
                / state.power_battery_dc_kw)
                .abs();
            *current *= (1.0 - reduction).max(0.0);
            true
        } else {
            false
        }
    }

    fn restrict_current(&self, current: &mut f64) -> bool {
        if !self.params.limits.restricts_current() {
            return false;
        }
        let mut clamped = false;
        if *current < 0.0 {
            if current.abs() > self.params.current_charge_max_a {
                *current = -self.params.current_charge_max_a;
                clamped = true;
            }
        } else if *current > self.params.current_discharge_max_a {
            *current = self.params.current_discharge_max_a;
            clamped = true;
        }
        clamped
    }

    fn restrict_power(&self, current: &mut f64) -> bool {
        if !self.params.limits.restricts_power() {
            return false;
        }
        let mut clamped = false;
        let power_battery_kw = *current * self.battery.pack_voltage() / KILOWATT_TO_WATT;
        let power_battery_ac_kw = self.flow.state().power_battery_ac_kw;

        if power_battery_kw < 0.0 {
            if power_battery_kw.abs() > self.params.power_charge_max_kwdc * (1.0 + LOW_TOLERANCE) {
                let dp = (self.params.power_charge_max_kwdc - power_battery_kw.abs()).abs();
                *current -= (dp / power_battery_kw.abs()) * *current;
                clamped = true;
            } else if power_battery_ac_kw.abs()
                > self.params.power_charge_max_kwac * (1.0 + LOW_TOLERANCE)
            {
                let dp = (self.params.power_charge_max_kwac - power_battery_ac_kw.abs()).abs();
                *current -= (dp / power_battery_kw.abs()) * *current;
                clamped = true;
            }
        } else if power_battery_kw > 0.0 {
            if power_battery_kw > self.params.power_discharge_max_kwdc * (1.0 + LOW_TOLERANCE) {
                let dp = (self.params.power_discharge_max_kwdc - power_battery_kw).abs();
                *current -= (dp / power_battery_kw) * *current;
                clamped = true;
            } else if power_battery_ac_kw.abs()
                > self.params.power_discharge_max_kwac * (1.0 + LOW_TOLERANCE)
            {
                let dp = (self.params.power_discharge_max_kwac - power_battery_ac_kw).abs();
                *current -= (dp / power_battery_kw) * *current;
                clamped = true;
            }
        }
        clamped
    }

    // --- accessors --------------------------------------------------------

    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    pub fn battery_mut(&mut self) -> &mut Battery {
        &mut self.battery
    }

    pub fn flow_state(&self) -> &crate::power_flow::PowerFlowState {
        self.flow.state()
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut DispatchMetrics {
        &mut self.metrics
    }

    pub fn charging_mode(&self) -> ChargeMode {
        self.charging_mode
    }

    pub fn time_at_mode_min(&self) -> f64 {
        self.time_at_mode_min
    }
}
