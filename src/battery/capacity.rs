//! Stored-charge tracking.
//!
//! Two variants: a single-bucket model for lithium-ion (and the flow
//! chemistries), and the Kinetic Battery Model (KiBaM) two-tank approximation
//! for lead acid. Both expose the same update surface and clamp the requested
//! current to what the SOC window (and, for KiBaM, the tank kinetics) allows,
//! writing the feasible current back to the caller.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::StorageError;
use crate::params::CapacityParams;
use crate::utils::{LOW_TOLERANCE, TOLERANCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    Charge,
    NoCharge,
    Discharge,
}

/// KiBaM tank split. Zero for the single-bucket variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KibamTanks {
    /// Immediately available charge q1_0 [Ah].
    pub available: f64,
    /// Chemically bound charge q2_0 [Ah].
    pub bound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityState {
    /// Stored charge [Ah].
    pub q0: f64,
    /// Lifetime-degraded maximum [Ah].
    pub qmax: f64,
    /// Temperature-derated maximum [Ah].
    pub qmax_thermal: f64,
    /// Current drawn this step [A], positive = discharge.
    pub current: f64,
    /// Charge shed to thermal/lifetime derating, expressed as a current [A].
    pub current_loss: f64,
    pub soc: f64,
    pub dod: f64,
    pub dod_prev: f64,
    pub charge_mode: ChargeMode,
    pub prev_charge_mode: ChargeMode,
    /// True when this step latched a charge<->discharge transition.
    pub charge_mode_changed: bool,
    pub kibam: KibamTanks,
}

impl CapacityState {
    fn fresh(qmax: f64, soc_init: f64) -> Self {
        Self {
            q0: 0.01 * soc_init * qmax,
            qmax,
            qmax_thermal: qmax,
            current: 0.0,
            current_loss: 0.0,
            soc: soc_init,
            dod: 100.0 - soc_init,
            dod_prev: 0.0,
            charge_mode: ChargeMode::Discharge,
            prev_charge_mode: ChargeMode::Discharge,
            charge_mode_changed: false,
            kibam: KibamTanks::default(),
        }
    }
}

fn update_soc(state: &mut CapacityState) {
    let max = state.qmax.min(state.qmax_thermal);
    if max <= 0.0 {
        state.q0 = 0.0;
        state.soc = 0.0;
        state.dod = 100.0;
        return;
    }
    if state.q0 > max {
        state.q0 = max;
    }
    state.soc = if state.qmax > 0.0 {
        (100.0 * state.q0 / max).clamp(0.0, 100.0)
    } else {
        0.0
    };
    state.dod = 100.0 - state.soc;
}

fn compute_charge_modes(state: &mut CapacityState) {
    state.charge_mode = if state.current < 0.0 {
        ChargeMode::Charge
    } else if state.current > 0.0 {
        ChargeMode::Discharge
    } else {
        ChargeMode::NoCharge
    };

    let switched = state.charge_mode != state.prev_charge_mode
        && state.charge_mode != ChargeMode::NoCharge
        && state.prev_charge_mode != ChargeMode::NoCharge;
    state.charge_mode_changed = switched;
    if switched {
        state.prev_charge_mode = state.charge_mode;
    }
}

/// Clamp `q0` to the SOC window and absorb the excess into the current so the
/// rest of the model sees a feasible draw.
fn apply_soc_limits(state: &mut CapacityState, params: &CapacityParams, dt_hour: f64) {
    let mut q_upper = state.qmax * params.soc_max * 0.01;
    let q_lower = state.qmax * params.soc_min * 0.01;
    let i_orig = state.current;

    q_upper = q_upper.min(state.qmax_thermal * params.soc_max * 0.01);

    if state.q0 > q_upper {
        if state.current.abs() > TOLERANCE {
            state.current += (state.q0 - q_upper) / dt_hour;
            if state.current / i_orig < 0.0 {
                state.current = 0.0;
            }
        }
        state.q0 = q_upper;
    } else if state.q0 < q_lower {
        if state.current.abs() > TOLERANCE {
            state.current += (state.q0 - q_lower) / dt_hour;
            if state.current / i_orig < 0.0 {
                state.current = 0.0;
            }
        }
        state.q0 = q_lower;
    }
}

/// Single-bucket capacity model.
#[derive(Debug, Clone)]
pub struct LithiumIonCapacity {
    state: CapacityState,
}

impl LithiumIonCapacity {
    fn new(params: &CapacityParams) -> Self {
        Self {
            state: CapacityState::fresh(params.qmax_nominal, params.soc_init),
        }
    }

    fn update_for_current(&mut self, current: &mut f64, params: &CapacityParams, dt_hour: f64) {
        let state = &mut self.state;
        state.dod_prev = state.dod;
        state.current_loss = 0.0;
        state.current = *current;

        // I > 0 discharges, I < 0 charges
        state.q0 -= state.current * dt_hour;

        apply_soc_limits(state, params, dt_hour);
        update_soc(state);
        compute_charge_modes(state);

        *current = state.current;
    }

    fn update_for_thermal(&mut self, capacity_percent: f64, dt_hour: f64) {
        let percent = capacity_percent.max(0.0);
        let state = &mut self.state;
        state.qmax_thermal = state.qmax * percent * 0.01;
        if state.q0 > state.qmax_thermal {
            state.current_loss += (state.q0 - state.qmax_thermal) / dt_hour;
            state.q0 = state.qmax_thermal;
        }
        update_soc(state);
    }

    fn update_for_lifetime(&mut self, capacity_percent: f64, params: &CapacityParams, dt_hour: f64) {
        let percent = capacity_percent.max(0.0);
        let state = &mut self.state;
        let degraded = params.qmax_nominal * percent * 0.01;
        if degraded <= state.qmax {
            state.qmax = degraded;
        }
        if state.q0 > state.qmax {
            state.current_loss += (state.q0 - state.qmax) / dt_hour;
            state.q0 = state.qmax;
        }
        update_soc(state);
    }

    fn replace(&mut self, replacement_percent: f64, params: &CapacityParams) {
        let percent = replacement_percent.max(0.0);
        let state = &mut self.state;
        let qmax_old = state.qmax;
        state.qmax = (state.qmax + params.qmax_nominal * percent * 0.01).min(params.qmax_nominal);
        state.qmax_thermal = state.qmax;
        state.q0 += (state.qmax - qmax_old) * params.soc_init * 0.01;
        state.soc = params.soc_init;
        update_soc(state);
    }
}

/// Kinetic Battery Model: an available tank feeding the terminals and a bound
/// tank draining into it at rate `k`, with fraction `c` of charge available.
#[derive(Debug, Clone)]
pub struct KibamCapacity {
    state: CapacityState,
    c: f64,
    k: f64,
    /// Maximum capacity from the closed-form KiBaM relation at q20 [Ah].
    qmax_nominal: f64,
    t1: f64,
    t2: f64,
    f1: f64,
    f2: f64,
}

impl KibamCapacity {
    fn new(params: &CapacityParams) -> Result<Self, StorageError> {
        let reference = params.lead_acid.as_ref().ok_or_else(|| {
            StorageError::invalid(
                "capacity.lead_acid",
                "lead-acid chemistry requires KiBaM reference capacities",
            )
        })?;

        let mut model = Self {
            state: CapacityState::fresh(0.0, params.soc_init),
            c: 0.0,
            k: 0.0,
            qmax_nominal: 0.0,
            t1: reference.t1,
            t2: 10.0,
            f1: reference.q1 / reference.q20,
            f2: reference.q1 / reference.q10,
        };
        model.fit_parameters(reference.q20);

        let mut state = CapacityState::fresh(model.qmax_nominal, params.soc_init);
        state.kibam.available = state.q0 * model.c;
        state.kibam.bound = state.q0 - state.kibam.available;
        model.state = state;
        Ok(model)
    }

    /// Grid search over k minimizing the disagreement between the two
    /// reference-ratio estimates of c, then recover qmax from q20.
    fn fit_parameters(&mut self, q20: f64) {
        let mut min_residual = 10_000.0;
        for i in 0..5000 {
            let k_guess = i as f64 * 0.001;
            let c1 = self.c_compute(self.f1, 20.0, k_guess);
            let c2 = self.c_compute(self.f2, self.t2, k_guess);
            let residual = (c1 - c2).abs();
            if residual < min_residual {
                min_residual = residual;
                self.k = k_guess;
                self.c = 0.5 * (c1 + c2);
            }
        }
        self.qmax_nominal =
            q20 * ((1.0 - (-self.k * 20.0).exp()) * (1.0 - self.c) + self.k * self.c * 20.0)
                / (self.k * self.c * 20.0);
    }

    fn c_compute(&self, f: f64, t2: f64, k_guess: f64) -> f64 {
        let e1 = 1.0 - (-k_guess * self.t1).exp();
        let e2 = 1.0 - (-k_guess * t2).exp();
        let num = f * e1 * t2 - e2 * self.t1;
        let denom = num - k_guess * f * self.t1 * t2 + k_guess * self.t1 * t2;
        num / denom
    }

    fn q1_compute(&self, q1_0: f64, q0: f64, current: f64, dt_hour: f64) -> f64 {
        let kt = self.k * dt_hour;
        let a = q1_0 * (-kt).exp();
        let b = (q0 * self.k * self.c - current) * (1.0 - (-kt).exp()) / self.k;
        let c = current * self.c * (kt - 1.0 + (-kt).exp()) / self.k;
        a + b - c
    }

    fn q2_compute(&self, q2_0: f64, q0: f64, current: f64, dt_hour: f64) -> f64 {
        let kt = self.k * dt_hour;
        let a = q2_0 * (-kt).exp();
        let b = q0 * (1.0 - self.c) * (1.0 - (-kt).exp());
        let c = current * (1.0 - self.c) * (kt - 1.0 + (-kt).exp()) / self.k;
        a + b - c
    }

    fn icmax_compute(&self, q1_0: f64, q0: f64, dt_hour: f64) -> f64 {
        let kt = self.k * dt_hour;
        let num = -self.k * self.c * self.state.qmax
            + self.k * q1_0 * (-kt).exp()
            + q0 * self.k * self.c * (1.0 - (-kt).exp());
        let denom = 1.0 - (-kt).exp() + self.c * (kt - 1.0 + (-kt).exp());
        num / denom
    }

    fn idmax_compute(&self, q1_0: f64, q0: f64, dt_hour: f64) -> f64 {
        let kt = self.k * dt_hour;
        let num = self.k * q1_0 * (-kt).exp() + q0 * self.k * self.c * (1.0 - (-kt).exp());
        let denom = 1.0 - (-kt).exp() + self.c * (kt - 1.0 + (-kt).exp());
        num / denom
    }

    fn update_for_current(&mut self, current: &mut f64, dt_hour: f64) {
        if current.abs() < LOW_TOLERANCE {
            *current = 0.0;
        }

        self.state.dod_prev = self.state.dod;
        self.state.current_loss = 0.0;
        self.state.current = *current;

        let q1_0 = self.state.kibam.available;
        let q2_0 = self.state.kibam.bound;
        let q0 = self.state.q0;

        // clip to the kinetic envelope before moving charge
        if self.state.current > 0.0 {
            let idmax = self.idmax_compute(q1_0, q0, dt_hour);
            self.state.current = self.state.current.min(idmax);
        } else if self.state.current < 0.0 {
            let icmax = self.icmax_compute(q1_0, q0, dt_hour);
            self.state.current = -self.state.current.abs().min(icmax.abs());
        }

        let mut q1_new = self.q1_compute(q1_0, q0, self.state.current, dt_hour);
        let mut q2_new = self.q2_compute(q2_0, q0, self.state.current, dt_hour);

        if q1_new + q2_new > self.state.qmax_thermal {
            let total = q1_new + q2_new;
            let p1 = q1_new / total;
            let p2 = q2_new / total;
            q1_new = self.state.qmax_thermal * p1;
            q2_new = self.state.qmax_thermal * p2;
        }

        self.state.kibam.available = q1_new;
        self.state.kibam.bound = q2_new;
        self.state.q0 = q1_new + q2_new;

        update_soc(&mut self.state);
        compute_charge_modes(&mut self.state);

        *current = self.state.current;
    }

    fn rescale_to(&mut self, limit: f64, dt_hour: f64) {
        let state = &mut self.state;
        if state.q0 > limit {
            let q0_orig = state.q0;
            let p = limit / state.q0;
            state.q0 *= p;
            state.kibam.available *= p;
            state.kibam.bound *= p;
            state.current_loss += (q0_orig - state.q0) / dt_hour;
        }
    }

    fn update_for_thermal(&mut self, capacity_percent: f64, dt_hour: f64) {
        let percent = capacity_percent.max(0.0);
        self.state.qmax_thermal = self.state.qmax * percent * 0.01;
        self.rescale_to(self.state.qmax_thermal, dt_hour);
        update_soc(&mut self.state);
    }

    fn update_for_lifetime(&mut self, capacity_percent: f64, dt_hour: f64) {
        let percent = capacity_percent.max(0.0);
        let degraded = self.qmax_nominal * percent * 0.01;
        if degraded <= self.state.qmax {
            self.state.qmax = degraded;
        }
        self.rescale_to(self.state.qmax, dt_hour);
        update_soc(&mut self.state);
    }

    fn replace(&mut self, replacement_percent: f64, soc_init: f64) {
        let percent = replacement_percent.max(0.0);
        let state = &mut self.state;
        let qmax_old = state.qmax;
        state.qmax = (state.qmax + percent * 0.01 * self.qmax_nominal).min(self.qmax_nominal);
        state.qmax_thermal = state.qmax;
        state.q0 += (state.qmax - qmax_old) * soc_init * 0.01;
        state.kibam.available = state.q0 * self.c;
        state.kibam.bound = state.q0 - state.kibam.available;
        state.soc = soc_init;
        update_soc(state);
    }
}

/// Chemistry-dispatched capacity model.
#[derive(Debug, Clone)]
pub enum CapacityModel {
    LithiumIon(LithiumIonCapacity),
    Kibam(KibamCapacity),
}

impl CapacityModel {
    pub fn new(params: &CapacityParams) -> Result<Self, StorageError> {
        match params.chemistry {
            crate::params::Chemistry::LeadAcid => Ok(Self::Kibam(KibamCapacity::new(params)?)),
            _ => Ok(Self::LithiumIon(LithiumIonCapacity::new(params))),
        }
    }

    /// Advance the stored charge for a signed current [A]. The clamped,
    /// feasible current is written back through `current`.
    pub fn update_for_current(&mut self, current: &mut f64, params: &CapacityParams, dt_hour: f64) {
        match self {
            Self::LithiumIon(model) => model.update_for_current(current, params, dt_hour),
            Self::Kibam(model) => model.update_for_current(current, dt_hour),
        }
    }

    pub fn update_for_thermal(&mut self, capacity_percent: f64, dt_hour: f64) {
        match self {
            Self::LithiumIon(model) => model.update_for_thermal(capacity_percent, dt_hour),
            Self::Kibam(model) => model.update_for_thermal(capacity_percent, dt_hour),
        }
    }

    pub fn update_for_lifetime(&mut self, capacity_percent: f64, params: &CapacityParams, dt_hour: f64) {
        match self {
            Self::LithiumIon(model) => model.update_for_lifetime(capacity_percent, params, dt_hour),
            Self::Kibam(model) => model.update_for_lifetime(capacity_percent, dt_hour),
        }
    }

    pub fn replace(&mut self, replacement_percent: f64, params: &CapacityParams) {
        match self {
            Self::LithiumIon(model) => model.replace(replacement_percent, params),
            Self::Kibam(model) => model.replace(replacement_percent, params.soc_init),
        }
    }

    pub fn state(&self) -> &CapacityState {
        match self {
            Self::LithiumIon(model) => &model.state,
            Self::Kibam(model) => &model.state,
        }
    }

    pub fn set_state(&mut self, state: CapacityState) {
        match self {
            Self::LithiumIon(model) => model.state = state,
            Self::Kibam(model) => model.state = state,
        }
    }

    /// Charge immediately available at the terminals [Ah].
    pub fn available_charge(&self) -> f64 {
        match self {
            Self::LithiumIon(model) => model.state.q0,
            Self::Kibam(model) => model.state.kibam.available,
        }
    }
}
