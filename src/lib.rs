//! Time-stepped electrochemical battery storage simulation.
//!
//! Given a per-step target power from an external dispatch strategy, the crate
//! simulates the battery's internal state — charge, voltage, temperature,
//! cycle and calendar aging, parasitic losses — returns the power actually
//! delivered, and resolves the resulting AC/DC power flows across PV, load,
//! grid, and fuel cell.
//!
//! The core is synchronous and fully deterministic: one [`clock::StepClock`]
//! step runs to completion before the next begins, and the only iteration is
//! the bounded coupling loop inside [`battery::Battery`] and the bounded
//! constraint loop inside [`controller::ChargeController`].

pub mod battery;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod params;
pub mod power_flow;
pub mod telemetry;
pub mod utils;

pub use battery::{Battery, BatteryState, ChargeMode};
pub use clock::StepClock;
pub use controller::ChargeController;
pub use error::StorageError;
pub use metrics::DispatchMetrics;
pub use params::{
    BatteryParams, CalendarFade, CapacityParams, Chemistry, Connection, ControllerParams,
    KibamReference, LifetimeParams, LimitPolicy, LossParams, ReplacementPolicy, ThermalParams,
    TimeParams, VoltageParams, VoltageVariant,
};
pub use power_flow::{
    ChargePermissions, PowerFlowModel, PowerFlowState, SharedInverter, SharedInverterParams,
    StepInputs,
};
