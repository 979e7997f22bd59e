//! Power flow resolution.
//!
//! Splits the battery's AC or DC power across PV, load, grid, and fuel cell,
//! honoring per-source charging permissions, and reports the complete flow
//! decomposition together with conversion losses.

pub mod inputs;
pub mod inverter;
pub mod model;
pub mod state;

pub use inputs::{ChargePermissions, StepInputs};
pub use inverter::{SharedInverter, SharedInverterParams};
pub use model::{PowerFlowModel, Topology};
pub use state::PowerFlowState;
