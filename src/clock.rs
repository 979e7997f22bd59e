//! Simulation time cursor.
//!
//! Maps (year, hour-of-year, step-of-hour) onto the two linear indices the
//! rest of the model consumes: the lifetime index, which grows monotonically
//! over the whole analysis period, and the year-one index, which wraps every
//! 8760 hours and addresses first-year series (ambient temperature, loss
//! timeseries, price forecasts).

use serde::{Deserialize, Serialize};

use crate::utils::HOURS_PER_YEAR;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepClock {
    year: usize,
    hour_of_year: usize,
    step_of_hour: usize,
    steps_per_hour: usize,
    lifetime_index: usize,
}

impl StepClock {
    pub fn new(steps_per_hour: usize) -> Self {
        Self {
            year: 0,
            hour_of_year: 0,
            step_of_hour: 0,
            steps_per_hour: steps_per_hour.max(1),
            lifetime_index: 0,
        }
    }

    pub fn advance_one_step(&mut self) {
        self.lifetime_index += 1;
        self.step_of_hour += 1;
        if self.step_of_hour == self.steps_per_hour {
            self.step_of_hour = 0;
            self.hour_of_year += 1;
            if self.hour_of_year == HOURS_PER_YEAR {
                self.hour_of_year = 0;
                self.year += 1;
            }
        }
    }

    pub fn reset(&mut self) {
        self.year = 0;
        self.hour_of_year = 0;
        self.step_of_hour = 0;
        self.lifetime_index = 0;
    }

    pub fn year(&self) -> usize {
        self.year
    }

    pub fn hour_of_year(&self) -> usize {
        self.hour_of_year
    }

    pub fn step_of_hour(&self) -> usize {
        self.step_of_hour
    }

    pub fn steps_per_hour(&self) -> usize {
        self.steps_per_hour
    }

    /// Index over the whole analysis period:
    /// `((year * 8760) + hour) * steps_per_hour + step`.
    pub fn lifetime_index(&self) -> usize {
        self.lifetime_index
    }

    /// The same step folded into the first year.
    pub fn year_one_index(&self) -> usize {
        self.lifetime_index % (HOURS_PER_YEAR * self.steps_per_hour)
    }

    /// Hours elapsed since the start of the simulation.
    pub fn hour_of_lifetime(&self) -> usize {
        self.year * HOURS_PER_YEAR + self.hour_of_year
    }
}
