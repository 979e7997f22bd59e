//! End-to-end battery scenarios: constant-current cycling with aging, and
//! dispatch through the charge controller with energy accounting.

use approx::assert_abs_diff_eq;
use battery_storage_sim::{
    Battery, BatteryParams, CalendarFade, CapacityParams, ChargeController, Chemistry, Connection,
    ControllerParams, KibamReference, LifetimeParams, LimitPolicy, LossParams, ReplacementPolicy,
    StepClock, StepInputs, ThermalParams, TimeParams, VoltageParams, VoltageVariant,
};

fn lithium_params() -> BatteryParams {
    BatteryParams {
        capacity: CapacityParams {
            chemistry: Chemistry::LithiumIon,
            qmax_nominal: 1000.0,
            soc_init: 50.0,
            soc_min: 5.0,
            soc_max: 95.0,
            lead_acid: None,
        },
        voltage: VoltageParams {
            num_cells_series: 139,
            num_strings: 9,
            v_nom_default: 3.6,
            resistance: 0.2,
            variant: VoltageVariant::Model {
                v_full: 4.1,
                v_exp: 4.05,
                v_nom: 3.4,
                q_full: 2.25,
                q_exp: 0.04,
                q_nom: 2.0,
                c_rate: 0.2,
            },
        },
        thermal: ThermalParams {
            mass_kg: 507.0,
            length_m: 0.58,
            width_m: 0.58,
            height_m: 0.58,
            resistance_ohm: 0.2,
            cp_j_per_kg_k: 1004.0,
            h_w_per_m2_k: 500.0,
            cap_vs_temp: vec![
                [263.15, 60.0],
                [273.15, 80.0],
                [298.15, 100.0],
                [318.15, 100.0],
            ],
            t_room_k: vec![293.15],
        },
        lifetime: LifetimeParams {
            cycle_matrix: vec![
                [20.0, 0.0, 100.0],
                [20.0, 5000.0, 80.0],
                [20.0, 10000.0, 60.0],
                [80.0, 0.0, 100.0],
                [80.0, 1000.0, 80.0],
                [80.0, 2000.0, 60.0],
            ],
            calendar: CalendarFade::Model {
                q0: 1.02,
                a: 2.66e-3,
                b: -7280.0,
                c: 930.0,
            },
        },
        losses: LossParams::Monthly {
            charging_kw: vec![0.0],
            discharging_kw: vec![0.0],
            idle_kw: vec![0.0],
        },
        replacement: ReplacementPolicy::None,
        time: TimeParams::new(1.0, 25).unwrap(),
    }
}

fn controller_params() -> ControllerParams {
    ControllerParams {
        connection: Connection::AcCoupled,
        limits: LimitPolicy::None,
        current_charge_max_a: 1000.0,
        current_discharge_max_a: 1000.0,
        power_charge_max_kwdc: 1000.0,
        power_discharge_max_kwdc: 1000.0,
        power_charge_max_kwac: 1000.0,
        power_discharge_max_kwac: 1000.0,
        minimum_modetime_min: 0.0,
        ac_dc_efficiency_pct: 96.0,
        dc_ac_efficiency_pct: 96.0,
        dc_dc_bms_efficiency_pct: 98.0,
        inverter_efficiency_cutoff_pct: 5.0,
    }
}

/// Drive full SOC sweeps for `n_cycles` charge/discharge round trips.
fn sweep_cycles(battery: &mut Battery, clock: &mut StepClock, current: f64, n_cycles: usize) {
    let soc_min = 5.0;
    let soc_max = 95.0;
    for _ in 0..n_cycles {
        while battery.soc() < soc_max - 1.0 {
            clock.advance_one_step();
            battery.run(clock, -current);
        }
        while battery.soc() > soc_min + 1.0 {
            clock.advance_one_step();
            battery.run(clock, current);
        }
    }
}

#[test]
fn constant_current_discharge_at_1c() {
    let mut battery = Battery::new(lithium_params()).unwrap();
    let clock = StepClock::new(1);

    let current = 2.25 * 9.0; // Qfull * strings = 1C
    let realized = battery.run(&clock, current);

    assert_abs_diff_eq!(realized, 20.25, epsilon = 0.01);
    let state = battery.state();
    assert_abs_diff_eq!(state.capacity.q0, 479.75, epsilon = 0.01);
    assert_abs_diff_eq!(state.capacity.qmax, 1000.0, epsilon = 0.01);
    assert_abs_diff_eq!(state.capacity.qmax_thermal, 961.0, epsilon = 0.6);
    assert_abs_diff_eq!(state.capacity.soc, 49.92, epsilon = 0.06);
    assert_abs_diff_eq!(battery.pack_voltage(), 500.66, epsilon = 0.05);
    assert_abs_diff_eq!(battery.temperature_k(), 293.28, epsilon = 0.05);
}

#[test]
fn four_hundred_cycles_at_1c_age_the_pack() {
    let mut battery = Battery::new(lithium_params()).unwrap();
    let mut clock = StepClock::new(1);
    let current = 20.25;

    // initial discharge down to the working floor
    battery.run(&clock, current);
    while battery.soc() > 5.0 + 1.0 {
        clock.advance_one_step();
        battery.run(&clock, current);
    }

    sweep_cycles(&mut battery, &mut clock, current, 400);

    let cycles = battery.cycles_elapsed();
    assert!(
        (300..=390).contains(&cycles),
        "expected roughly 346 closed cycles, got {cycles}"
    );
    // the rainflow average sits on the 80%-DOD characteristic: 0.02%/cycle
    assert_abs_diff_eq!(
        battery.capacity_percent_cycle(),
        100.0 - 0.02 * cycles as f64,
        epsilon = 0.2
    );
    assert_abs_diff_eq!(battery.capacity_percent_cycle(), 93.08, epsilon = 1.0);
    assert_abs_diff_eq!(battery.charge_maximum(), 930.8, epsilon = 10.0);
    assert!(
        (98.6..=99.5).contains(&battery.capacity_percent_calendar()),
        "calendar fade after ~1400 days, got {}",
        battery.capacity_percent_calendar()
    );
    // resting at the SOC floor the pack voltage has collapsed accordingly
    assert_abs_diff_eq!(battery.pack_voltage(), 305.0, epsilon = 15.0);
    // invariants that must hold at any point of the sweep
    assert!(battery.soc() >= 0.0 && battery.soc() <= 100.0);
    assert!(battery.temperature_k() > 0.0 && battery.temperature_k() < 400.0);
}

#[test]
fn three_c_discharge_heats_and_sags_harder() {
    let mut battery = Battery::new(lithium_params()).unwrap();
    let mut clock = StepClock::new(1);
    let current = 2.25 * 9.0 * 3.0;

    battery.run(&clock, current);
    let state = battery.state();
    assert_abs_diff_eq!(state.capacity.q0, 439.25, epsilon = 0.01);
    assert_abs_diff_eq!(state.capacity.soc, 45.32, epsilon = 0.3);
    assert_abs_diff_eq!(battery.pack_voltage(), 373.39, epsilon = 0.2);
    assert_abs_diff_eq!(battery.temperature_k(), 294.29, epsilon = 0.15);

    sweep_cycles(&mut battery, &mut clock, current, 400);
    let cycles = battery.cycles_elapsed();
    assert!(
        (260..=345).contains(&cycles),
        "expected roughly 303 closed cycles, got {cycles}"
    );
    assert_abs_diff_eq!(battery.charge_maximum(), 942.0, epsilon = 10.0);
}

#[test]
fn kibam_sequence_matches_the_reference_battery() {
    let mut params = lithium_params();
    params.capacity = CapacityParams {
        chemistry: Chemistry::LeadAcid,
        qmax_nominal: 100.0,
        soc_init: 50.0,
        soc_min: 5.0,
        soc_max: 95.0,
        lead_acid: Some(KibamReference {
            q20: 100.0,
            q10: 93.0,
            q1: 60.0,
            t1: 1.0,
        }),
    };
    // flat derate at room temperature keeps the thermal envelope out of the way
    params.thermal.cap_vs_temp = vec![[263.15, 60.0], [283.15, 100.0], [318.15, 100.0]];
    let mut battery = Battery::new(params).unwrap();
    let mut clock = StepClock::new(1);

    battery.run(&clock, 30.0);
    assert_abs_diff_eq!(battery.state().capacity.q0, 24.07, epsilon = 0.1);
    assert_abs_diff_eq!(battery.charge_maximum(), 108.16, epsilon = 0.1);
    assert_abs_diff_eq!(battery.soc(), 22.26, epsilon = 0.1);

    clock.advance_one_step();
    battery.run(&clock, -30.0);
    assert_abs_diff_eq!(battery.state().capacity.q0, 54.07, epsilon = 0.1);
    assert_abs_diff_eq!(battery.soc(), 50.0, epsilon = 0.1);
}

#[test]
fn controller_round_trip_conserves_energy_up_to_losses() {
    let battery = Battery::new(lithium_params()).unwrap();
    let mut controller = ChargeController::new(battery, controller_params(), None).unwrap();
    let mut clock = StepClock::new(1);

    let start_soc = controller.battery().soc();
    let mut dc_in = 0.0;
    let mut dc_out = 0.0;

    for _ in 0..20 {
        // charge from PV for six hours, discharge into load for six hours
        for _ in 0..6 {
            let inputs = StepInputs::new(12.0, 1.0, 293.15);
            let realized = controller.run_dispatch(&clock, -8.0, &inputs);
            dc_in += (-realized).max(0.0);
            assert!(controller.flow_state().verify_load_balance(1e-6));
            assert!(controller.flow_state().verify_generation_balance(1e-6));
            clock.advance_one_step();
        }
        for _ in 0..6 {
            let inputs = StepInputs::new(0.0, 10.0, 293.15);
            let realized = controller.run_dispatch(&clock, 8.0, &inputs);
            dc_out += realized.max(0.0);
            assert!(controller.flow_state().verify_load_balance(1e-6));
            assert!(controller.flow_state().verify_generation_balance(1e-6));
            clock.advance_one_step();
        }
    }

    // SOC-window invariant holds at every resolved step end
    let soc = controller.battery().soc();
    assert!((5.0 - 0.01..=95.0 + 0.01).contains(&soc));

    // energy in = energy out + stored delta + internal dissipation, and the
    // dissipation must be non-negative and modest at this C-rate
    let stored_delta_kwh = (controller.battery().soc() - start_soc) / 100.0
        * controller.battery().charge_maximum_thermal()
        * controller.battery().pack_voltage_nominal()
        / 1000.0;
    let dissipation = dc_in - dc_out - stored_delta_kwh;
    assert!(
        dissipation > -0.02 * dc_in && dissipation < 0.2 * dc_in,
        "dc_in={dc_in:.2} dc_out={dc_out:.2} stored={stored_delta_kwh:.2}"
    );

    // AC accounting: charging energy always exceeds discharging energy by the
    // conversion losses
    let metrics = controller.metrics();
    assert!(metrics.energy_charge_total_kwh() > 0.0);
    assert!(metrics.energy_discharge_total_kwh() > 0.0);
    assert!(metrics.average_roundtrip_efficiency() < 100.0);
    assert!(metrics.average_roundtrip_efficiency() > 50.0);
}

#[test]
fn charge_request_against_power_limit_and_full_battery() {
    // the two halves of the controller clamping scenario: a full battery
    // refuses outright, a mid-SOC battery clamps to the configured kW limit
    let mut limited = controller_params();
    limited.limits = LimitPolicy::RestrictPower;
    limited.power_charge_max_kwdc = 1.0;

    let mut full_params = lithium_params();
    full_params.capacity.soc_init = 95.0;
    let full_battery = Battery::new(full_params).unwrap();
    let mut controller = ChargeController::new(full_battery, limited.clone(), None).unwrap();
    let clock = StepClock::new(1);
    let realized = controller.run_dispatch(&clock, -10.0, &StepInputs::new(12.0, 0.0, 293.15));
    assert_abs_diff_eq!(realized, 0.0, epsilon = 0.01);

    let battery = Battery::new(lithium_params()).unwrap();
    let mut controller = ChargeController::new(battery, limited, None).unwrap();
    let realized = controller.run_dispatch(&clock, -10.0, &StepInputs::new(12.0, 0.0, 293.15));
    assert!(realized < 0.0 && realized.abs() <= 1.0 + 0.1, "got {realized}");
}

#[test]
fn battery_state_blob_reproduces_behavior() {
    let mut battery = Battery::new(lithium_params()).unwrap();
    let mut clock = StepClock::new(1);
    for _ in 0..8 {
        battery.run(&clock, 15.0);
        clock.advance_one_step();
    }

    // persist and restore the snapshot through serde
    let blob = serde_json::to_string(&battery.state()).unwrap();
    let restored: battery_storage_sim::BatteryState = serde_json::from_str(&blob).unwrap();
    assert_eq!(restored, battery.state());

    let mut twin = Battery::new(lithium_params()).unwrap();
    twin.set_state(restored);

    for _ in 0..10 {
        let a = battery.run(&clock, -12.0);
        let b = twin.run(&clock, -12.0);
        assert_eq!(a, b);
        clock.advance_one_step();
    }
    assert_eq!(battery.state(), twin.state());
}

#[test]
fn capacity_replacement_policy_triggers_and_resets() {
    let mut params = lithium_params();
    params.replacement = ReplacementPolicy::Capacity {
        threshold_percent: 98.0,
    };
    let mut battery = Battery::new(params).unwrap();
    let mut clock = StepClock::new(1);

    battery.run(&clock, 20.25);
    while battery.soc() > 6.0 {
        clock.advance_one_step();
        battery.run(&clock, 20.25);
    }
    sweep_cycles(&mut battery, &mut clock, 20.25, 200);

    assert!(battery.replacements() > 0, "fade should have crossed 98%");
    assert!(battery.capacity_percent() > 97.0, "replacement restores capacity");
}
