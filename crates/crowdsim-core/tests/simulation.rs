use crowdsim_core::{
    AgentParams, CrowdSimulation, INFEASIBLE_ENERGY, SimulationConfig, StepReport, Vec2,
};

fn simulation(config: SimulationConfig) -> CrowdSimulation {
    CrowdSimulation::new(config, (-5.0, -5.0), (10.0, 10.0), 10, 10).expect("simulation")
}

/// Steps to completion, asserting every inner solve stayed feasible and
/// decreased its energy.
fn run_checked(sim: &mut CrowdSimulation) -> Vec<StepReport> {
    let mut reports = Vec::new();
    while !sim.finished() {
        let report = sim.step();
        if let Some(solve) = report.solve {
            assert!(solve.value.is_finite());
            assert!(
                solve.value < INFEASIBLE_ENERGY,
                "accepted step must be feasible at step {}",
                report.step
            );
            assert!(
                solve.value <= solve.initial_value + 1e-9,
                "energy must not increase within step {}: {} -> {}",
                report.step,
                solve.initial_value,
                solve.value
            );
        }
        reports.push(report);
    }
    reports
}

/// Smallest distance between any two agents across the logged trajectories.
fn min_pairwise_distance(sim: &CrowdSimulation) -> f64 {
    let paths: Vec<&[Vec2]> = sim.agents().iter().map(|agent| agent.path()).collect();
    let steps = paths.iter().map(|path| path.len()).min().unwrap_or(0);
    let mut min_dist = f64::INFINITY;
    for t in 0..steps {
        for i in 0..paths.len() {
            for j in i + 1..paths.len() {
                min_dist = min_dist.min((paths[i][t] - paths[j][t]).norm());
            }
        }
    }
    min_dist
}

#[test]
fn single_agent_walks_a_straight_line() {
    let mut sim = simulation(SimulationConfig::default());
    sim.add_agent(AgentParams {
        position: Vec2::new(-4.0, 0.0),
        goal: Vec2::new(4.0, 0.0),
        pref_speed: 1.0,
        radius: 0.3,
        ..AgentParams::default()
    })
    .expect("agent");

    run_checked(&mut sim);

    let agent = &sim.agents()[0];
    assert!(sim.all_reached());
    assert!(!agent.enabled());
    // Straight-line goal must absorb within ceil(8 / (1.0 * 0.2)) steps.
    assert!(sim.iteration() <= 41, "took {} steps", sim.iteration());
    assert!((agent.position() - agent.goal()).norm() < 1.0);
    for point in agent.path() {
        assert!(point.y.abs() < 1e-6, "path deviated laterally: {point:?}");
    }
}

#[test]
fn head_on_pair_passes_and_keeps_clearance() {
    let config = SimulationConfig {
        max_steps: 300,
        ..SimulationConfig::default()
    };
    let mut sim = simulation(config);
    sim.add_agent(AgentParams {
        position: Vec2::new(-3.0, 0.05),
        goal: Vec2::new(3.0, 0.0),
        pref_speed: 1.0,
        radius: 0.5,
        ..AgentParams::default()
    })
    .expect("agent");
    sim.add_agent(AgentParams {
        position: Vec2::new(3.0, -0.05),
        goal: Vec2::new(-3.0, 0.0),
        pref_speed: 1.0,
        radius: 0.5,
        ..AgentParams::default()
    })
    .expect("agent");

    run_checked(&mut sim);

    assert!(sim.all_reached(), "pair deadlocked");
    assert!(
        min_pairwise_distance(&sim) > 1.0,
        "agents came closer than their summed radii"
    );
}

#[test]
fn antipodal_circle_resolves_without_tunneling() {
    let config = SimulationConfig {
        max_steps: 400,
        ..SimulationConfig::default()
    };
    let mut sim = simulation(config);
    for i in 0..8u32 {
        // A small angular stagger keeps the crossing from being perfectly
        // symmetric, as any sampled scenario would be.
        let angle = f64::from(i) * std::f64::consts::TAU / 8.0 + 0.01 * f64::from(i);
        let position = Vec2::new(4.0 * angle.cos(), 4.0 * angle.sin());
        sim.add_agent(AgentParams {
            position,
            goal: -position,
            pref_speed: 1.0,
            radius: 0.3,
            ..AgentParams::default()
        })
        .expect("agent");
    }

    let reports = run_checked(&mut sim);

    assert!(sim.all_reached(), "circle crossing deadlocked");
    assert!(!reports.is_empty());
    assert!(min_pairwise_distance(&sim) > 0.6);
    for agent in sim.agents() {
        assert!((agent.position() - agent.goal()).norm() < 1.0);
    }
}

#[test]
fn zeroed_pairwise_weights_recover_the_closed_form() {
    let config = SimulationConfig {
        k: 0.0,
        eta: 0.0,
        ..SimulationConfig::default()
    };
    let dt = config.dt;
    let ksi = config.ksi;
    let mut sim = simulation(config);
    sim.add_agent(AgentParams {
        position: Vec2::new(-1.0, 0.0),
        goal: Vec2::new(4.0, 0.0),
        pref_speed: 1.0,
        radius: 0.5,
        ..AgentParams::default()
    })
    .expect("agent");
    sim.add_agent(AgentParams {
        position: Vec2::new(1.0, 0.0),
        goal: Vec2::new(-4.0, 0.0),
        pref_speed: 1.0,
        radius: 0.5,
        ..AgentParams::default()
    })
    .expect("agent");

    sim.step();

    // With the pairwise terms switched off the optimum is the blend of the
    // (zero) previous velocity and the goal velocity, neighbors or not.
    for agent in sim.agents() {
        let expected = agent.preferred_velocity() * (ksi / (dt + ksi));
        assert!((agent.velocity() - expected).norm() < 1e-10);
    }
}

#[test]
fn trajectories_log_one_snapshot_per_step() {
    let mut sim = simulation(SimulationConfig::default());
    sim.add_agent(AgentParams {
        position: Vec2::new(-4.0, 0.0),
        goal: Vec2::new(4.0, 0.0),
        pref_speed: 1.0,
        radius: 0.3,
        ..AgentParams::default()
    })
    .expect("agent");

    for _ in 0..5 {
        sim.step();
    }

    let agent = &sim.agents()[0];
    assert_eq!(agent.path().len(), 6);
    assert_eq!(agent.orientations().len(), 6);
    // Orientation settles onto the direction of travel.
    let orientation = agent.orientation();
    assert!((orientation.norm() - 1.0).abs() < 1e-6);
    assert!(orientation.x > 0.9);
}
