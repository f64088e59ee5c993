use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use crowdsim_core::{AgentParams, CrowdSimulation, SimulationConfig, Vec2};
use std::time::Duration;

fn bench_simulation_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("crowd_step");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    let steps: usize = std::env::var("CROWDSIM_BENCH_STEPS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|&value| value > 0)
        .unwrap_or(8);

    for &agents in &[64_usize, 256, 1024] {
        group.bench_function(format!("steps{steps}_agents{agents}"), |b| {
            b.iter_batched(
                || {
                    let config = SimulationConfig {
                        max_steps: u64::MAX,
                        ..SimulationConfig::default()
                    };
                    let mut sim =
                        CrowdSimulation::new(config, (-60.0, -60.0), (120.0, 120.0), 24, 24)
                            .expect("simulation");
                    // Two opposing columns marching through each other.
                    let columns = (agents / 2).max(1);
                    for row in 0..columns {
                        let y = row as f64 * 1.5 - columns as f64 * 0.75;
                        sim.add_agent(AgentParams {
                            position: Vec2::new(-40.0, y),
                            goal: Vec2::new(40.0, y),
                            pref_speed: 1.3,
                            radius: 0.4,
                            ..AgentParams::default()
                        })
                        .expect("agent");
                        sim.add_agent(AgentParams {
                            position: Vec2::new(40.0, y + 0.4),
                            goal: Vec2::new(-40.0, y + 0.4),
                            pref_speed: 1.3,
                            radius: 0.4,
                            ..AgentParams::default()
                        })
                        .expect("agent");
                    }
                    sim
                },
                |mut sim| {
                    for _ in 0..steps {
                        sim.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_simulation_steps);
criterion_main!(benches);
