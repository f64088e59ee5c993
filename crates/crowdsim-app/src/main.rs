//! Command-line shell: reads a scenario and optional parameter overrides,
//! runs the simulation to completion, and exports the trajectories.

use anyhow::{Context, Result, bail};
use clap::Parser;
use crowdsim_core::{AgentParams, CrowdSimulation, SimulationConfig, Vec2};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bin subdivisions of the scenario region along each axis.
const GRID_DIVISIONS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "crowdsim", version, about = "Implicit crowd simulation shell")]
struct AppCli {
    /// Scenario file: region bounds, agent count, then one record per agent.
    #[arg(long, value_name = "FILE")]
    scenario: PathBuf,
    /// Optional key=value parameter overrides.
    #[arg(long, value_name = "FILE")]
    parameters: Option<PathBuf>,
    /// Simulation time step in seconds.
    #[arg(long, default_value_t = 0.2)]
    dt: f64,
    /// Maximum number of frames to simulate.
    #[arg(long, default_value_t = 1000)]
    frames: u64,
    /// Write per-agent trajectories to this file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = AppCli::parse();
    let summary = execute(&cli)?;
    info!(
        steps = summary.steps,
        reached = summary.agents_reached,
        agents = summary.agent_count,
        simulated_seconds = summary.simulated_time,
        "Simulation finished"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RunSummary {
    steps: u64,
    agents_reached: usize,
    agent_count: usize,
    simulated_time: f64,
}

fn execute(cli: &AppCli) -> Result<RunSummary> {
    let text = fs::read_to_string(&cli.scenario)
        .with_context(|| format!("failed to read scenario file {}", cli.scenario.display()))?;
    let scenario = parse_scenario(&text)?;

    let mut config = SimulationConfig {
        dt: cli.dt,
        max_steps: cli.frames,
        ..SimulationConfig::default()
    };
    if let Some(path) = &cli.parameters {
        apply_parameter_overrides(&mut config, path)?;
    }

    let origin = (scenario.x_min, scenario.y_min);
    let size = (
        scenario.x_max - scenario.x_min,
        scenario.y_max - scenario.y_min,
    );
    let mut sim = CrowdSimulation::new(config, origin, size, GRID_DIVISIONS, GRID_DIVISIONS)?;
    for params in &scenario.agents {
        sim.add_agent(*params)?;
    }
    info!(
        agents = scenario.agents.len(),
        scenario = %cli.scenario.display(),
        "Scenario loaded"
    );

    while !sim.finished() {
        let report = sim.step();
        if let Some(solve) = report.solve {
            debug!(
                step = report.step,
                active = report.active_agents,
                solver_iterations = solve.iterations,
                energy = solve.value,
                "Advanced step"
            );
        }
    }

    if let Some(path) = &cli.output {
        write_trajectories(&sim, path)?;
        info!(output = %path.display(), "Trajectories written");
    }

    let agents_reached = sim
        .agents()
        .iter()
        .filter(|agent| !agent.enabled())
        .count();
    Ok(RunSummary {
        steps: sim.iteration(),
        agents_reached,
        agent_count: sim.agents().len(),
        simulated_time: sim.global_time(),
    })
}

#[derive(Debug, Clone, PartialEq)]
struct Scenario {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    agents: Vec<AgentParams>,
}

/// Whitespace-token scenario format: `xMin xMax yMin yMax`, the agent count,
/// then `gid x y goal_x goal_y pref_speed radius` per agent. Agents start at
/// rest with a goal radius of one world unit.
fn parse_scenario(text: &str) -> Result<Scenario> {
    let mut tokens = Tokens::new(text);
    let x_min = tokens.next_f64("xMin")?;
    let x_max = tokens.next_f64("xMax")?;
    let y_min = tokens.next_f64("yMin")?;
    let y_max = tokens.next_f64("yMax")?;
    if !(x_max > x_min) || !(y_max > y_min) {
        bail!("scenario region is empty: [{x_min}, {x_max}] x [{y_min}, {y_max}]");
    }

    let count = tokens.next_usize("agent count")?;
    let mut agents = Vec::with_capacity(count);
    for record in 0..count {
        let what = |field: &str| format!("{field} of agent record {record}");
        let group = tokens.next_u32(&what("gid"))?;
        let position = Vec2::new(tokens.next_f64(&what("x"))?, tokens.next_f64(&what("y"))?);
        let goal = Vec2::new(
            tokens.next_f64(&what("goal_x"))?,
            tokens.next_f64(&what("goal_y"))?,
        );
        let pref_speed = tokens.next_f64(&what("pref_speed"))?;
        let radius = tokens.next_f64(&what("radius"))?;
        agents.push(AgentParams {
            group,
            position,
            goal,
            velocity: Vec2::ZERO,
            pref_speed,
            radius,
            goal_radius: 1.0,
        });
    }

    Ok(Scenario {
        x_min,
        x_max,
        y_min,
        y_max,
        agents,
    })
}

struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.split_whitespace(),
        }
    }

    fn next_token(&mut self, what: &str) -> Result<&'a str> {
        self.inner
            .next()
            .with_context(|| format!("scenario file truncated while reading {what}"))
    }

    fn next_f64(&mut self, what: &str) -> Result<f64> {
        let token = self.next_token(what)?;
        token
            .parse()
            .with_context(|| format!("invalid {what}: {token:?}"))
    }

    fn next_u32(&mut self, what: &str) -> Result<u32> {
        let token = self.next_token(what)?;
        token
            .parse()
            .with_context(|| format!("invalid {what}: {token:?}"))
    }

    fn next_usize(&mut self, what: &str) -> Result<usize> {
        let token = self.next_token(what)?;
        token
            .parse()
            .with_context(|| format!("invalid {what}: {token:?}"))
    }
}

/// Applies line-based `key=value` overrides onto the configuration.
///
/// Surrounding whitespace is trimmed, lines without `=` are skipped, later
/// duplicates win, and unrecognized keys are logged and ignored. A missing
/// file only warns; an unparsable value for a known key is fatal.
fn apply_parameter_overrides(config: &mut SimulationConfig, path: &Path) -> Result<()> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(parameters = %path.display(), "Parameter file not found; keeping defaults");
            return Ok(());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read parameter file {}", path.display()));
        }
    };

    let mut applied = 0usize;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "k" => config.k = parse_value(key, value)?,
            "p" => config.p = parse_value(key, value)?,
            "t0" => config.t0 = parse_value(key, value)?,
            "ksi" => config.ksi = parse_value(key, value)?,
            "eps" => config.eps = parse_value(key, value)?,
            "repulsive" => config.eta = parse_value(key, value)?,
            "neighborDist" => config.neighbor_dist = parse_value(key, value)?,
            "newtonIter" => config.newton_iter = parse_value(key, value)?,
            "lbfgsWindow" => config.lbfgs_window = parse_value(key, value)?,
            "eps_x" => config.eps_x = parse_value(key, value)?,
            other => {
                warn!(key = other, "Ignoring unrecognized parameter");
                continue;
            }
        }
        applied += 1;
    }
    info!(
        parameters = %path.display(),
        applied,
        "Parameter overrides applied"
    );
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value for parameter {key}: {value:?}"))
}

/// Plain-text trajectory table consumed by the visualization tooling: one
/// `(position, orientation)` row per agent per simulated step.
fn write_trajectories(sim: &CrowdSimulation, path: &Path) -> Result<()> {
    let mut out = String::from("# step agent group x y ox oy\n");
    for agent in sim.agents() {
        for (step, (point, orientation)) in agent
            .path()
            .iter()
            .zip(agent.orientations())
            .enumerate()
        {
            writeln!(
                out,
                "{step} {} {} {} {} {} {}",
                agent.id(),
                agent.group(),
                point.x,
                point.y,
                orientation.x,
                orientation.y
            )
            .expect("writing to a String cannot fail");
        }
    }
    fs::write(path, out)
        .with_context(|| format!("failed to write trajectories to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TWO_AGENT_SCENARIO: &str = "\
-5 5 -5 5
2
0 -4 0 4 0 1.0 0.3
1 4 2 -4 2 1.0 0.3
";

    #[test]
    fn scenario_parses_header_and_records() {
        let scenario = parse_scenario(TWO_AGENT_SCENARIO).expect("scenario");
        assert_eq!(scenario.x_min, -5.0);
        assert_eq!(scenario.y_max, 5.0);
        assert_eq!(scenario.agents.len(), 2);
        let second = scenario.agents[1];
        assert_eq!(second.group, 1);
        assert_eq!(second.position, Vec2::new(4.0, 2.0));
        assert_eq!(second.goal, Vec2::new(-4.0, 2.0));
        assert_eq!(second.velocity, Vec2::ZERO);
        assert_eq!(second.goal_radius, 1.0);
    }

    #[test]
    fn truncated_scenario_is_rejected() {
        let err = parse_scenario("-5 5 -5 5\n2\n0 -4 0 4 0 1.0").expect_err("truncated");
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn non_numeric_scenario_token_is_rejected() {
        let err = parse_scenario("-5 5 -5 bogus\n0").expect_err("non-numeric");
        assert!(err.to_string().contains("yMax"), "{err}");
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(parse_scenario("5 -5 -5 5\n0").is_err());
    }

    #[test]
    fn parameter_overrides_trim_and_last_wins() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("params.txt");
        fs::write(
            &path,
            "  k = 3.0\nrepulsive=0.5\nthis line has no equals sign\nk=0.75\n neighborDist = 4 \nlbfgsWindow=7\nunknownKey=1\n",
        )
        .expect("write params");

        let mut config = SimulationConfig::default();
        apply_parameter_overrides(&mut config, &path).expect("overrides");
        assert_eq!(config.k, 0.75);
        assert_eq!(config.eta, 0.5);
        assert_eq!(config.neighbor_dist, 4.0);
        assert_eq!(config.lbfgs_window, 7);
        // Untouched keys keep their defaults.
        assert_eq!(config.t0, 3.0);
    }

    #[test]
    fn unparsable_parameter_value_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("params.txt");
        fs::write(&path, "k=not-a-number\n").expect("write params");

        let mut config = SimulationConfig::default();
        let err = apply_parameter_overrides(&mut config, &path).expect_err("bad value");
        assert!(err.to_string().contains("parameter k"), "{err}");
    }

    #[test]
    fn missing_parameter_file_keeps_defaults() {
        let dir = tempdir().expect("tempdir");
        let mut config = SimulationConfig::default();
        apply_parameter_overrides(&mut config, &dir.path().join("absent.txt")).expect("missing");
        assert_eq!(config.k, SimulationConfig::default().k);
    }

    #[test]
    fn end_to_end_run_reaches_goals_and_exports() {
        let dir = tempdir().expect("tempdir");
        let scenario_path = dir.path().join("scenario.txt");
        fs::write(&scenario_path, TWO_AGENT_SCENARIO).expect("write scenario");
        let output_path = dir.path().join("paths.txt");

        let cli = AppCli {
            scenario: scenario_path,
            parameters: None,
            dt: 0.2,
            frames: 100,
            output: Some(output_path.clone()),
        };
        let summary = execute(&cli).expect("run");
        assert_eq!(summary.agent_count, 2);
        assert_eq!(summary.agents_reached, 2);
        assert!(summary.steps < 100);
        assert!((summary.simulated_time - summary.steps as f64 * 0.2).abs() < 1e-9);

        let exported = fs::read_to_string(&output_path).expect("read output");
        let mut lines = exported.lines();
        assert_eq!(lines.next(), Some("# step agent group x y ox oy"));
        // One row per agent per logged snapshot; both agents cover the same
        // distance and disable on the same step.
        assert_eq!(
            lines.filter(|line| !line.is_empty()).count(),
            2 * (summary.steps as usize + 1),
        );
    }

    #[test]
    fn parameter_overrides_feed_the_run() {
        let dir = tempdir().expect("tempdir");
        let scenario_path = dir.path().join("scenario.txt");
        fs::write(&scenario_path, TWO_AGENT_SCENARIO).expect("write scenario");
        let params_path = dir.path().join("params.txt");
        fs::write(&params_path, "newtonIter=1\nlbfgsWindow=1\n").expect("write params");

        let cli = AppCli {
            scenario: scenario_path,
            parameters: Some(params_path),
            dt: 0.2,
            frames: 50,
            output: None,
        };
        // Even a crippled solver budget reaches both goals within the frames.
        let summary = execute(&cli).expect("run");
        assert_eq!(summary.agents_reached, 2);
        assert!(summary.steps < 50);
    }
}
