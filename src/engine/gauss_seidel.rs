use chrono::Utc;
use nalgebra::{Complex, DMatrix};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use super::Engine;
use crate::domain::{
    BusState, BusType, Command, ElementKind, GeneratorState, GridState, LineInfo, LineState,
    LoadState, NetworkTopology, SolveSummary, StorageState, TransformerInfo, TransformerState,
};
use crate::error::{CommandError, EngineError, SolveError, TopologyError};

const ENGINE_NAME: &str = "gauss_seidel";

/// Voltage magnitude treated as divergence
const MAX_VOLTAGE_PU: f64 = 10.0;

/// Floor for branch impedances so zero-impedance ties stay solvable
const MIN_IMPEDANCE_PU: f64 = 1e-6;

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: u32,
    /// Largest per-iteration voltage update (pu) accepted as converged
    pub tolerance: f64,
    /// Over-relaxation factor, 1.0 disables acceleration
    pub acceleration: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            acceleration: 1.4,
        }
    }
}

/// Setpoints that commands mutate between solves
#[derive(Debug, Clone)]
struct Setpoints {
    line_closed: Vec<bool>,
    taps: Vec<i32>,
    gen_p: Vec<f64>,
    gen_q: Vec<f64>,
    load_p: Vec<f64>,
    load_q: Vec<f64>,
    storage_p: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Model {
    topology: NetworkTopology,
    setpoints: Setpoints,
    /// Warm start for the next solve
    voltages: Vec<C64>,
    line_ends: Vec<(usize, usize)>,
    trafo_ends: Vec<(usize, usize)>,
    gen_bus: Vec<usize>,
    load_bus: Vec<usize>,
    storage_bus: Vec<usize>,
    /// State of charge carried from step to step
    soc: Vec<f64>,
}

/// Reference AC power flow solved with accelerated Gauss-Seidel iteration.
///
/// Generators, loads and storage are constant PQ injections, slack buses hold their
/// voltage setpoint, and anything unreachable from a slack bus through closed
/// branches is de-energized.
pub struct GaussSeidelEngine {
    options: SolverOptions,
    model: Option<Model>,
    last: Option<GridState>,
    steps: u64,
}

impl GaussSeidelEngine {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            model: None,
            last: None,
            steps: 0,
        }
    }
}

impl Default for GaussSeidelEngine {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

impl Engine for GaussSeidelEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn load(&mut self, topology: &NetworkTopology) -> Result<(), EngineError> {
        topology.validate()?;
        if topology.slack_buses().next().is_none() {
            return Err(EngineError::Unsupported {
                engine: ENGINE_NAME,
                reason: "network has no slack bus".to_string(),
            });
        }

        let positions: HashMap<u32, usize> = topology
            .buses
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id, i))
            .collect();
        let locate = |kind: ElementKind, id: u32, bus: u32| {
            positions
                .get(&bus)
                .copied()
                .ok_or(EngineError::InvalidTopology(TopologyError::UnknownBus { kind, id, bus }))
        };

        let mut line_ends = Vec::with_capacity(topology.lines.len());
        for line in &topology.lines {
            line_ends.push((
                locate(ElementKind::Line, line.id, line.from_bus)?,
                locate(ElementKind::Line, line.id, line.to_bus)?,
            ));
        }
        let mut trafo_ends = Vec::with_capacity(topology.transformers.len());
        for trafo in &topology.transformers {
            trafo_ends.push((
                locate(ElementKind::Transformer, trafo.id, trafo.hv_bus)?,
                locate(ElementKind::Transformer, trafo.id, trafo.lv_bus)?,
            ));
        }
        let mut gen_bus = Vec::with_capacity(topology.generators.len());
        for gen in &topology.generators {
            gen_bus.push(locate(ElementKind::Generator, gen.id, gen.bus)?);
        }
        let mut load_bus = Vec::with_capacity(topology.loads.len());
        for load in &topology.loads {
            load_bus.push(locate(ElementKind::Load, load.id, load.bus)?);
        }
        let mut storage_bus = Vec::with_capacity(topology.storage.len());
        for unit in &topology.storage {
            storage_bus.push(locate(ElementKind::Storage, unit.id, unit.bus)?);
        }

        let setpoints = Setpoints {
            line_closed: topology.lines.iter().map(|l| l.closed).collect(),
            taps: topology.transformers.iter().map(|t| t.tap_position).collect(),
            gen_p: topology.generators.iter().map(|g| g.p_mw).collect(),
            gen_q: topology.generators.iter().map(|g| g.q_mvar).collect(),
            load_p: topology.loads.iter().map(|l| l.p_mw).collect(),
            load_q: topology.loads.iter().map(|l| l.q_mvar).collect(),
            storage_p: topology.storage.iter().map(|s| s.p_mw).collect(),
        };

        debug!(
            engine = ENGINE_NAME,
            buses = topology.buses.len(),
            lines = topology.lines.len(),
            transformers = topology.transformers.len(),
            storage = topology.storage.len(),
            "topology loaded"
        );

        self.model = Some(Model {
            voltages: vec![C64::new(1.0, 0.0); topology.buses.len()],
            topology: topology.clone(),
            setpoints,
            line_ends,
            trafo_ends,
            gen_bus,
            load_bus,
            storage_bus,
            soc: topology.storage.iter().map(|s| s.soc_percent).collect(),
        });
        self.last = None;
        self.steps = 0;
        Ok(())
    }

    fn solve(&mut self, elapsed: Duration) -> Result<GridState, SolveError> {
        let model = self.model.as_mut().ok_or(SolveError::NotLoaded)?;
        let started = Instant::now();

        let energized = model.energized();
        let storage_p = model.storage_output(&energized);
        let ybus = model.admittance();
        let injections = model.injections(&energized, &storage_p);
        let topology = &model.topology;

        let mut free = Vec::new();
        for (i, bus) in topology.buses.iter().enumerate() {
            let v = &mut model.voltages[i];
            if !energized[i] {
                *v = C64::new(0.0, 0.0);
            } else if bus.bus_type == BusType::Slack {
                *v = C64::new(bus.vm_setpoint_pu, 0.0);
            } else {
                if v.norm() < 1e-3 || !v.re.is_finite() || !v.im.is_finite() {
                    *v = C64::new(1.0, 0.0);
                }
                free.push(i);
            }
        }

        let mut trial = model.voltages.clone();
        let (iterations, _) = iterate(&ybus, &injections, &mut trial, &free, &self.options)?;
        model.voltages = trial;
        for (k, unit) in model.topology.storage.iter().enumerate() {
            model.soc[k] = unit.soc_after(model.soc[k], storage_p[k], elapsed);
        }

        let voltages = &model.voltages;
        let currents = &ybus * nalgebra::DVector::from_column_slice(voltages);
        let max_mismatch = free
            .iter()
            .map(|&i| (voltages[i] * currents[i].conj() - injections[i]).norm())
            .fold(0.0, f64::max);

        let state = model.collect(&energized, &ybus, &injections, &storage_p, self.steps + 1, SolveSummary {
            converged: true,
            iterations,
            max_mismatch,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        });

        self.steps += 1;
        debug!(
            engine = ENGINE_NAME,
            step = self.steps,
            iterations,
            max_mismatch,
            "power flow converged"
        );
        self.last = Some(state.clone());
        Ok(state)
    }

    fn apply(&mut self, command: &Command) -> Result<(), CommandError> {
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| CommandError::Engine("no topology loaded".to_string()))?;
        command.validate(&model.topology)?;

        let target = command.target();
        let unknown = || CommandError::UnknownTarget {
            kind: target.kind,
            id: target.id,
        };
        let topology = &model.topology;
        let sp = &mut model.setpoints;

        match *command {
            Command::Load { load_id, p_mw, q_mvar } => {
                let k = topology.loads.iter().position(|l| l.id == load_id).ok_or_else(unknown)?;
                sp.load_p[k] = p_mw;
                if let Some(q) = q_mvar {
                    sp.load_q[k] = q;
                }
            }
            Command::Generator {
                generator_id,
                p_mw,
                q_mvar,
            } => {
                let k = topology
                    .generators
                    .iter()
                    .position(|g| g.id == generator_id)
                    .ok_or_else(unknown)?;
                sp.gen_p[k] = p_mw;
                if let Some(q) = q_mvar {
                    sp.gen_q[k] = q;
                }
            }
            Command::Breaker { line_id, closed } => {
                let k = topology.lines.iter().position(|l| l.id == line_id).ok_or_else(unknown)?;
                sp.line_closed[k] = closed;
            }
            Command::TransformerTap {
                transformer_id,
                tap_position,
            } => {
                let k = topology
                    .transformers
                    .iter()
                    .position(|t| t.id == transformer_id)
                    .ok_or_else(unknown)?;
                sp.taps[k] = tap_position;
            }
            Command::Storage { storage_id, p_mw } => {
                let k = topology
                    .storage
                    .iter()
                    .position(|s| s.id == storage_id)
                    .ok_or_else(unknown)?;
                sp.storage_p[k] = p_mw;
            }
        }
        Ok(())
    }

    fn current_state(&self) -> GridState {
        match (&self.last, &self.model) {
            (Some(state), _) => state.clone(),
            (None, Some(model)) => GridState::initial(&model.topology),
            (None, None) => GridState::initial(&NetworkTopology::default()),
        }
    }
}

impl Model {
    /// Buses reachable from a slack bus through closed branches
    fn energized(&self) -> Vec<bool> {
        let n = self.topology.buses.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (k, &(f, t)) in self.line_ends.iter().enumerate() {
            if self.setpoints.line_closed[k] {
                adjacency[f].push(t);
                adjacency[t].push(f);
            }
        }
        for &(h, l) in &self.trafo_ends {
            adjacency[h].push(l);
            adjacency[l].push(h);
        }

        let mut energized = vec![false; n];
        let mut queue: VecDeque<usize> = VecDeque::new();
        for (i, bus) in self.topology.buses.iter().enumerate() {
            if bus.bus_type == BusType::Slack {
                energized[i] = true;
                queue.push_back(i);
            }
        }
        while let Some(i) = queue.pop_front() {
            for &j in &adjacency[i] {
                if !energized[j] {
                    energized[j] = true;
                    queue.push_back(j);
                }
            }
        }
        energized
    }

    fn admittance(&self) -> DMatrix<C64> {
        let n = self.topology.buses.len();
        let base = self.topology.base_mva;
        let mut y = DMatrix::<C64>::zeros(n, n);

        for (k, line) in self.topology.lines.iter().enumerate() {
            if !self.setpoints.line_closed[k] {
                continue;
            }
            let (f, t) = self.line_ends[k];
            let ys = line_admittance(line, self.topology.buses[f].voltage_nominal_kv, base);
            y[(f, f)] += ys;
            y[(t, t)] += ys;
            y[(f, t)] -= ys;
            y[(t, f)] -= ys;
        }

        for (k, trafo) in self.topology.transformers.iter().enumerate() {
            let (h, l) = self.trafo_ends[k];
            let ys = transformer_admittance(trafo, base);
            let ratio = trafo.ratio_at(self.setpoints.taps[k]);
            y[(h, h)] += ys / (ratio * ratio);
            y[(l, l)] += ys;
            y[(h, l)] -= ys / ratio;
            y[(l, h)] -= ys / ratio;
        }
        y
    }

    /// Storage power after state-of-charge limits; zero when out of service or de-energized
    fn storage_output(&self, energized: &[bool]) -> Vec<f64> {
        self.topology
            .storage
            .iter()
            .enumerate()
            .map(|(k, unit)| {
                if unit.in_service && energized[self.storage_bus[k]] {
                    unit.available_p(self.soc[k], self.setpoints.storage_p[k])
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Net specified injection per bus in per-unit
    fn injections(&self, energized: &[bool], storage_p: &[f64]) -> Vec<C64> {
        let base = self.topology.base_mva;
        let mut s = vec![C64::new(0.0, 0.0); self.topology.buses.len()];
        for (k, gen) in self.topology.generators.iter().enumerate() {
            let bus = self.gen_bus[k];
            if gen.in_service && energized[bus] {
                s[bus] += C64::new(self.setpoints.gen_p[k], self.setpoints.gen_q[k]) / base;
            }
        }
        for (k, load) in self.topology.loads.iter().enumerate() {
            let bus = self.load_bus[k];
            if load.in_service && energized[bus] {
                s[bus] -= C64::new(self.setpoints.load_p[k], self.setpoints.load_q[k]) / base;
            }
        }
        for (k, &p) in storage_p.iter().enumerate() {
            s[self.storage_bus[k]] += C64::new(p / base, 0.0);
        }
        s
    }

    fn collect(
        &self,
        energized: &[bool],
        ybus: &DMatrix<C64>,
        injections: &[C64],
        storage_p: &[f64],
        step: u64,
        solve: SolveSummary,
    ) -> GridState {
        let topology = &self.topology;
        let base = topology.base_mva;
        let v = &self.voltages;
        let zero = C64::new(0.0, 0.0);

        let buses = topology
            .buses
            .iter()
            .enumerate()
            .map(|(i, bus)| BusState {
                bus_id: bus.id,
                voltage_pu: v[i].norm(),
                angle_deg: if energized[i] { v[i].arg().to_degrees() } else { 0.0 },
                energized: energized[i],
            })
            .collect();

        let lines = topology
            .lines
            .iter()
            .enumerate()
            .map(|(k, line)| {
                let (f, t) = self.line_ends[k];
                let closed = self.setpoints.line_closed[k];
                if !closed || !energized[f] {
                    return LineState {
                        line_id: line.id,
                        closed,
                        p_mw: 0.0,
                        q_mvar: 0.0,
                        p_to_mw: 0.0,
                        q_to_mvar: 0.0,
                        current_ka: 0.0,
                        loading_percent: 0.0,
                    };
                }
                let kv = topology.buses[f].voltage_nominal_kv;
                let current = (v[f] - v[t]) * line_admittance(line, kv, base);
                let s_from = v[f] * current.conj() * base;
                let s_to = v[t] * (-current).conj() * base;
                let current_ka = current.norm() * base / (3f64.sqrt() * kv);
                LineState {
                    line_id: line.id,
                    closed,
                    p_mw: s_from.re,
                    q_mvar: s_from.im,
                    p_to_mw: s_to.re,
                    q_to_mvar: s_to.im,
                    current_ka,
                    loading_percent: current_ka / line.max_current_ka * 100.0,
                }
            })
            .collect();

        let transformers = topology
            .transformers
            .iter()
            .enumerate()
            .map(|(k, trafo)| {
                let (h, l) = self.trafo_ends[k];
                let tap = self.setpoints.taps[k];
                let s_hv = if energized[h] {
                    let ratio = trafo.ratio_at(tap);
                    let current = (v[h] / ratio - v[l]) * transformer_admittance(trafo, base) / ratio;
                    v[h] * current.conj() * base
                } else {
                    zero
                };
                TransformerState {
                    transformer_id: trafo.id,
                    tap_position: tap,
                    p_hv_mw: s_hv.re,
                    q_hv_mvar: s_hv.im,
                    loading_percent: s_hv.norm() / trafo.sn_mva * 100.0,
                }
            })
            .collect();

        let generators: Vec<GeneratorState> = topology
            .generators
            .iter()
            .enumerate()
            .map(|(k, gen)| {
                let live = gen.in_service && energized[self.gen_bus[k]];
                GeneratorState {
                    generator_id: gen.id,
                    p_mw: if live { self.setpoints.gen_p[k] } else { 0.0 },
                    q_mvar: if live { self.setpoints.gen_q[k] } else { 0.0 },
                    in_service: gen.in_service,
                }
            })
            .collect();

        let loads: Vec<LoadState> = topology
            .loads
            .iter()
            .enumerate()
            .map(|(k, load)| {
                let live = load.in_service && energized[self.load_bus[k]];
                LoadState {
                    load_id: load.id,
                    p_mw: if live { self.setpoints.load_p[k] } else { 0.0 },
                    q_mvar: if live { self.setpoints.load_q[k] } else { 0.0 },
                    in_service: load.in_service,
                }
            })
            .collect();

        let mut slack_p_mw = 0.0;
        for (i, bus) in topology.buses.iter().enumerate() {
            if bus.bus_type != BusType::Slack {
                continue;
            }
            let mut current = zero;
            for j in 0..v.len() {
                current += ybus[(i, j)] * v[j];
            }
            slack_p_mw += ((v[i] * current.conj()).re - injections[i].re) * base;
        }

        let storage: Vec<StorageState> = topology
            .storage
            .iter()
            .enumerate()
            .map(|(k, unit)| StorageState {
                storage_id: unit.id,
                p_mw: storage_p[k],
                soc_percent: self.soc[k],
                in_service: unit.in_service,
            })
            .collect();
        let discharging: f64 = storage.iter().map(|s| s.p_mw.max(0.0)).sum();
        let charging: f64 = storage.iter().map(|s| (-s.p_mw).max(0.0)).sum();

        let total_generation_mw =
            generators.iter().map(|g| g.p_mw).sum::<f64>() + slack_p_mw + discharging;
        let total_load_mw = loads.iter().map(|l| l.p_mw).sum::<f64>() + charging;

        GridState {
            epoch: 0,
            step,
            timestamp: Utc::now(),
            buses,
            lines,
            transformers,
            generators,
            loads,
            storage,
            total_generation_mw,
            total_load_mw,
            total_losses_mw: total_generation_mw - total_load_mw,
            slack_p_mw,
            solve,
        }
    }
}

fn line_admittance(line: &LineInfo, kv: f64, base_mva: f64) -> C64 {
    let z_base = kv * kv / base_mva;
    let z = C64::new(line.r_ohm / z_base, line.x_ohm / z_base);
    if z.norm() < MIN_IMPEDANCE_PU {
        C64::new(0.0, -1.0 / MIN_IMPEDANCE_PU)
    } else {
        C64::new(1.0, 0.0) / z
    }
}

fn transformer_admittance(trafo: &TransformerInfo, base_mva: f64) -> C64 {
    let scale = base_mva / trafo.sn_mva;
    let z_mag = trafo.vk_percent / 100.0 * scale;
    let r = trafo.vkr_percent / 100.0 * scale;
    let x = (z_mag * z_mag - r * r).max(0.0).sqrt();
    let z = C64::new(r, x);
    if z.norm() < MIN_IMPEDANCE_PU {
        C64::new(0.0, -1.0 / MIN_IMPEDANCE_PU)
    } else {
        C64::new(1.0, 0.0) / z
    }
}

/// Returns the iteration count and final voltage update on convergence
fn iterate(
    y: &DMatrix<C64>,
    s: &[C64],
    v: &mut [C64],
    free: &[usize],
    options: &SolverOptions,
) -> Result<(u32, f64), SolveError> {
    if free.is_empty() {
        return Ok((0, 0.0));
    }

    let mut delta = f64::INFINITY;
    for iteration in 1..=options.max_iterations {
        delta = 0.0;
        for &i in free {
            let yii = y[(i, i)];
            if yii.norm() < f64::EPSILON {
                continue;
            }
            let mut sigma = C64::new(0.0, 0.0);
            for (j, vj) in v.iter().enumerate() {
                if j != i {
                    sigma += y[(i, j)] * vj;
                }
            }
            let target = (s[i].conj() / v[i].conj() - sigma) / yii;
            let next = v[i] + (target - v[i]) * options.acceleration;
            if !next.re.is_finite() || !next.im.is_finite() || next.norm() > MAX_VOLTAGE_PU {
                return Err(SolveError::NonConvergence {
                    iterations: iteration,
                    mismatch: f64::INFINITY,
                });
            }
            delta = delta.max((next - v[i]).norm());
            v[i] = next;
        }
        if delta < options.tolerance {
            return Ok((iteration, delta));
        }
    }

    Err(SolveError::NonConvergence {
        iterations: options.max_iterations,
        mismatch: delta,
    })
}
