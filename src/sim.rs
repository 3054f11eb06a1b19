//! Flight Simulation Boundary
//!
//! The trainers talk to a simulator only through [`FlightSim`]: send four rotor
//! speed commands, get back an [`Observation`] and whether the state diverged.
//!
//! [`HoverSim`] is a compact rigid-body model used by the binaries and tests.
//! It has rotor thrust `k_f ω²` along the body up axis, first-order rotor lag,
//! torques from differential thrust and rotor drag, and gravity. It is not a
//! faithful quadrotor model.
//!
//! Frames: world `y` points up; the body `y` axis is the thrust axis.

pub const ROTORS: usize = 4;

/// Rotor speed limits (rad/s)
pub const OMEGA_MIN: f64 = 30.0;
pub const OMEGA_MAX: f64 = 70.0;

/// Magnitude above which position, velocity or angular velocity counts as diverged
pub const SAFETY_BOUND: f64 = 10.0;

/// Hover target in world coordinates
pub const HOVER_TARGET: [f64; 3] = [0.0, 1.0, 0.0];
/// Episodes end once the craft is farther than this from the target
pub const HOVER_RADIUS: f64 = 1.0;

pub const DT_PHYSICS: f64 = 1.0 / 1000.0;
pub const DT_CONTROL: f64 = 1.0 / 60.0;

const GRAVITY: f64 = 9.81;

/// What the controller sees after each control step
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    pub position: [f64; 3],
    /// World-frame velocity
    pub velocity: [f64; 3],
    /// Body-frame velocity
    pub velocity_body: [f64; 3],
    /// Body-frame angular velocity
    pub angular_velocity: [f64; 3],
    /// Specific force in the body frame
    pub accelerometer: [f64; 3],
    pub gyro: [f64; 3],
    pub rotor_speeds: [f64; ROTORS],
}

impl Observation {
    /// Accelerometer then gyro, the policy's input state
    pub fn sensor_state(&self) -> [f64; 6] {
        let [ax, ay, az] = self.accelerometer;
        let [gx, gy, gz] = self.gyro;
        [ax, ay, az, gx, gy, gz]
    }

    pub fn distance_to(&self, target: &[f64; 3]) -> f64 {
        norm(&sub(&self.position, target))
    }

    /// True when any of position, velocity or angular velocity exceeds `SAFETY_BOUND`
    pub fn diverged(&self) -> bool {
        [self.position, self.velocity, self.angular_velocity]
            .iter()
            .any(|v| !(norm(v) <= SAFETY_BOUND))
    }
}

/// `exp(−4 × distance to the hover target)`
pub fn hover_reward(obs: &Observation) -> f64 {
    (-4.0 * obs.distance_to(&HOVER_TARGET)).exp()
}

/// A simulator the trainers can drive
pub trait FlightSim {
    /// Start a new episode
    fn reset(&mut self) -> Observation;

    /// Apply rotor speed commands for one control period
    ///
    /// Returns the new observation and `true` if the state diverged.
    fn step(&mut self, rotor_commands: &[f64; ROTORS]) -> (Observation, bool);
}

/// Physical constants for [`HoverSim`]
#[derive(Clone, Debug)]
pub struct HoverParams {
    pub mass: f64,
    /// Diagonal body inertia
    pub inertia: [f64; 3],
    pub arm: f64,
    /// Thrust coefficient
    pub k_f: f64,
    /// Drag torque coefficient
    pub k_m: f64,
    /// Rotor time constant (s)
    pub rotor_tau: f64,
    pub linear_drag: f64,
}

impl Default for HoverParams {
    fn default() -> Self {
        Self {
            mass: 0.5,
            inertia: [0.01, 0.02, 0.01],
            arm: 0.15,
            k_f: 4.905e-4,
            k_m: 1.0e-5,
            rotor_tau: 0.05,
            linear_drag: 0.1,
        }
    }
}

impl HoverParams {
    /// Rotor speed at which total thrust balances gravity
    pub fn hover_omega(&self) -> f64 {
        (self.mass * GRAVITY / (ROTORS as f64 * self.k_f)).sqrt()
    }
}

#[derive(Clone, Debug)]
pub struct HoverSim {
    pub params: HoverParams,
    position: [f64; 3],
    velocity: [f64; 3],
    /// Body-to-world rotation, row-major
    rotation: [[f64; 3]; 3],
    angular_velocity: [f64; 3],
    omega: [f64; ROTORS],
    accel_body: [f64; 3],
}

/// Rotor positions in the body x-z plane and yaw drag signs
const ROTOR_LAYOUT: [(f64, f64, f64); ROTORS] = [
    (-1.0, 1.0, 1.0),
    (1.0, 1.0, -1.0),
    (1.0, -1.0, 1.0),
    (-1.0, -1.0, -1.0),
];

impl Default for HoverSim {
    fn default() -> Self {
        Self::new(HoverParams::default())
    }
}

impl HoverSim {
    pub fn new(params: HoverParams) -> Self {
        let mut sim = Self {
            params,
            position: HOVER_TARGET,
            velocity: [0.0; 3],
            rotation: IDENTITY,
            angular_velocity: [0.0; 3],
            omega: [0.0; ROTORS],
            accel_body: [0.0; 3],
        };
        sim.reset();
        sim
    }

    fn observe(&self) -> Observation {
        Observation {
            position: self.position,
            velocity: self.velocity,
            velocity_body: mat_t_vec(&self.rotation, &self.velocity),
            angular_velocity: self.angular_velocity,
            accelerometer: self.accel_body,
            gyro: self.angular_velocity,
            rotor_speeds: self.omega,
        }
    }

    fn integrate(&mut self, commands: &[f64; ROTORS], dt: f64) {
        let p = &self.params;

        let alpha = (dt / p.rotor_tau).min(1.0);
        for (w, &c) in self.omega.iter_mut().zip(commands) {
            *w += (c - *w) * alpha;
        }

        let thrusts: Vec<f64> = self.omega.iter().map(|w| p.k_f * w * w).collect();
        let total: f64 = thrusts.iter().sum();

        // r × (0, F, 0) = (−r_z F, 0, r_x F) for r in the x-z plane
        let mut torque = [0.0; 3];
        for (i, &(sx, sz, spin)) in ROTOR_LAYOUT.iter().enumerate() {
            torque[0] -= sz * p.arm * thrusts[i];
            torque[2] += sx * p.arm * thrusts[i];
            torque[1] += spin * p.k_m * self.omega[i] * self.omega[i];
        }
        for k in 0..3 {
            self.angular_velocity[k] += torque[k] / p.inertia[k] * dt;
        }

        let thrust_world = mat_vec(&self.rotation, &[0.0, total / p.mass, 0.0]);
        let mut accel = [0.0; 3];
        for k in 0..3 {
            accel[k] = thrust_world[k] - p.linear_drag * self.velocity[k] / p.mass;
        }
        accel[1] -= GRAVITY;

        for k in 0..3 {
            self.velocity[k] += accel[k] * dt;
            self.position[k] += self.velocity[k] * dt;
        }

        // Specific force: everything but gravity, seen from the body
        let mut specific = accel;
        specific[1] += GRAVITY;
        self.accel_body = mat_t_vec(&self.rotation, &specific);

        let [wx, wy, wz] = self.angular_velocity;
        let skew = [[0.0, -wz, wy], [wz, 0.0, -wx], [-wy, wx, 0.0]];
        let dr = mat_mul(&self.rotation, &skew);
        for r in 0..3 {
            for c in 0..3 {
                self.rotation[r][c] += dr[r][c] * dt;
            }
        }
        orthonormalize(&mut self.rotation);
    }
}

impl FlightSim for HoverSim {
    fn reset(&mut self) -> Observation {
        self.position = HOVER_TARGET;
        self.velocity = [0.0; 3];
        self.rotation = IDENTITY;
        self.angular_velocity = [0.0; 3];
        self.omega = [self.params.hover_omega(); ROTORS];
        self.accel_body = [0.0, GRAVITY, 0.0];
        self.observe()
    }

    fn step(&mut self, rotor_commands: &[f64; ROTORS]) -> (Observation, bool) {
        let commands = rotor_commands.map(|c| c.clamp(OMEGA_MIN, OMEGA_MAX));
        let substeps = (DT_CONTROL / DT_PHYSICS).round() as usize;
        for _ in 0..substeps {
            self.integrate(&commands, DT_PHYSICS);
        }
        let obs = self.observe();
        let diverged = obs.diverged();
        (obs, diverged)
    }
}

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn mat_vec(m: &[[f64; 3]; 3], v: &[f64; 3]) -> [f64; 3] {
    [dot(&m[0], v), dot(&m[1], v), dot(&m[2], v)]
}

fn mat_t_vec(m: &[[f64; 3]; 3], v: &[f64; 3]) -> [f64; 3] {
    std::array::from_fn(|c| m[0][c] * v[0] + m[1][c] * v[1] + m[2][c] * v[2])
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    std::array::from_fn(|r| std::array::from_fn(|c| (0..3).map(|k| a[r][k] * b[k][c]).sum()))
}

/// Gram-Schmidt on the columns
fn orthonormalize(m: &mut [[f64; 3]; 3]) {
    let col = |m: &[[f64; 3]; 3], c: usize| [m[0][c], m[1][c], m[2][c]];
    let mut x = col(m, 0);
    let n = norm(&x);
    x = x.map(|v| v / n);

    let mut y = col(m, 1);
    let d = dot(&x, &y);
    y = std::array::from_fn(|k| y[k] - d * x[k]);
    let n = norm(&y);
    y = y.map(|v| v / n);

    let z = [
        x[1] * y[2] - x[2] * y[1],
        x[2] * y[0] - x[0] * y[2],
        x[0] * y[1] - x[1] * y[0],
    ];
    for r in 0..3 {
        m[r] = [x[r], y[r], z[r]];
    }
}
