//! Ground truth oracle for the validation harness.
//!
//! The Oracle owns the only source of randomness in a run:
//! - True vertex positions (beam spot or displaced decays)
//! - True particle momenta and charges
//! - Standard-normal draws used to smear measured parameters
//!
//! Everything derives from one 64-bit seed, so a failing event can be
//! replayed exactly.

use nalgebra::{Vector3, Vector5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use trackcov_core::trackcov_helix::{
    params_from_position_momentum, params_from_position_momentum_neutral,
};
use trackcov_core::HelixParameters;

/// Charged pion mass (GeV)
pub const PION_MASS: f64 = 0.13957039;

/// Neutral kaon mass (GeV)
pub const KAON_MASS: f64 = 0.497611;

/// A particle as it left its production vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthParticle {
    /// Production point (m)
    pub origin: Vector3<f64>,

    /// Momentum at the production point (GeV)
    pub momentum: Vector3<f64>,

    /// Charge in units of e; zero for neutrals
    pub charge: f64,

    /// Mass hypothesis (GeV)
    pub mass: f64,
}

impl TruthParticle {
    pub fn is_charged(&self) -> bool {
        self.charge != 0.0
    }

    pub fn pt(&self) -> f64 {
        self.momentum.x.hypot(self.momentum.y)
    }

    /// Polar angle in degrees.
    pub fn polar_angle_deg(&self) -> f64 {
        self.pt().atan2(self.momentum.z).to_degrees()
    }

    /// True helix (or line) parameters in a field `bz`.
    pub fn parameters(&self, bz: f64) -> HelixParameters {
        if self.is_charged() {
            params_from_position_momentum(&self.origin, &self.momentum, self.charge, bz)
        } else {
            params_from_position_momentum_neutral(&self.origin, &self.momentum)
        }
    }
}

/// Kinematic ranges for generated particles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kinematics {
    /// Transverse momentum range (GeV), sampled log-uniformly
    pub pt_range: (f64, f64),

    /// Polar angle range (degrees), sampled uniformly in cos θ
    pub theta_range_deg: (f64, f64),
}

impl Default for Kinematics {
    fn default() -> Self {
        Self {
            pt_range: (0.5, 20.0),
            theta_range_deg: (20.0, 160.0),
        }
    }
}

/// The Oracle - seeded truth generator.
pub struct Oracle {
    seed: u64,
    rng: ChaCha8Rng,
}

impl Oracle {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// One standard-normal draw.
    pub fn normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// Five independent standard-normal draws for parameter smearing.
    pub fn normals5(&mut self) -> Vector5<f64> {
        Vector5::from_fn(|_, _| self.normal())
    }

    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi > lo {
            self.rng.gen_range(lo..hi)
        } else {
            lo
        }
    }

    /// Random sign, ±1.
    pub fn charge(&mut self) -> f64 {
        if self.rng.gen_bool(0.5) {
            1.0
        } else {
            -1.0
        }
    }

    /// Vertex drawn from an axis-aligned Gaussian beam spot.
    pub fn beam_spot_vertex(&mut self, sigma: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            sigma.x * self.normal(),
            sigma.y * self.normal(),
            sigma.z * self.normal(),
        )
    }

    /// Unit vector isotropic in φ and uniform in cos θ over the range.
    pub fn direction(&mut self, theta_range_deg: (f64, f64)) -> Vector3<f64> {
        let c_hi = theta_range_deg.0.to_radians().cos();
        let c_lo = theta_range_deg.1.to_radians().cos();
        let cos_theta = self.uniform(c_lo, c_hi);
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = self.uniform(-std::f64::consts::PI, std::f64::consts::PI);
        Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
    }

    /// Momentum with log-uniform pt and the given angular range.
    pub fn momentum(&mut self, kin: &Kinematics) -> Vector3<f64> {
        let (lo, hi) = kin.pt_range;
        let pt = self.uniform(lo.ln(), hi.ln()).exp();
        let dir = self.direction(kin.theta_range_deg);
        let sin_theta = dir.x.hypot(dir.y);
        dir * (pt / sin_theta)
    }

    /// A charged pion from `origin`.
    pub fn charged_particle(&mut self, origin: &Vector3<f64>, kin: &Kinematics) -> TruthParticle {
        let momentum = self.momentum(kin);
        let charge = self.charge();
        TruthParticle {
            origin: *origin,
            momentum,
            charge,
            mass: PION_MASS,
        }
    }

    /// A neutral particle from `origin`.
    pub fn neutral_particle(&mut self, origin: &Vector3<f64>, kin: &Kinematics) -> TruthParticle {
        TruthParticle {
            origin: *origin,
            momentum: self.momentum(kin),
            charge: 0.0,
            mass: KAON_MASS,
        }
    }

    /// Two-body decay of a parent of mass `parent_mass` and momentum
    /// `parent_momentum` at `origin` into a `+`/`-` pair of `daughter_mass`.
    ///
    /// Isotropic in the rest frame.
    pub fn two_body_decay(
        &mut self,
        origin: &Vector3<f64>,
        parent_momentum: &Vector3<f64>,
        parent_mass: f64,
        daughter_mass: f64,
    ) -> [TruthParticle; 2] {
        let m2 = parent_mass * parent_mass;
        let q = (m2 - 4.0 * daughter_mass * daughter_mass).max(0.0).sqrt() / 2.0;
        let e_star = (q * q + daughter_mass * daughter_mass).sqrt();
        let dir = self.direction((0.0, 180.0));

        let energy = (parent_momentum.norm_squared() + m2).sqrt();
        let beta = parent_momentum / energy;
        let plus = boost(&(dir * q), e_star, &beta);
        let minus = boost(&(-dir * q), e_star, &beta);

        [
            TruthParticle {
                origin: *origin,
                momentum: plus,
                charge: 1.0,
                mass: daughter_mass,
            },
            TruthParticle {
                origin: *origin,
                momentum: minus,
                charge: -1.0,
                mass: daughter_mass,
            },
        ]
    }
}

/// Lorentz boost of a rest-frame momentum into the frame moving with `beta`.
pub fn boost(p_star: &Vector3<f64>, e_star: f64, beta: &Vector3<f64>) -> Vector3<f64> {
    let b2 = beta.norm_squared();
    if b2 <= 0.0 {
        return *p_star;
    }
    let gamma = 1.0 / (1.0 - b2).sqrt();
    let along = p_star.dot(beta) / b2;
    p_star + beta * ((gamma - 1.0) * along + gamma * e_star)
}

// ============================================================================
// TESTS
// ============================================================================
