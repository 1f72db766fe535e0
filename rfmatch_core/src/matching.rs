//! Closed-form impedance matching solver.
//!
//! The L-network is fixed: input stage (Lp, Cp), VVC0 shunt branch
//! (LB0, RB0, CB0), intermediate C network (RC0, LC0, CC0, CC1), VVC1
//! series branch (CD0) and output stage (RE0, LE0), all at 13.56 MHz.
//! Every product of circuit constants and powers of the angular
//! frequency is materialised once at construction; runtime only sees the
//! measured impedance and the two current capacitances.
//!
//! The inverse solve produces two candidate (VVC0*, VVC1*) pairs that
//! transform the input to 50 Ω. Solutions are valid only when both target
//! capacitances are positive; the caller additionally checks them against
//! each capacitor's travel band.

use crate::motor::MotorController;
use rfmatch_traits::MotorFabric;

const PF: f64 = 1.0e-12;
const NH: f64 = 1.0e-9;
const UH: f64 = 1.0e-6;

/// Operating frequency, Hz.
pub const FREQ_HZ: f64 = 13.56e6;
/// Match target, ohms.
pub const Z_TARGET: f64 = 50.0;

// Network constants (SI units).
const LP: f64 = 36.0 * NH;
const CP: f64 = 15.3 * PF;
const LB0: f64 = 157.0 * NH;
const RB0: f64 = 0.2;
const CB0: f64 = 1.9 * PF;
const RC0: f64 = 0.2;
const LC0: f64 = 1.03 * UH;
const CC0: f64 = 2.0 * PF;
const CC1: f64 = 1.5 * PF;
const CD0: f64 = 31.0 * PF;
const RE0: f64 = 0.2;
const LE0: f64 = 15.0 * NH;

/// VSWR of a load (R, X) against `Z_TARGET`, capped at 999 when the
/// reflection coefficient is numerically unsafe.
pub fn vswr(r: f64, x: f64) -> f64 {
    let z0 = Z_TARGET;
    let denom = (r + z0) * (r + z0) + x * x;
    if denom < 1e-12 {
        return 999.0;
    }
    let numer = (r - z0) * (r - z0) + x * x;
    let gamma = (numer / denom).sqrt();
    if gamma >= 1.0 {
        return 999.0;
    }
    (1.0 + gamma) / (1.0 - gamma)
}

/// Impedance at each point of the network, input to plasma.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImpedancePoints {
    pub ra: f64,
    pub xa: f64,
    pub rb: f64,
    pub xb: f64,
    pub rc: f64,
    pub xc: f64,
    pub rd: f64,
    pub xd: f64,
    pub re: f64,
    pub xe: f64,
    pub rp: f64,
    pub xp: f64,
}

/// One candidate solution of the inverse solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingSolution {
    /// Target VVC0 capacitance, pF.
    pub vvc0_pf: f64,
    /// Target VVC1 capacitance, pF.
    pub vvc1_pf: f64,
    pub step0: i32,
    pub step1: i32,
    pub valid: bool,
}

/// Both candidate solutions plus the intermediate quantities the `amg`
/// diagnostics report.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingGoals {
    pub solutions: [MatchingSolution; 2],
    pub ra_goal: f64,
    pub xa_goal: f64,
    pub xb_goals: [f64; 2],
    pub xd_goals: [f64; 2],
    /// RC/XC/XD actually used (input-derived or output-sensor-derived).
    pub rc_used: f64,
    pub xc_used: f64,
    pub xd_used: f64,
}

/// The solver with its precomputed coefficient set.
pub struct MatchingAlgorithm {
    w: f64,

    // ZA (input -> A): one shared denominator in {1, Rm^2, Xm, Xm^2}.
    denom_a_const: f64,
    denom_a_rm2: f64,
    denom_a_xm: f64,
    denom_a_xm2: f64,
    xa_const: f64,
    xa_rm2: f64,
    xa_xm: f64,
    xa_xm2: f64,

    // ZB (VVC0 branch): RB is constant, XB rational in VVC0.
    rb_const: f64,
    xb_numer_const: f64,
    xb_numer_vvc0: f64,
    xb_denom_factor: f64,

    // ZD (C -> D): shared denominator polynomial in RC, XC.
    d_const: f64,
    d_rc2: f64,
    d_rc: f64,
    d_xc: f64,
    d_xc2: f64,
    rd_const: f64,
    rd_rc: f64,
    xd_const: f64,
    xd_rc2: f64,
    xd_rc: f64,
    xd_xc: f64,
    xd_xc2: f64,

    // ZE (D -> E): CD0 products.
    e_cd0: f64,
    e_cd02: f64,
    e_2cd0: f64,
    e_cd0_w: f64,
    e_2cd0_w: f64,
    e_2cd02_w: f64,
    e_cd02_w2: f64,

    // Output stage.
    re0: f64,
    le0_w: f64,

    // 50 ohm target transformed backwards through Lp, Cp.
    ra_goal: f64,
    xa_goal: f64,

    // Discriminant coefficients of the inverse solve, polynomial in RC.
    disc_const: f64,
    disc_rc: f64,
    disc_rc2: f64,
}

impl Default for MatchingAlgorithm {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchingAlgorithm {
    pub fn new() -> Self {
        let w = 2.0 * std::f64::consts::PI * FREQ_HZ;
        let w2 = w * w;
        let w3 = w2 * w;
        let w4 = w2 * w2;
        let w5 = w4 * w;
        let w6 = w3 * w3;

        // ZA coefficients.
        let lp2 = LP * LP;
        let cp2 = CP * CP;
        let cp2_w2 = cp2 * w2;

        let denom_a_const = 1.0 - 2.0 * CP * LP * w2 + cp2 * lp2 * w4;
        let denom_a_rm2 = cp2_w2;
        let denom_a_xm = 2.0 * CP * w - 2.0 * cp2 * LP * w3;
        let denom_a_xm2 = cp2_w2;

        let xa_const = -LP * w + CP * lp2 * w3;
        let xa_rm2 = CP * w;
        let xa_xm = 1.0 - 2.0 * CP * LP * w2;
        let xa_xm2 = CP * w;

        // ZB coefficients. RB collapses to a constant.
        let lb02 = LB0 * LB0;
        let cb02 = CB0 * CB0;
        let rb02 = RB0 * RB0;
        let cb02_w2_rb02_lb02w2 = cb02 * w2 * (rb02 + lb02 * w2);
        let denom_b_const = 1.0 - 2.0 * CB0 * LB0 * w2 + cb02_w2_rb02_lb02w2;

        let rb_const = RB0 / denom_b_const;
        let xb_numer_const = 1.0 + cb02_w2_rb02_lb02w2 - 2.0 * CB0 * LB0 * w2;
        let xb_numer_vvc0 = -LB0 * w2 + CB0 * rb02 * w2 + CB0 * lb02 * w4;
        let xb_denom_factor = w * denom_b_const;

        // ZD coefficients, grouped by powers of RC and XC.
        let lc02 = LC0 * LC0;
        let cc02 = CC0 * CC0;
        let cc12 = CC1 * CC1;
        let rc02 = RC0 * RC0;

        let d_const = 1.0 - 2.0 * CC0 * LC0 * w2 - 2.0 * CC1 * LC0 * w2
            + cc02 * rc02 * w2
            + 2.0 * CC0 * CC1 * rc02 * w2
            + cc12 * rc02 * w2
            + cc02 * lc02 * w4
            + 2.0 * CC0 * CC1 * lc02 * w4
            + cc12 * lc02 * w4;
        let d_rc2 =
            cc12 * w2 - 2.0 * CC0 * cc12 * LC0 * w4 + cc02 * cc12 * rc02 * w4 + cc02 * cc12 * lc02 * w6;
        let d_rc = -2.0 * cc12 * RC0 * w2;
        let d_xc = 2.0 * CC1 * w - 4.0 * CC0 * CC1 * LC0 * w3 - 2.0 * cc12 * LC0 * w3
            + 2.0 * cc02 * CC1 * rc02 * w3
            + 2.0 * CC0 * cc12 * rc02 * w3
            + 2.0 * cc02 * CC1 * lc02 * w5
            + 2.0 * CC0 * cc12 * lc02 * w5;
        let d_xc2 =
            cc12 * w2 - 2.0 * CC0 * cc12 * LC0 * w4 + cc02 * cc12 * rc02 * w4 + cc02 * cc12 * lc02 * w6;

        let rd_const = -RC0;
        let rd_rc = 1.0 - 2.0 * CC0 * LC0 * w2 + cc02 * rc02 * w2 + cc02 * lc02 * w4;

        let xd_const =
            -LC0 * w + CC0 * rc02 * w + CC1 * rc02 * w + CC0 * lc02 * w3 + CC1 * lc02 * w3;
        let xd_rc2 =
            CC1 * w - 2.0 * CC0 * CC1 * LC0 * w3 + cc02 * CC1 * rc02 * w3 + cc02 * CC1 * lc02 * w5;
        let xd_rc = -2.0 * CC1 * RC0 * w;
        let xd_xc = 1.0 - 2.0 * CC0 * LC0 * w2 - 2.0 * CC1 * LC0 * w2
            + cc02 * rc02 * w2
            + 2.0 * CC0 * CC1 * rc02 * w2
            + cc02 * lc02 * w4
            + 2.0 * CC0 * CC1 * lc02 * w4;
        let xd_xc2 =
            CC1 * w - 2.0 * CC0 * CC1 * LC0 * w3 + cc02 * CC1 * rc02 * w3 + cc02 * CC1 * lc02 * w5;

        // 50 ohm target pulled backwards through the input stage.
        let z2 = Z_TARGET * Z_TARGET;
        let denom_goal = 1.0 + z2 * cp2 * w2 - 2.0 * CP * LP * w2 + cp2 * lp2 * w4;
        let ra_goal = Z_TARGET / denom_goal;
        let xa_goal = w * (z2 * CP - LP + CP * lp2 * w2) / denom_goal;
        let ra_goal2 = ra_goal * ra_goal;
        let xa_goal2 = xa_goal * xa_goal;
        let rb2 = rb_const * rb_const;
        let ra_goal3 = ra_goal * ra_goal2;

        // Discriminant of the quadratic in XB*, factored over RC.
        let disc_const = ra_goal3 * rb_const - ra_goal2 * rb2 + ra_goal * rb_const * xa_goal2;
        let disc_rc = ra_goal3 - 3.0 * ra_goal2 * rb_const + 2.0 * ra_goal * rb2
            + ra_goal * xa_goal2
            - rb_const * xa_goal2;
        let disc_rc2 = -ra_goal2 + 2.0 * ra_goal * rb_const - rb2;

        Self {
            w,
            denom_a_const,
            denom_a_rm2,
            denom_a_xm,
            denom_a_xm2,
            xa_const,
            xa_rm2,
            xa_xm,
            xa_xm2,
            rb_const,
            xb_numer_const,
            xb_numer_vvc0,
            xb_denom_factor,
            d_const,
            d_rc2,
            d_rc,
            d_xc,
            d_xc2,
            rd_const,
            rd_rc,
            xd_const,
            xd_rc2,
            xd_rc,
            xd_xc,
            xd_xc2,
            e_cd0: CD0,
            e_cd02: CD0 * CD0,
            e_2cd0: 2.0 * CD0,
            e_cd0_w: CD0 * w,
            e_2cd0_w: 2.0 * CD0 * w,
            e_2cd02_w: 2.0 * CD0 * CD0 * w,
            e_cd02_w2: CD0 * CD0 * w2,
            re0: RE0,
            le0_w: LE0 * w,
            ra_goal,
            xa_goal,
            disc_const,
            disc_rc,
            disc_rc2,
        }
    }

    /// The 50 ohm target transformed to point A.
    pub fn ra_goal(&self) -> (f64, f64) {
        (self.ra_goal, self.xa_goal)
    }

    /// Point A from the measured input impedance:
    /// `ZA = (Zm - jwLp) / (1 + jwCp(Zm - jwLp))` in Mobius form.
    pub fn z_a(&self, rm: f64, xm: f64) -> (f64, f64) {
        let rm2 = rm * rm;
        let xm2 = xm * xm;
        let denom =
            self.denom_a_const + self.denom_a_rm2 * rm2 + self.denom_a_xm * xm + self.denom_a_xm2 * xm2;
        let ra = rm / denom;
        let xa = (self.xa_const + self.xa_rm2 * rm2 + self.xa_xm * xm + self.xa_xm2 * xm2) / denom;
        (ra, xa)
    }

    /// Point B from the VVC0 capacitance (pF). RB is constant.
    pub fn z_b(&self, vvc0_pf: f64) -> (f64, f64) {
        let vvc0 = vvc0_pf * PF;
        let numer = -(self.xb_numer_const + self.xb_numer_vvc0 * vvc0);
        let xb = numer / (vvc0 * self.xb_denom_factor);
        (self.rb_const, xb)
    }

    /// Point C: the downstream impedance recovered from `ZA = ZB || ZC`.
    pub fn z_c(&self, ra: f64, xa: f64, rb: f64, xb: f64) -> (f64, f64) {
        let ra2 = ra * ra;
        let rb2 = rb * rb;
        let xa2 = xa * xa;
        let xb2 = xb * xb;
        let denom = ra2 - 2.0 * ra * rb + rb2 + xa2 - 2.0 * xa * xb + xb2;
        if denom.abs() < 1e-12 {
            return (ra, xa);
        }
        let rc = (-ra2 * rb + ra * rb2 - rb * xa2 + ra * xb2) / denom;
        let xc = (rb2 * xa - ra2 * xb - xa2 * xb + xa * xb2) / denom;
        (rc, xc)
    }

    /// Point D from point C via the precomputed rational transform.
    pub fn z_d(&self, rc: f64, xc: f64) -> (f64, f64) {
        let rc2 = rc * rc;
        let xc2 = xc * xc;
        let denom =
            self.d_const + self.d_rc2 * rc2 + self.d_rc * rc + self.d_xc * xc + self.d_xc2 * xc2;
        if denom.abs() < 1e-20 {
            return (rc, xc);
        }
        let rd = (self.rd_const + self.rd_rc * rc) / denom;
        let xd = (self.xd_const + self.xd_rc2 * rc2 + self.xd_rc * rc + self.xd_xc * xc
            + self.xd_xc2 * xc2)
            / denom;
        (rd, xd)
    }

    /// Point E: `(ZD || 1/(jwCD0))` in series with `1/(jwVVC1)`.
    pub fn z_e(&self, rd: f64, xd: f64, vvc1_pf: f64) -> (f64, f64) {
        let vvc1 = vvc1_pf * PF;
        let vvc12 = vvc1 * vvc1;
        let rd2 = rd * rd;
        let xd2 = xd * xd;

        let denom = self.e_cd02 + self.e_2cd0 * vvc1 + vvc12
            + self.e_cd02_w2 * rd2 * vvc12
            + self.e_2cd02_w * vvc1 * xd
            + self.e_2cd0_w * vvc12 * xd
            + self.e_cd02_w2 * vvc12 * xd2;
        if denom.abs() < 1e-30 {
            return (rd, xd);
        }

        let re = rd * vvc12 / denom;
        let xe_numer = self.e_cd0 + vvc1
            + self.e_cd0_w * self.w * rd2 * vvc12
            + self.e_2cd0_w * vvc1 * xd
            + vvc12 * self.w * xd
            + self.e_cd0_w * self.w * vvc12 * xd2;
        (re, xe_numer / (self.w * denom))
    }

    /// Plasma impedance: strip the output stage from point E.
    pub fn z_p(&self, re: f64, xe: f64) -> (f64, f64) {
        (re - self.re0, xe - self.le0_w)
    }

    /// Full forward chain for diagnostics.
    pub fn impedance_points(&self, rm: f64, xm: f64, vvc0_pf: f64, vvc1_pf: f64) -> ImpedancePoints {
        let (ra, xa) = self.z_a(rm, xm);
        let (rb, xb) = self.z_b(vvc0_pf);
        let (rc, xc) = self.z_c(ra, xa, rb, xb);
        let (rd, xd) = self.z_d(rc, xc);
        let (re, xe) = self.z_e(rd, xd, vvc1_pf);
        let (rp, xp) = self.z_p(re, xe);
        ImpedancePoints {
            ra,
            xa,
            rb,
            xb,
            rc,
            xc,
            rd,
            xd,
            re,
            xe,
            rp,
            xp,
        }
    }

    /// Recover ZC from the output sensor by walking the network backwards:
    /// `ZE = Zpm + (RE0 + jwLE0)`, parallel `1/(jwCD0)`, series
    /// `1/(jwVVC1)`, parallel `1/(jwCC1)`, plus `(RC0 + jwLC0) || 1/(jwCC0)`.
    /// Used above VSWR 2 where the reflected ZA estimate drowns in noise.
    pub fn zc_from_output(&self, rpm: f64, xpm: f64, vvc1_pf: f64) -> (f64, f64) {
        let w = self.w;
        let vvc1 = vvc1_pf * PF;

        let ze_r = rpm + self.re0;
        let ze_x = xpm + self.le0_w;

        // ZE || 1/(jwCD0)
        let x_cd0 = -1.0 / (w * CD0);
        let num_r = -ze_x * x_cd0;
        let num_x = ze_r * x_cd0;
        let den_r = ze_r;
        let den_x = ze_x + x_cd0;
        let den_mag2 = den_r * den_r + den_x * den_x;
        if den_mag2 < 1e-30 {
            return (rpm, xpm);
        }
        let zecd_r = (num_r * den_r + num_x * den_x) / den_mag2;
        let zecd_x = (num_x * den_r - num_r * den_x) / den_mag2;

        // + 1/(jwVVC1) in series
        let zd_r = zecd_r;
        let zd_x = zecd_x - 1.0 / (w * vvc1);

        // ZD || 1/(jwCC1)
        let x_cc1 = -1.0 / (w * CC1);
        let num2_r = -zd_x * x_cc1;
        let num2_x = zd_r * x_cc1;
        let den2_r = zd_r;
        let den2_x = zd_x + x_cc1;
        let den2_mag2 = den2_r * den2_r + den2_x * den2_x;
        if den2_mag2 < 1e-30 {
            return (rpm, xpm);
        }
        let zdcc_r = (num2_r * den2_r + num2_x * den2_x) / den2_mag2;
        let zdcc_x = (num2_x * den2_r - num2_r * den2_x) / den2_mag2;

        // (RC0 + jwLC0) || 1/(jwCC0)
        let zlc_r = RC0;
        let zlc_x = w * LC0;
        let x_cc0 = -1.0 / (w * CC0);
        let num3_r = -zlc_x * x_cc0;
        let num3_x = zlc_r * x_cc0;
        let den3_r = zlc_r;
        let den3_x = zlc_x + x_cc0;
        let den3_mag2 = den3_r * den3_r + den3_x * den3_x;
        if den3_mag2 < 1e-30 {
            return (rpm, xpm);
        }
        let zc0_r = (num3_r * den3_r + num3_x * den3_x) / den3_mag2;
        let zc0_x = (num3_x * den3_r - num3_r * den3_x) / den3_mag2;

        (zdcc_r + zc0_r, zdcc_x + zc0_x)
    }

    fn xd_from_xc(&self, rc: f64, rc2: f64, xc: f64) -> f64 {
        let xc2 = xc * xc;
        let denom =
            self.d_const + self.d_rc2 * rc2 + self.d_rc * rc + self.d_xc * xc + self.d_xc2 * xc2;
        if denom.abs() < 1e-20 {
            return xc;
        }
        (self.xd_const + self.xd_rc2 * rc2 + self.xd_rc * rc + self.xd_xc * xc + self.xd_xc2 * xc2)
            / denom
    }

    /// The inverse solve: two candidate capacitor pairs restoring 50 ohms
    /// at the input, plus their step targets from each motor's inverse
    /// map. `output` carries the output sensor's (R, X) when the caller
    /// wants the ZC walk-back instead of the reflected estimate.
    pub fn matching_goals<F0: MotorFabric, F1: MotorFabric>(
        &self,
        rm: f64,
        xm: f64,
        vvc0_pf: f64,
        vvc1_pf: f64,
        output: Option<(f64, f64)>,
        m0: &MotorController<F0>,
        m1: &MotorController<F1>,
    ) -> MatchingGoals {
        let mut goals = MatchingGoals {
            ra_goal: self.ra_goal,
            xa_goal: self.xa_goal,
            ..MatchingGoals::default()
        };

        let pts = self.impedance_points(rm, xm, vvc0_pf, vvc1_pf);
        let (mut rc, mut xc, mut xd) = (pts.rc, pts.xc, pts.xd);

        if let Some((rpm, xpm)) = output
            && (rpm != 0.0 || xpm != 0.0)
        {
            let (rc_out, xc_out) = self.zc_from_output(rpm, xpm, vvc1_pf);
            rc = rc_out;
            xc = xc_out;
            let (_, xd_out) = self.z_d(rc, xc);
            xd = xd_out;
        }
        let xb = pts.xb;
        let rc2 = rc * rc;

        goals.rc_used = rc;
        goals.xc_used = xc;
        goals.xd_used = xd;

        // Degenerate branch points make the quadratic collapse; both
        // solutions are invalid rather than dividing toward infinity.
        let denom_xb = 2.0 * (self.ra_goal - rc);
        let denom_xc = self.ra_goal - self.rb_const;
        if denom_xb.abs() < 1e-12 || denom_xc.abs() < 1e-12 {
            return goals;
        }

        let discriminant = 4.0 * (self.disc_const + self.disc_rc * rc + self.disc_rc2 * rc2);
        if discriminant < 0.0 {
            return goals;
        }
        let sqrt_d = discriminant.sqrt();

        goals.xb_goals[0] = (-2.0 * rc * self.xa_goal - sqrt_d) / denom_xb;
        goals.xb_goals[1] = (-2.0 * rc * self.xa_goal + sqrt_d) / denom_xb;

        let vvc0 = vvc0_pf * PF;
        let vvc1 = vvc1_pf * PF;

        for (i, sol) in goals.solutions.iter_mut().enumerate() {
            let denom_vvc0 = 1.0 + vvc0 * self.w * xb - vvc0 * self.w * goals.xb_goals[i];
            if denom_vvc0.abs() > 1e-20 {
                sol.vvc0_pf = (vvc0 / denom_vvc0) / PF;
                sol.valid = sol.vvc0_pf > 0.0;
            }
        }

        // XC* shares the discriminant: sqrt(disc/4) = sqrt(disc)/2.
        let half_sqrt_d = sqrt_d / 2.0;
        let xc_goal0 = (-self.rb_const * self.xa_goal + half_sqrt_d) / denom_xc;
        let xc_goal1 = (-self.rb_const * self.xa_goal - half_sqrt_d) / denom_xc;

        goals.xd_goals[0] = self.xd_from_xc(rc, rc2, xc_goal0);
        goals.xd_goals[1] = self.xd_from_xc(rc, rc2, xc_goal1);

        for (i, sol) in goals.solutions.iter_mut().enumerate() {
            let denom_vvc1 = 1.0 + vvc1 * self.w * xd - vvc1 * self.w * goals.xd_goals[i];
            if denom_vvc1.abs() > 1e-20 {
                sol.vvc1_pf = (vvc1 / denom_vvc1) / PF;
                if sol.vvc1_pf < 0.0 {
                    sol.valid = false;
                }
            } else {
                sol.valid = false;
            }
        }

        for sol in &mut goals.solutions {
            if !sol.vvc0_pf.is_finite() || !sol.vvc1_pf.is_finite() {
                sol.valid = false;
                continue;
            }
            sol.step0 = m0.step_of_cap((sol.vvc0_pf * 100.0) as i32);
            sol.step1 = m1.step_of_cap((sol.vvc1_pf * 100.0) as i32);
        }

        goals
    }
}
