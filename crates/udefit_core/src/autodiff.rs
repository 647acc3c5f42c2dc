use crate::error::{ensure_dimension, Result, UdeError};
use crate::traits::ParametricSystem;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::cell::RefCell;
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Dual number for forward-mode differentiation.
/// val: real part
/// eps: directional derivative carried alongside
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Applies a unary function given its value and derivative at `self.val`.
    #[inline]
    fn chain(self, value: f64, derivative: f64) -> Self {
        // Constants stay constants even where the derivative is singular.
        if self.eps == 0.0 {
            return Self::constant(value);
        }
        Self::new(value, derivative * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // a % b = a - trunc(a / b) * b away from the jumps.
        let quotient = (self.val / rhs.val).trunc();
        Self::new(self.val % rhs.val, self.eps - quotient * rhs.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> std::result::Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        let val_pow = self.val.powi(n);
        Self::new(val_pow, (n as f64) * self.val.powi(n - 1) * self.eps)
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x)); the ln(x) term only matters when y carries a tangent.
        let val_pow = self.val.powf(n.val);
        let base_term = if self.eps == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0) * self.eps
        };
        let exponent_term = if n.eps == 0.0 {
            0.0
        } else {
            val_pow * self.val.ln() * n.eps
        };
        Self::new(val_pow, base_term + exponent_term)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

// --- Parameter Sensitivity System ---

/// Augments a parametric system with its forward parameter sensitivities.
///
/// The augmented state is `[x (n), S (n × p, row-major)]` with
/// `S[i * p + k] = ∂x_i/∂p_k`, evolving as `dS/dt = J_x S + J_p`.
/// Column `k` of the right-hand side is the directional derivative of `f`
/// along `(x: S[·, k], p: e_k)`, so each evaluation costs one `f64` pass
/// plus one `Dual` pass per parameter. The Jacobians are never formed.
pub struct SensitivitySystem<S> {
    pub inner: S,
    scratch: RefCell<DualScratch>,
}

struct DualScratch {
    x: Vec<Dual>,
    p: Vec<Dual>,
    out: Vec<Dual>,
}

impl<S> SensitivitySystem<S>
where
    S: ParametricSystem<f64> + ParametricSystem<Dual>,
{
    pub fn new(inner: S) -> Self {
        let n = ParametricSystem::<f64>::dimension(&inner);
        let p = ParametricSystem::<f64>::parameter_count(&inner);
        Self {
            inner,
            scratch: RefCell::new(DualScratch {
                x: vec![Dual::zero(); n],
                p: vec![Dual::zero(); p],
                out: vec![Dual::zero(); n],
            }),
        }
    }

    pub fn state_dimension(&self) -> usize {
        ParametricSystem::<f64>::dimension(&self.inner)
    }

    /// Initial augmented state: the initial condition does not depend on the
    /// parameters, so all sensitivities start at zero.
    pub fn initial_state(&self, x0: &[f64]) -> Vec<f64> {
        let n = self.state_dimension();
        let p = ParametricSystem::<f64>::parameter_count(&self.inner);
        let mut augmented = vec![0.0; n + n * p];
        augmented[..n].copy_from_slice(x0);
        augmented
    }
}

impl<S> ParametricSystem<f64> for SensitivitySystem<S>
where
    S: ParametricSystem<f64> + ParametricSystem<Dual>,
{
    fn dimension(&self) -> usize {
        let n = self.state_dimension();
        n + n * ParametricSystem::<f64>::parameter_count(&self.inner)
    }

    fn parameter_count(&self) -> usize {
        ParametricSystem::<f64>::parameter_count(&self.inner)
    }

    fn apply(&self, t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let n = self.state_dimension();
        let np = p.len();

        // Base field through the f64 path so that the primary trajectory is
        // bit-identical to a plain solve.
        self.inner.apply(t, &x[..n], p, &mut out[..n]);

        let mut scratch = self.scratch.borrow_mut();
        let DualScratch {
            x: dual_x,
            p: dual_p,
            out: dual_out,
        } = &mut *scratch;
        let t_dual = Dual::constant(t);

        for k in 0..np {
            for i in 0..n {
                dual_x[i] = Dual::new(x[i], x[n + i * np + k]);
            }
            for (j, value) in p.iter().enumerate() {
                dual_p[j] = Dual::new(*value, if j == k { 1.0 } else { 0.0 });
            }
            self.inner
                .apply(t_dual, &dual_x[..], &dual_p[..], &mut dual_out[..]);
            for i in 0..n {
                out[n + i * np + k] = dual_out[i].eps;
            }
        }
    }
}

/// Jacobian of the vector field with respect to the parameters at a single
/// point, row-major `n × p`. Used for diagnostics and tests.
pub fn parameter_jacobian<S>(system: &S, t: f64, x: &[f64], p: &[f64]) -> Result<Vec<f64>>
where
    S: ParametricSystem<Dual>,
{
    let n = system.dimension();
    let np = system.parameter_count();
    ensure_dimension("state", n, x.len())?;
    ensure_dimension("parameter", np, p.len())?;

    let dual_x: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_p: Vec<Dual> = p.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_out = vec![Dual::zero(); n];
    let mut jacobian = vec![0.0; n * np];

    for k in 0..np {
        dual_p[k].eps = 1.0;
        system.apply(Dual::constant(t), &dual_x, &dual_p, &mut dual_out);
        dual_p[k].eps = 0.0;
        for i in 0..n {
            let deriv = dual_out[i].eps;
            if !deriv.is_finite() {
                return Err(UdeError::Gradient(format!(
                    "non-finite derivative of component {i} with respect to parameter {k}"
                )));
            }
            jacobian[i * np + k] = deriv;
        }
    }

    Ok(jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Scalar;

    struct Decay;

    impl<T: Scalar> ParametricSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }
        fn parameter_count(&self) -> usize {
            1
        }
        fn apply(&self, _t: T, x: &[T], p: &[T], out: &mut [T]) {
            out[0] = -p[0] * x[0];
        }
    }

    #[test]
    fn dual_arithmetic_propagates_derivatives() {
        let x = Dual::new(2.0, 1.0);
        let y = x * x + x.sin();
        assert!((y.val - (4.0 + 2.0_f64.sin())).abs() < 1e-15);
        assert!((y.eps - (4.0 + 2.0_f64.cos())).abs() < 1e-15);

        let q = Dual::constant(1.0) / x;
        assert!((q.eps + 0.25).abs() < 1e-15);
    }

    #[test]
    fn dual_tanh_and_exp_match_closed_forms() {
        let x = Dual::new(0.3, 1.0);
        let t = x.tanh();
        assert!((t.eps - (1.0 - 0.3_f64.tanh().powi(2))).abs() < 1e-15);
        let e = (-(x * x)).exp();
        assert!((e.eps - (-0.6 * (-0.09_f64).exp())).abs() < 1e-15);
    }

    #[test]
    fn dual_powf_with_constant_exponent_handles_zero_base() {
        let x = Dual::new(0.0, 1.0);
        let y = x.powf(Dual::constant(2.0));
        assert_eq!(y.val, 0.0);
        assert_eq!(y.eps, 0.0);
        assert!(y.eps.is_finite());
    }

    #[test]
    fn sensitivity_system_matches_analytic_derivative() {
        let system = SensitivitySystem::new(Decay);
        assert_eq!(ParametricSystem::<f64>::dimension(&system), 2);

        // x = 2, S = 0.5, p = 3 -> dS/dt = -p * S - x
        let mut out = vec![0.0; 2];
        system.apply(0.0, &[2.0, 0.5], &[3.0], &mut out);
        assert_eq!(out[0], -6.0);
        assert!((out[1] - (-3.0 * 0.5 - 2.0)).abs() < 1e-15);
    }

    #[test]
    fn sensitivity_initial_state_zeroes_sensitivities() {
        let system = SensitivitySystem::new(Decay);
        assert_eq!(system.initial_state(&[1.5]), vec![1.5, 0.0]);
    }

    #[test]
    fn parameter_jacobian_rejects_wrong_lengths() {
        let err = parameter_jacobian(&Decay, 0.0, &[1.0], &[1.0, 2.0])
            .expect_err("expected mismatch");
        assert!(format!("{err}").contains("parameter dimension mismatch"));

        let jac = parameter_jacobian(&Decay, 0.0, &[4.0], &[1.0]).expect("jacobian");
        assert_eq!(jac, vec![-4.0]);
    }
}
