//! The logicle display scale (Parks, Roederer & Moore, Cytometry A 2006).
//!
//! A biexponential `B(x) = a·e^(b·x) − c·e^(−d·x) + f` that is linear near
//! zero and logarithmic for large values. `scale` maps data values to the
//! unit display interval by inverting `B`; `inverse` evaluates `B` itself.

use crate::error::OpError;
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_10;

const TAYLOR_LENGTH: usize = 16;

/// User-facing parameters: top of scale `T`, linearization width `W`,
/// decades `M` and additional negative decades `A`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicleParams {
    pub t: f64,
    pub w: f64,
    pub m: f64,
    pub a: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Logicle {
    params: LogicleParams,
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    f: f64,
    x1: f64,
    x_taylor: f64,
    taylor: [f64; TAYLOR_LENGTH],
}

impl Logicle {
    pub fn new(params: LogicleParams) -> Result<Self, OpError> {
        let LogicleParams { t, w, m, a } = params;
        if !(t > 0.0) {
            return Err(OpError::invalid(format!("Logicle T must be positive, got {t}")));
        }
        if !(w >= 0.0) {
            return Err(OpError::invalid(format!("Logicle W must not be negative, got {w}")));
        }
        if !(m > 0.0) {
            return Err(OpError::invalid(format!("Logicle M must be positive, got {m}")));
        }
        if 2.0 * w > m {
            return Err(OpError::invalid(format!("Logicle W={w} is too large for M={m}")));
        }
        if -a > w || a + 2.0 * w > m {
            return Err(OpError::invalid(format!("Logicle A={a} is out of range")));
        }

        let w_frac = w / (m + a);
        let x2 = a / (m + a);
        let x1 = x2 + w_frac;
        let x0 = x2 + 2.0 * w_frac;
        let b = (m + a) * LN_10;
        let d = solve(b, w_frac)?;
        let c_a = (x0 * (b + d)).exp();
        let mf_a = (b * x1).exp() - c_a / (d * x1).exp();
        let coef_a = t / ((b.exp() - mf_a) - c_a / d.exp());
        let c = c_a * coef_a;
        let f = -mf_a * coef_a;

        // Taylor series around x1, used near data zero to avoid round-off.
        let mut taylor = [0.0; TAYLOR_LENGTH];
        let mut pos = coef_a * (b * x1).exp();
        let mut neg = -c / (d * x1).exp();
        for (i, term) in taylor.iter_mut().enumerate() {
            pos *= b / (i + 1) as f64;
            neg *= -d / (i + 1) as f64;
            *term = pos + neg;
        }
        // exactly zero by the logicle condition
        taylor[1] = 0.0;

        Ok(Self {
            params,
            a: coef_a,
            b,
            c,
            d,
            f,
            x1,
            x_taylor: x1 + w_frac / 4.0,
            taylor,
        })
    }

    pub fn params(&self) -> LogicleParams {
        self.params
    }

    fn series_biexponential(&self, scale: f64) -> f64 {
        let x = scale - self.x1;
        let mut sum = self.taylor[TAYLOR_LENGTH - 1] * x;
        for i in (2..TAYLOR_LENGTH - 1).rev() {
            sum = (sum + self.taylor[i]) * x;
        }
        (sum * x + self.taylor[0]) * x
    }

    /// Data value to display scale; `T` maps to 1 and zero maps to `x1`.
    pub fn scale(&self, value: f64) -> Result<f64, OpError> {
        if value == 0.0 {
            return Ok(self.x1);
        }
        if !value.is_finite() {
            return Err(OpError::invalid(format!("Cannot logicle-scale {value}")));
        }
        let negative = value < 0.0;
        let value = value.abs();

        let mut x = if value < self.f {
            self.x1 + value / self.taylor[0]
        } else {
            (value / self.a).ln() / self.b
        };
        let tolerance = if x > 1.0 {
            3.0 * x * f64::EPSILON
        } else {
            3.0 * f64::EPSILON
        };

        for _ in 0..10 {
            let ae2bx = self.a * (self.b * x).exp();
            let ce2mdx = self.c / (self.d * x).exp();
            let y = if x < self.x_taylor {
                self.series_biexponential(x) - value
            } else {
                (ae2bx + self.f) - (ce2mdx + value)
            };
            let abe2bx = self.b * ae2bx;
            let cde2mdx = self.d * ce2mdx;
            let dy = abe2bx + cde2mdx;
            let ddy = self.b * abe2bx - self.d * cde2mdx;
            // Halley's method
            let delta = y / (dy * (1.0 - y * ddy / (2.0 * dy * dy)));
            x -= delta;
            if delta.abs() < tolerance {
                return Ok(if negative { 2.0 * self.x1 - x } else { x });
            }
        }
        Err(OpError::internal(format!(
            "Logicle scale did not converge for value {value}"
        )))
    }

    /// Display scale back to data value.
    pub fn inverse(&self, scale: f64) -> f64 {
        let negative = scale < self.x1;
        let scale = if negative { 2.0 * self.x1 - scale } else { scale };
        let value = if scale < self.x_taylor {
            self.series_biexponential(scale)
        } else {
            (self.a * (self.b * scale).exp() + self.f) - self.c / (self.d * scale).exp()
        };
        if negative { -value } else { value }
    }
}

/// Root of `2·(ln d − ln b) + w·(b + d) = 0` by safeguarded Newton steps.
fn solve(b: f64, w: f64) -> Result<f64, OpError> {
    // w == 0 is the arcsinh limit
    if w == 0.0 {
        return Ok(b);
    }
    let tolerance = 2.0 * b * f64::EPSILON;
    let mut d_lo = 0.0;
    let mut d_hi = b;
    let mut d = (d_lo + d_hi) / 2.0;
    let mut last_delta = d_hi - d_lo;
    let f_b = -2.0 * b.ln() + w * b;
    let mut f = 2.0 * d.ln() + w * d + f_b;
    let mut last_f = f64::NAN;

    for _ in 1..20 {
        let df = 2.0 / d + w;
        let delta;
        if ((d - d_hi) * df - f) * ((d - d_lo) * df - f) >= 0.0
            || (1.9 * f).abs() > (last_delta * df).abs()
        {
            delta = (d_hi - d_lo) / 2.0;
            d = d_lo + delta;
            if d == d_lo {
                return Ok(d);
            }
        } else {
            delta = f / df;
            let previous = d;
            d -= delta;
            if d == previous {
                return Ok(d);
            }
        }
        if delta.abs() < tolerance {
            return Ok(d);
        }
        last_delta = delta;
        f = 2.0 * d.ln() + w * d + f_b;
        if f == 0.0 || f == last_f {
            return Ok(d);
        }
        last_f = f;
        if f < 0.0 {
            d_lo = d;
        } else {
            d_hi = d;
        }
    }
    Err(OpError::internal("Logicle parameter solve did not converge"))
}
