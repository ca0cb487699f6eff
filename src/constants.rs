/// Physical and mathematical constants used in the routines.
use std::f64::consts::PI;

use crate::C64;

// for convenience
pub static J: C64 = C64::new(0., 1.);

// vacuum permeability in H/m
pub static MU_0: f64 = 4e-7 * PI;

/// Angular frequency term `s = j*2*pi*f` of the Laplace variable.
#[inline]
pub fn laplace_s(freq: f64) -> C64 {
    C64::new(0., 2. * PI * freq)
}
