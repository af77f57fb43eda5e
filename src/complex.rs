pub use num_complex::Complex;

/// One I/Q pair as shifted in, in-phase as the real part
pub type ComplexSample = Complex<i32>;

/// Widen a raw pair for phase work
pub fn to_f64(sample: ComplexSample) -> Complex<f64> {
    Complex::new(sample.re as f64, sample.im as f64)
}
