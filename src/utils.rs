use nalgebra::{Dim, RealField, U1, Vector, convert, storage::Storage};
use num_traits::float::Float;

#[inline]
pub(crate) fn epsmch<F: RealField>() -> F {
    F::default_epsilon()
}

#[inline]
pub(crate) fn giant<F: Float>() -> F {
    F::max_value()
}

#[inline]
pub(crate) fn dwarf<F: Float>() -> F {
    F::min_positive_value()
}

/// Euclidean norm computed with the three-accumulator scheme of MINPACK's
/// `ENORM` so that very small and very large components neither underflow
/// nor overflow.
#[inline]
pub(crate) fn enorm<F, N, VS>(v: &Vector<F, N, VS>) -> F
where
    F: RealField + Float + Copy,
    N: Dim,
    VS: Storage<F, N, U1>,
{
    let mut s1 = F::zero();
    let mut s2 = F::zero();
    let mut s3 = F::zero();
    let mut x1max = F::zero();
    let mut x3max = F::zero();
    let agiant = Float::sqrt(giant::<F>()) / convert(v.nrows() as f64);
    let rdwarf = Float::sqrt(dwarf::<F>());
    for xi in v.iter() {
        let xabs = xi.abs();
        if xabs.is_nan() {
            return xabs;
        }
        if xabs >= agiant || xabs <= rdwarf {
            if xabs > rdwarf {
                // sum for large components
                if xabs > x1max {
                    s1 = F::one() + s1 * Float::powi(x1max / xabs, 2);
                    x1max = xabs;
                } else {
                    s1 += Float::powi(xabs / x1max, 2);
                }
            } else {
                // sum for small components
                if xabs > x3max {
                    s3 = F::one() + s3 * Float::powi(x3max / xabs, 2);
                    x3max = xabs;
                } else if xabs != F::zero() {
                    s3 += Float::powi(xabs / x3max, 2);
                }
            }
        } else {
            s2 += xabs * xabs;
        }
    }

    if !s1.is_zero() {
        x1max * Float::sqrt(s1 + (s2 / x1max) / x1max)
    } else if !s2.is_zero() {
        Float::sqrt(if s2 >= x3max {
            s2 * (F::one() + (x3max / s2) * (x3max * s3))
        } else {
            x3max * ((s2 / x3max) + (x3max * s3))
        })
    } else {
        x3max * Float::sqrt(s3)
    }
}
