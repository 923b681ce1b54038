use crate::error::{new_error, Error, ErrorKind};

/// Divide `dividend` by `divisor`, element by element.
///
/// Both columns must have the same length. Zero divisors are not special
/// cased and yield the IEEE results (`inf` or `NaN`); [`ResultTable`]
/// applies its own zero policy before calling this.
///
/// ```
/// let ipc = pmc_session::rate(&[10.0, 20.0], &[5.0, 4.0])?;
/// assert_eq!(ipc, vec![2.0, 5.0]);
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
///
/// [`ResultTable`]: crate::ResultTable
pub fn rate(dividend: &[f64], divisor: &[f64]) -> Result<Vec<f64>, Error> {
    if dividend.len() != divisor.len() {
        return Err(new_error(ErrorKind::DimensionMismatch {
            dividend: dividend.len(),
            divisor: divisor.len(),
        }));
    }

    Ok(dividend
        .iter()
        .zip(divisor)
        .map(|(a, b)| a / b)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate() {
        assert_eq!(rate(&[10.0, 20.0], &[5.0, 4.0]).unwrap(), vec![2.0, 5.0]);
        assert_eq!(rate(&[], &[]).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_rate_dimension_mismatch() {
        let err = rate(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::DimensionMismatch {
                dividend: 1,
                divisor: 2
            }
        );
    }

    #[test]
    fn test_rate_zero_divisor_not_special() {
        let r = rate(&[1.0, 0.0], &[0.0, 0.0]).unwrap();
        assert!(r[0].is_infinite());
        assert!(r[1].is_nan());
    }
}
