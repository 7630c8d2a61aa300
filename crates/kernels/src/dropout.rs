//! Inverted dropout.

use anyhow::{ensure, Result};
use fastrand::Rng;
use ndarray::{ArrayBase, DataMut, Dimension};

/// Zero each element with probability `p` and scale survivors by `1 / (1 - p)`.
///
/// Draws come from the caller's generator, so a seeded `Rng` reproduces the
/// same mask. `p == 0` leaves the data untouched and consumes no randomness.
pub fn dropout_inplace<S, D>(data: &mut ArrayBase<S, D>, p: f32, rng: &mut Rng) -> Result<()>
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    ensure!(
        (0.0..1.0).contains(&p),
        "dropout probability must be in [0, 1), got {}",
        p
    );
    if p == 0.0 {
        return Ok(());
    }

    let scale = 1.0 / (1.0 - p);
    data.map_inplace(|x| {
        if rng.f32() < p {
            *x = 0.0;
        } else {
            *x *= scale;
        }
    });
    Ok(())
}
