//! Householder reduction to upper Hessenberg form.

use dyn_stack::{GlobalPodBuffer, PodStack, ReborrowMut};
use faer_core::householder::{
    apply_block_householder_sequence_on_the_right_in_place_req,
    apply_block_householder_sequence_on_the_right_in_place_with_conj,
};
use faer_core::{Conj, Mat, MatRef, Parallelism};
use faer_evd::hessenberg::{make_hessenberg_in_place, make_hessenberg_in_place_req};
use faer_qr::no_pivoting::compute::recommended_blocksize;

use crate::dense::StackError;

/// Reduce the square matrix `a` to upper Hessenberg form.
///
/// Returns `(q, h)` with `A = Q * H * Q^T`, `Q` orthogonal and every entry of
/// `H` below the first subdiagonal exactly zero.
pub(crate) fn reduce(a: MatRef<'_, f64>) -> Result<(Mat<f64>, Mat<f64>), StackError> {
    let n = a.nrows();
    let mut h = a.to_owned();
    let mut q = Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
    if n <= 2 {
        return Ok((q, h));
    }

    let par = Parallelism::None;
    let bs = recommended_blocksize::<f64>(n - 1, n - 1);
    let req = make_hessenberg_in_place_req::<f64>(n, bs, par)
        .and_then(|req| req.try_or(apply_block_householder_sequence_on_the_right_in_place_req::<f64>(n - 1, bs, n)?))
        .map_err(|_| StackError::Overflow)?;
    let mut mem = GlobalPodBuffer::try_new(req).map_err(|_| StackError::Alloc)?;
    let mut stack = PodStack::new(&mut mem);

    let mut householder = Mat::<f64>::zeros(bs, n - 1);
    make_hessenberg_in_place(h.as_mut(), householder.as_mut().transpose_mut(), par, stack.rb_mut());
    apply_block_householder_sequence_on_the_right_in_place_with_conj(
        h.as_ref().submatrix(1, 0, n - 1, n - 1),
        householder.as_ref(),
        Conj::No,
        q.as_mut().submatrix_mut(1, 1, n - 1, n - 1),
        par,
        stack.rb_mut(),
    );

    for j in 0..n {
        for i in j + 2..n {
            h.write(i, j, 0.0);
        }
    }
    Ok((q, h))
}
