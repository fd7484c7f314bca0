// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::ArrayView1;

/// Index of the interval `[xp[i], xp[i + 1])` containing `x`. `xp` must be increasing and `x` within its bounds.
fn bsearch(xp: &ArrayView1<'_, f32>, x: f32) -> usize {
	let mut low = 0;
	let mut high = xp.len() - 1;
	while high > low + 1 {
		let mid = (low + high) / 2;
		if xp[mid] > x {
			high = mid;
		} else {
			low = mid;
		}
	}
	low
}

/// Piecewise linear interpolation of the points `(xp, fp)` at `x`. `xp` must be increasing. Values outside the range
/// of `xp` are clamped to the first or last point.
pub(crate) fn interp(x: f32, xp: ArrayView1<'_, f32>, fp: ArrayView1<'_, f32>) -> f32 {
	debug_assert_eq!(xp.len(), fp.len());
	let last = xp.len() - 1;
	if x <= xp[0] {
		return fp[0];
	}
	if x >= xp[last] {
		return fp[last];
	}

	let i = bsearch(&xp, x);
	let (x_l, x_h) = (xp[i], xp[i + 1]);
	let (y_l, y_h) = (fp[i], fp[i + 1]);
	let dx = x_h - x_l;
	if dx > 0.0 { y_l + (x - x_l) / dx * (y_h - y_l) } else { y_l }
}

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::interp;

	#[test]
	fn interpolates_between_points() {
		let xp = array![0.0, 1.0, 2.0, 4.0];
		let fp = array![0.0, 10.0, 20.0, 0.0];
		assert_eq!(interp(0.5, xp.view(), fp.view()), 5.0);
		assert_eq!(interp(2.0, xp.view(), fp.view()), 20.0);
		assert_eq!(interp(3.0, xp.view(), fp.view()), 10.0);
	}

	#[test]
	fn clamps_outside_range() {
		let xp = array![0.0, 1.0];
		let fp = array![3.0, 7.0];
		assert_eq!(interp(-1.0, xp.view(), fp.view()), 3.0);
		assert_eq!(interp(1.0, xp.view(), fp.view()), 7.0);
		assert_eq!(interp(9.0, xp.view(), fp.view()), 7.0);
	}
}
