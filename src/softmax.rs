//! READ: <https://zhuanlan.zhihu.com/p/11656282335>

use crate::flash::Stat;
use num_traits::Float;
use std::iter::zip;

/// 增量 softmax 实现
pub fn online_softmax<T: Float>(data: &mut [T]) {
    // 一次遍历，同时确定最大值和指数和
    let mut s = Stat::empty();
    for &x in &*data {
        s.push(x)
    }

    let Stat { max, sum } = s;

    // 归一化
    for x in data {
        *x = (*x - max).exp() / sum
    }
}

/// chunk 内的局部 softmax。
///
/// `max` 是 chunk 内有效位置的最大值。无效位置权重置 0，不参与求和。
/// 返回有效位置的指数和；全部无效时返回 0，`scores` 全部置 0。
pub fn local_softmax<T: Float>(scores: &mut [T], valid: &[bool], max: T) -> T {
    debug_assert_eq!(scores.len(), valid.len());

    let mut sum = T::zero();
    for (x, &valid) in zip(&mut *scores, valid) {
        *x = if valid { (*x - max).exp() } else { T::zero() };
        sum = sum + *x
    }

    if sum > T::zero() {
        let inv = sum.recip();
        scores.iter_mut().for_each(|x| *x = *x * inv)
    }
    sum
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    #[test]
    fn test_online_softmax() {
        let data: Vec<f64> = (0..4096)
            .map(|_| (rand::random::<f64>() - 0.5) * 20.)
            .collect();

        // 计算标准 softmax
        let mut ans = data.clone();
        safe_softmax(&mut ans);

        // 计算 online softmax
        let mut data = data;
        online_softmax(&mut data);

        for (ans, res) in zip(ans, data) {
            assert!((ans - res).abs() < f64::EPSILON)
        }
    }

    #[test]
    fn test_local_softmax_masked() {
        let mut scores = [1f64, 5., 2., 3.];
        let valid = [true, false, true, true];
        let sum = local_softmax(&mut scores, &valid, 3.);

        let mut ans = [1f64, 2., 3.];
        safe_softmax(&mut ans);

        assert_eq!(scores[1], 0.);
        assert!((sum - [-2f64, -1., 0.].iter().map(|x| x.exp()).sum::<f64>()).abs() < 1e-12);
        for (ans, res) in zip(ans, [scores[0], scores[2], scores[3]]) {
            assert!((ans - res).abs() < 1e-12)
        }
    }

    #[test]
    fn test_local_softmax_leading_masked() {
        // chunk 开头的无效位置 score 记 0，大于所有有效 score，但不能影响最大值和权重
        let mut scores = [0f64, 0., -3., -2.];
        let valid = [false, false, true, true];
        let sum = local_softmax(&mut scores, &valid, -2.);

        let mut ans = [-3f64, -2.];
        safe_softmax(&mut ans);

        assert_eq!(scores[..2], [0., 0.]);
        assert!((sum - (1. + (-1f64).exp())).abs() < 1e-12);
        for (ans, res) in zip(ans, &scores[2..]) {
            assert!((ans - res).abs() < 1e-12)
        }
    }

    #[test]
    fn test_local_softmax_all_masked() {
        let mut scores = [0f32; 4];
        let sum = local_softmax(&mut scores, &[false; 4], f32::MIN);
        assert_eq!(sum, 0.);
        assert_eq!(scores, [0.; 4])
    }

    /// 标准 softmax 实现
    pub fn safe_softmax<T: Float>(data: &mut [T]) {
        // 找到最大值以提高数值稳定性
        let mut max = T::neg_infinity();
        for &x in &*data {
            max = max.max(x)
        }

        // 计算指数并求和
        let mut sum = T::zero();
        for x in &mut *data {
            *x = (*x - max).exp();
            sum = sum + *x
        }

        // 归一化
        for x in data {
            *x = *x / sum
        }
    }
}
