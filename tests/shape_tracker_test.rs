use kernelken::{iter_idxs, to_nodes, Node, ShapeTracker, VarVals, Variable};
use proptest::prelude::*;

/// Every element of the tracked tensor as an offset into the base buffer,
/// row-major. `None` is padding.
#[derive(Clone, Debug)]
struct Naive {
    shape: Vec<i64>,
    data: Vec<Option<i64>>,
}

fn strides(shape: &[i64]) -> Vec<i64> {
    let mut acc = 1;
    let mut out = vec![0; shape.len()];
    for (o, s) in out.iter_mut().zip(shape).rev() {
        *o = acc;
        acc *= s;
    }
    out
}

/// Multi-indices of `shape`, last axis fastest.
fn indices(shape: &[i64]) -> Vec<Vec<i64>> {
    let ranges: Vec<(i64, i64)> = shape.iter().rev().map(|s| (0, s - 1)).collect();
    iter_idxs(&ranges)
        .into_iter()
        .map(|mut i| {
            i.reverse();
            i
        })
        .collect()
}

impl Naive {
    fn new(shape: &[i64]) -> Naive {
        let n: i64 = shape.iter().product();
        Naive {
            shape: shape.to_vec(),
            data: (0..n).map(Some).collect(),
        }
    }

    fn at(&self, idx: &[i64]) -> Option<i64> {
        let flat: i64 = idx.iter().zip(strides(&self.shape)).map(|(i, s)| i * s).sum();
        self.data[usize::try_from(flat).unwrap()]
    }

    fn map(&self, shape: Vec<i64>, f: impl Fn(&[i64]) -> Option<Vec<i64>>) -> Naive {
        let data = indices(&shape).iter().map(|i| f(i).and_then(|old| self.at(&old))).collect();
        Naive { shape, data }
    }

    fn reshape(&self, shape: &[i64]) -> Naive {
        Naive {
            shape: shape.to_vec(),
            data: self.data.clone(),
        }
    }

    fn permute(&self, axes: &[usize]) -> Naive {
        let shape = axes.iter().map(|a| self.shape[*a]).collect();
        self.map(shape, |i| {
            let mut old = vec![0; i.len()];
            for (n, a) in axes.iter().enumerate() {
                old[*a] = i[n];
            }
            Some(old)
        })
    }

    fn pad(&self, arg: &[(i64, i64)]) -> Naive {
        let shape = self.shape.iter().zip(arg).map(|(s, (l, r))| s + l + r).collect();
        self.map(shape, |i| {
            let old: Vec<i64> = i.iter().zip(arg).map(|(x, (l, _))| x - l).collect();
            old.iter().zip(&self.shape).all(|(x, s)| 0 <= *x && x < s).then_some(old)
        })
    }

    fn shrink(&self, arg: &[(i64, i64)]) -> Naive {
        let shape = arg.iter().map(|(lo, hi)| hi - lo).collect();
        self.map(shape, |i| Some(i.iter().zip(arg).map(|(x, (lo, _))| x + lo).collect()))
    }

    fn expand(&self, shape: &[i64]) -> Naive {
        self.map(shape.to_vec(), |i| {
            Some(i.iter().zip(&self.shape).map(|(x, s)| if *s == 1 { 0 } else { *x }).collect())
        })
    }

    fn stride(&self, mul: &[i64]) -> Naive {
        let shape = self
            .shape
            .iter()
            .zip(mul)
            .map(|(s, m)| (s + m.abs() - 1) / m.abs())
            .collect();
        self.map(shape, |i| {
            Some(
                i.iter()
                    .zip(mul)
                    .zip(&self.shape)
                    .map(|((x, m), s)| if *m > 0 { x * m } else { s - 1 - x * m.abs() })
                    .collect(),
            )
        })
    }
}

#[derive(Clone, Debug)]
enum Movement {
    Split(usize),
    Merge(usize),
    Flatten,
    Permute(usize),
    Pad(Vec<(i64, i64)>),
    Shrink(Vec<u8>),
    Expand(i64),
    Stride(Vec<i64>),
}

fn movement() -> impl Strategy<Value = Movement> {
    prop_oneof![
        (0usize..4).prop_map(Movement::Split),
        (0usize..4).prop_map(Movement::Merge),
        Just(Movement::Flatten),
        (1usize..4).prop_map(Movement::Permute),
        prop::collection::vec((0i64..2, 0i64..2), 4).prop_map(Movement::Pad),
        prop::collection::vec(any::<u8>(), 8).prop_map(Movement::Shrink),
        (2i64..4).prop_map(Movement::Expand),
        prop::collection::vec(prop_oneof![Just(1i64), Just(-1), Just(2), Just(-2)], 4).prop_map(Movement::Stride),
    ]
}

/// Apply `m` to both models, or skip it when it makes no sense for the shape.
fn apply(st: &ShapeTracker, naive: &Naive, m: &Movement) -> Option<(ShapeTracker, Naive)> {
    let shape = naive.shape.clone();
    let n = shape.len();
    let reshaped = |new: Vec<i64>| Some((st.reshape(&to_nodes(&new)).unwrap(), naive.reshape(&new)));
    match m {
        Movement::Split(d) => {
            let d = d % n;
            if shape[d] % 2 != 0 || n >= 4 {
                return None;
            }
            let mut new = shape[..d].to_vec();
            new.extend([2, shape[d] / 2]);
            new.extend_from_slice(&shape[d + 1..]);
            reshaped(new)
        }
        Movement::Merge(d) => {
            if n < 2 {
                return None;
            }
            let d = d % (n - 1);
            let mut new = shape[..d].to_vec();
            new.push(shape[d] * shape[d + 1]);
            new.extend_from_slice(&shape[d + 2..]);
            reshaped(new)
        }
        Movement::Flatten => reshaped(vec![shape.iter().product()]),
        Movement::Permute(r) => {
            let axes: Vec<usize> = (0..n).map(|i| (i + r) % n).collect();
            Some((st.permute(&axes).unwrap(), naive.permute(&axes)))
        }
        Movement::Pad(arg) => {
            if shape.iter().product::<i64>() > 200 {
                return None;
            }
            let arg = &arg[..n];
            Some((st.pad(arg).unwrap(), naive.pad(arg)))
        }
        Movement::Shrink(bytes) => {
            let arg: Vec<(i64, i64)> = shape
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let lo = i64::from(bytes[2 * i]) % s;
                    let hi = lo + 1 + i64::from(bytes[2 * i + 1]) % (s - lo);
                    (lo, hi)
                })
                .collect();
            Some((st.shrink(&arg).unwrap(), naive.shrink(&arg)))
        }
        Movement::Expand(to) => {
            if n >= 4 || shape.iter().product::<i64>() > 100 {
                return None;
            }
            let mut with_one = vec![1];
            with_one.extend_from_slice(&shape);
            let st = st.reshape(&to_nodes(&with_one)).unwrap();
            let naive = naive.reshape(&with_one);
            with_one[0] = *to;
            Some((st.expand(&to_nodes(&with_one)).unwrap(), naive.expand(&with_one)))
        }
        Movement::Stride(mul) => {
            let mul = &mul[..n];
            Some((st.stride(mul).unwrap(), naive.stride(mul)))
        }
    }
}

fn check(st: &ShapeTracker, naive: &Naive) -> Result<(), TestCaseError> {
    let shape = &naive.shape;
    let nodes = to_nodes(shape);
    prop_assert_eq!(st.shape(), nodes.as_slice());
    let vars: Vec<Option<Variable>> = shape
        .iter()
        .enumerate()
        .map(|(i, s)| (*s > 1).then(|| Variable::new(&format!("idx{i}"), 0, s - 1).unwrap()))
        .collect();
    let idx_nodes: Vec<Node> = vars
        .iter()
        .map(|v| v.as_ref().map_or_else(|| Node::num(0), Variable::node))
        .collect();
    let (idx, valid) = st.expr_idxs(Some(&idx_nodes));
    for i in indices(shape) {
        let expected = naive.at(&i);
        prop_assert_eq!(st.index_of(&i), expected, "index_of {:?} in {}", i, st);
        let vals: VarVals = vars
            .iter()
            .zip(&i)
            .filter_map(|(v, x)| v.clone().map(|v| (v, *x)))
            .collect();
        let is_valid = valid.eval(&vals) != Some(0);
        prop_assert_eq!(is_valid, expected.is_some(), "valid {} at {:?} in {}", valid, i, st);
        if let Some(e) = expected {
            prop_assert_eq!(idx.eval(&vals), Some(e), "idx {} at {:?} in {}", idx, i, st);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_movements_match_naive(
        shape in prop::collection::vec(1i64..5, 1..4),
        moves in prop::collection::vec(movement(), 1..6),
    ) {
        let mut st = ShapeTracker::from_shape(&to_nodes(&shape)).unwrap();
        let mut naive = Naive::new(&shape);
        for m in &moves {
            if let Some((s, n)) = apply(&st, &naive, m) {
                st = s;
                naive = n;
            }
        }
        check(&st, &naive)?;
        check(&st.simplify(), &naive)?;
    }
}

#[test]
fn test_pad_then_inverse_shrink_is_identity() {
    let st = ShapeTracker::from_shape(&to_nodes(&[4, 4])).unwrap();
    let st = st.pad(&[(1, 1), (1, 1)]).unwrap().shrink(&[(1, 5), (1, 5)]).unwrap();
    assert_eq!(st.views().len(), 1);
    assert!(st.contiguous());
    assert!(st.views()[0].mask().is_none());
    let (idx, valid) = st.expr_idxs(None);
    assert_eq!(valid, 1);
    for i in 0..4 {
        for j in 0..4 {
            assert_eq!(st.index_of(&[i, j]), Some(i * 4 + j));
        }
    }
    let (plain, _) = ShapeTracker::from_shape(&to_nodes(&[4, 4])).unwrap().expr_idxs(None);
    assert_eq!(idx, plain);
}

#[test]
fn test_double_reshape_collapses() {
    let st = ShapeTracker::from_shape(&to_nodes(&[4, 6])).unwrap();
    let twice = st
        .permute(&[1, 0])
        .unwrap()
        .reshape(&to_nodes(&[24]))
        .unwrap()
        .reshape(&to_nodes(&[6, 4]))
        .unwrap();
    let once = st.permute(&[1, 0]).unwrap();
    assert_eq!(twice.views().len(), 2);
    let merged = twice.simplify();
    assert_eq!(merged.views().len(), 1);
    assert_eq!(merged.views()[0].strides(), once.views()[0].strides());
    for i in 0..6 {
        for j in 0..4 {
            assert_eq!(twice.index_of(&[i, j]), once.index_of(&[i, j]));
        }
    }
}

#[test]
fn test_pad_reshape_expand_keeps_padding() {
    let st = ShapeTracker::from_shape(&to_nodes(&[1, 1]))
        .unwrap()
        .pad(&[(0, 0), (0, 1)])
        .unwrap()
        .reshape(&to_nodes(&[1, 1, 2]))
        .unwrap()
        .expand(&to_nodes(&[2, 1, 2]))
        .unwrap();
    for i in 0..2 {
        assert_eq!(st.index_of(&[i, 0, 0]), Some(0));
        assert_eq!(st.index_of(&[i, 0, 1]), None);
    }
    let naive = Naive::new(&[1, 1])
        .pad(&[(0, 0), (0, 1)])
        .reshape(&[1, 1, 2])
        .expand(&[2, 1, 2]);
    check(&st, &naive).unwrap();
}
