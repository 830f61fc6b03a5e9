use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::trace;

use crate::symbolic::{floordiv, Node, NodeKind, Variable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    /// Above this many variable assignments the validity check is kept
    /// without trying to prove it redundant.
    pub max_combinations: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig { max_combinations: 1 << 14 }
    }
}

fn and_nodes(valid: &Node) -> Vec<Node> {
    match valid.kind() {
        NodeKind::And(nodes) => nodes.clone(),
        _ => vec![valid.clone()],
    }
}

/// Narrow each variable by the single-variable `x < b` checks in `valid`.
fn narrow_ranges(valid: &Node) -> BTreeMap<Variable, Node> {
    let mut ranges: BTreeMap<Variable, (i64, i64)> =
        valid.vars().into_iter().map(|v| (v.clone(), (v.vmin(), v.vmax()))).collect();
    for nd in and_nodes(valid) {
        let NodeKind::Lt(a, b) = nd.kind() else {
            continue;
        };
        let vars = nd.vars();
        let [v] = vars.as_slice() else {
            continue;
        };
        let Some(range) = ranges.get_mut(v) else {
            continue;
        };
        match a.kind() {
            NodeKind::Mul(_, m) if *m < 0 => range.0 = range.0.max(floordiv(*b, *m) + 1),
            NodeKind::Mul(_, m) if *m > 0 => {
                let hi = if b % m == 0 { floordiv(*b, *m) - 1 } else { floordiv(*b, *m) };
                range.1 = range.1.min(hi);
            }
            NodeKind::Var(_) => range.1 = range.1.min(b - 1),
            _ => {}
        }
    }
    ranges
        .into_iter()
        .filter(|(v, (lo, hi))| lo < hi && (*lo, *hi) != (v.vmin(), v.vmax()))
        .map(|(v, (lo, hi))| {
            let narrowed = Node::loop_var(v.name(), lo, hi);
            (v, narrowed)
        })
        .collect()
}

/// `sym + c` split into its symbolic part and constant.
fn split_const(n: &Node) -> (Node, i64) {
    match n.kind() {
        NodeKind::Sum(nodes) => {
            let c = nodes.iter().filter_map(Node::as_num).sum();
            (Node::sum(nodes.iter().filter(|x| !x.is_num()).cloned().collect()), c)
        }
        NodeKind::Num(c) => (Node::num(0), *c),
        _ => (n.clone(), 0),
    }
}

/// Whether failing `check` already puts `coord` outside `[0, dim)`.
fn check_is_bound(check: &Node, coord: &Node, dim: i64) -> bool {
    let NodeKind::Lt(a, b) = check.kind() else {
        return false;
    };
    let (sym, c) = split_const(coord);
    if sym.is_num() {
        return false;
    }
    // sym < b fails when coord >= b + c
    if *a == sym {
        return b + c == dim;
    }
    // -sym < b fails when coord < c - b + 1
    if a.negate() == sym {
        return c - b + 1 == 0;
    }
    false
}

fn combinations(vars: &[Variable]) -> u64 {
    vars.iter()
        .map(|v| u64::try_from(v.vmax() - v.vmin() + 1).unwrap_or(u64::MAX))
        .fold(1u64, u64::saturating_mul)
}

/// Split a flat index into an image of `base_shape = [height, width, 4]`
/// into `(x, y)` texel coordinates, and drop the parts of `valid` that an
/// out of bounds coordinate already covers. Reads outside the image are 0.
pub fn to_image_idx(base_shape: [i64; 3], idxy: &Node, valid: &Node, cfg: &ImageConfig) -> ((Node, Node), Node) {
    let [height, width, _] = base_shape;
    let (mut idxy, mut valid) = (idxy.clone(), valid.clone());
    if valid.min() == 0 {
        let sub = narrow_ranges(&valid);
        if !sub.is_empty() {
            valid = valid.substitute(&sub);
            idxy = idxy.substitute(&sub);
        }
    }

    let idx = (&idxy / 4) % width;
    let idy = &idxy / (4 * width);

    let idx_vars: BTreeSet<Variable> = idx.vars().into_iter().collect();
    let idy_vars: BTreeSet<Variable> = idy.vars().into_iter().collect();

    if valid.min() == 0 && idx_vars.is_disjoint(&idy_vars) {
        let kept: Vec<Node> = and_nodes(&valid)
            .into_iter()
            .filter(|nd| !check_is_bound(nd, &idx, width) && !check_is_bound(nd, &idy, height))
            .collect();
        valid = Node::ands(kept);
    }

    // brute force: valid is redundant if no invalid point shares a texel
    // with a valid one and every invalid point lands outside the image
    if valid.min() == 0 && !matches!(idx.kind(), NodeKind::Mod(..)) {
        let mut vars: Vec<Variable> = valid.vars();
        for v in idx_vars.iter().chain(&idy_vars) {
            if !vars.contains(v) {
                vars.push(v.clone());
            }
        }
        if combinations(&vars) <= cfg.max_combinations {
            let vals = valid.expand(&vars);
            let xs = idx.expand(&vars);
            let ys = idy.expand(&vars);
            let mut seen: [HashSet<(i64, i64)>; 2] = [HashSet::new(), HashSet::new()];
            for ((v, x), y) in vals.iter().zip(&xs).zip(&ys) {
                seen[usize::from(v.min() != 0)].insert((x.min(), y.min()));
            }
            let outside = |&(x, y): &(i64, i64)| x < 0 || x >= width || y < 0 || y >= height;
            if seen[1].is_disjoint(&seen[0]) && seen[0].iter().all(outside) {
                trace!("image validity {valid} is redundant");
                valid = Node::num(1);
            }
        }
    }

    ((idx, idy), valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::VarVals;

    fn vars(n: &Node) -> Variable {
        n.as_var().unwrap().clone()
    }

    #[test]
    fn test_plain_index_splits() {
        let i = Node::loop_var("i", 0, 4 * 8 * 2 - 1);
        let ((x, y), valid) = to_image_idx([2, 8, 4], &i, &Node::num(1), &ImageConfig::default());
        assert_eq!(valid, 1);
        for v in 0..64 {
            let vals = VarVals::from([(vars(&i), v)]);
            assert_eq!(x.eval(&vals), Some((v / 4) % 8));
            assert_eq!(y.eval(&vals), Some(v / 32));
        }
    }

    #[test]
    fn test_narrowing_removes_bound_check() {
        let x = Node::loop_var("x", 0, 9);
        let idxy = x.times(4);
        let valid = x.lt(6);
        let ((idx, idy), valid) = to_image_idx([1, 6, 4], &idxy, &valid, &ImageConfig::default());
        assert_eq!(valid, 1);
        assert_eq!(idy, 0);
        assert_eq!(idx.max(), 5);
    }

    #[test]
    fn test_check_at_image_edge_is_dropped() {
        let a = Node::loop_var("a", 0, 4);
        let b = Node::loop_var("b", 0, 4);
        let z = Node::loop_var("z", 0, 1);
        let idxy = (&a + &b).times(4);
        let valid = Node::ands(vec![(&a + &b).lt(8), z.lt(1)]);
        let ((_, idy), valid) = to_image_idx([8, 1, 4], &idxy, &valid, &ImageConfig { max_combinations: 0 });
        assert_eq!(idy, &a + &b);
        assert_eq!(valid, z.lt(1));
    }

    #[test]
    fn test_check_inside_image_is_kept() {
        let a = Node::loop_var("a", 0, 4);
        let b = Node::loop_var("b", 0, 4);
        let idxy = (&a + &b).times(4);
        let valid = (&a + &b).lt(6);
        let (_, kept) = to_image_idx([16, 1, 4], &idxy, &valid, &ImageConfig::default());
        assert_eq!(kept, valid);
    }
}
