use std::fmt::Display;

use log::trace;
use snafu::ensure;

use crate::{
    error::{InvalidMovementSnafu, Result},
    symbolic::{all_int, as_ints, render_shape, sym_prod, Node, NodeKind, VarVals, Variable},
    view::View,
};

/// A stack of views. Movement ops only touch the last (outermost) view; a
/// reshape that can't be expressed in place pushes a new one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    views: Vec<View>,
}

/// Fold `vm1` on top of `vm2` into a single view, if the combined index is
/// still a plain strided expression.
pub fn merge_views(vm2: &View, vm1: &View) -> Option<View> {
    if vm2.mask().is_some() || vm1.offset() != 0 {
        return None;
    }
    let st = ShapeTracker {
        views: vec![vm2.clone(), vm1.clone()],
    };
    let strides: Option<Vec<i64>> = st.real_strides(false).into_iter().collect();
    Some(View::new(
        vm1.shape().to_vec(),
        &strides?,
        vm2.offset(),
        vm1.mask().cloned(),
    ))
}

/// The groups of old axes that multiply into each new axis, if `new_shape`
/// only combines adjacent axes of `old_shape`.
pub fn get_contraction(old_shape: &[Node], new_shape: &[Node]) -> Option<Vec<Vec<usize>>> {
    if new_shape.is_empty() {
        return if old_shape.is_empty() { Some(vec![]) } else { None };
    }
    let mut axis_groups: Vec<Vec<usize>> = vec![vec![]; new_shape.len()];
    let last = new_shape.len() - 1;
    let mut i = 0;
    let mut old_i = 0;
    while old_i < old_shape.len() {
        if new_shape[i] == 1 && old_shape[old_i] != 1 {
            if i == last {
                return None;
            }
            i += 1;
        } else {
            axis_groups[i].push(old_i);
            let group: Vec<Node> = axis_groups[i].iter().map(|&x| old_shape[x].clone()).collect();
            let size = sym_prod(&group);
            if size == new_shape[i] {
                if i < last {
                    i += 1;
                }
            } else {
                match (size.as_num(), new_shape[i].as_num()) {
                    (Some(a), Some(b)) if a < b => {}
                    _ => return None,
                }
            }
            old_i += 1;
        }
    }
    Some(axis_groups)
}

fn idx_vars(shape: &[Node]) -> Vec<Node> {
    shape
        .iter()
        .enumerate()
        .map(|(i, s)| Node::loop_var(&format!("idx{i}"), 0, (s.max() - 1).max(0)))
        .collect()
}

impl ShapeTracker {
    /// # Errors
    ///
    /// See [`View::from_shape`].
    pub fn from_shape(shape: &[Node]) -> Result<ShapeTracker> {
        Ok(ShapeTracker::from_view(View::from_shape(shape.to_vec())?))
    }

    pub fn from_view(view: View) -> ShapeTracker {
        ShapeTracker { views: vec![view] }
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    fn last(&self) -> &View {
        &self.views[self.views.len() - 1]
    }

    fn with_last(&self, view: View) -> ShapeTracker {
        let mut views = self.views[..self.views.len() - 1].to_vec();
        views.push(view);
        ShapeTracker { views }
    }

    pub fn shape(&self) -> &[Node] {
        self.last().shape()
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].contiguous()
    }

    /// Number of elements of the underlying buffer this tracker can touch.
    pub fn size(&self) -> i64 {
        if self.shape().iter().any(|s| *s == 0) {
            return 0;
        }
        self.expr_idxs(None).0.max() + 1
    }

    pub fn vars(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = vec![];
        for v in self.views.iter().flat_map(View::vars) {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    /// Bind symbolic dims to values.
    #[must_use]
    pub fn substitute(&self, var_vals: &VarVals) -> ShapeTracker {
        ShapeTracker {
            views: self.views.iter().map(|v| v.substitute(var_vals)).collect(),
        }
    }

    /// Per-axis stride of the composed index, `None` where it isn't a single
    /// stride or (unless `ignore_valid`) the axis takes part in the mask.
    pub fn real_strides(&self, ignore_valid: bool) -> Vec<Option<i64>> {
        if self.views.len() == 1 && self.last().mask().is_none() {
            return self.last().strides().iter().map(|s| Some(*s)).collect();
        }
        let idxs = idx_vars(self.shape());
        let (idx, valid) = self.expr_idxs(Some(&idxs));
        let mut ret: Vec<Option<i64>> = vec![None; self.ndim()];
        let terms = match idx.kind() {
            NodeKind::Sum(nodes) => nodes.clone(),
            _ => vec![idx.clone()],
        };
        for this_dim in &terms {
            let (idx_maybe, stride_maybe) = match this_dim.kind() {
                NodeKind::Mul(a, b) => (a.clone(), *b),
                _ => (this_dim.clone(), 1),
            };
            if idx_maybe.as_var().is_none() {
                continue;
            }
            if let Some(pos) = idxs.iter().position(|x| *x == idx_maybe) {
                ret[pos] = Some(stride_maybe);
            }
        }
        let idx_vars = idx.vars();
        let valid_vars = valid.vars();
        for (i, tidx) in idxs.iter().enumerate() {
            match tidx.as_var() {
                Some(v) if valid_vars.contains(v) && !ignore_valid => ret[i] = None,
                Some(v) if !idx_vars.contains(v) => ret[i] = Some(0),
                None => ret[i] = Some(0),
                Some(_) => {}
            }
        }
        ret
    }

    pub fn unit_stride_axes(&self, ignore_valid: bool) -> Vec<usize> {
        self.real_strides(ignore_valid)
            .iter()
            .enumerate()
            .filter(|(_, st)| **st == Some(1))
            .map(|(i, _)| i)
            .collect()
    }

    fn expr_idx(&self, mut idx: Node, mut valid: Node) -> (Node, Node) {
        for v in self.views[..self.views.len() - 1].iter().rev() {
            if valid.max() == 0 {
                return (Node::num(-1), valid);
            }
            valid = v.expr_node_mask(&idx, Some(valid));
            idx = v.expr_node(Some(&idx));
        }
        (idx, valid)
    }

    /// `(index, valid)` for one index node per axis, defaulting to `idx0..idxN`.
    pub fn expr_idxs(&self, idxs: Option<&[Node]>) -> (Node, Node) {
        let default;
        let idxs = match idxs {
            Some(idxs) => idxs,
            None => {
                default = idx_vars(self.shape());
                &default
            }
        };
        let last = self.last();
        let idx = last.expr_idxs(idxs);
        let valid = last.expr_idxs_mask(idxs);
        self.expr_idx(idx, valid)
    }

    /// `(index, valid)` for a single row-major index into the shape.
    pub fn expr_node(&self, idx: Option<&Node>) -> (Node, Node) {
        let default;
        let idx = match idx {
            Some(idx) => idx,
            None => {
                default = Node::loop_var("idx", 0, sym_prod(self.shape()).max() - 1);
                &default
            }
        };
        let last = self.last();
        self.expr_idx(last.expr_node(Some(idx)), last.expr_node_mask(idx, None))
    }

    pub fn axis_is_masked(&self, axis: usize) -> bool {
        let (_, valid) = self.expr_idxs(None);
        let name = format!("idx{axis}");
        valid.vars().iter().any(|v| v.name() == name)
    }

    /// Buffer offset of a concrete multi-index, `None` if it lands in padding
    /// or the tracker still has unbound symbolic dims.
    pub fn index_of(&self, idx: &[i64]) -> Option<i64> {
        let last = self.last();
        if !last.is_valid(idx) {
            return None;
        }
        let mut flat = last.flat_offset(idx);
        for v in self.views[..self.views.len() - 1].iter().rev() {
            let shape = as_ints(v.shape())?;
            let mut multi = vec![0; shape.len()];
            let mut rest = flat;
            for (m, d) in multi.iter_mut().zip(&shape).rev() {
                *m = rest.rem_euclid(*d);
                rest = rest.div_euclid(*d);
            }
            if !v.is_valid(&multi) {
                return None;
            }
            flat = v.flat_offset(&multi);
        }
        Some(flat)
    }

    /// Fold trailing views together where possible.
    #[must_use]
    pub fn simplify(&self) -> ShapeTracker {
        if self.views.len() >= 2 {
            let n = self.views.len();
            if let Some(new_view) = merge_views(&self.views[n - 2], &self.views[n - 1]) {
                trace!("st simplify: {} + {} = {new_view}", self.views[n - 2], self.views[n - 1]);
                let mut views = self.views[..n - 2].to_vec();
                views.push(new_view);
                return ShapeTracker { views }.simplify();
            }
        }
        self.clone()
    }

    /// # Errors
    ///
    /// See [`View::pad`].
    pub fn pad(&self, arg: &[(i64, i64)]) -> Result<ShapeTracker> {
        Ok(self.with_last(self.last().pad(arg)?))
    }

    /// # Errors
    ///
    /// See [`View::shrink`].
    pub fn shrink(&self, arg: &[(i64, i64)]) -> Result<ShapeTracker> {
        Ok(self.with_last(self.last().shrink(arg)?))
    }

    /// # Errors
    ///
    /// See [`View::expand`].
    pub fn expand(&self, new_shape: &[Node]) -> Result<ShapeTracker> {
        Ok(self.with_last(self.last().expand(new_shape)?))
    }

    /// # Errors
    ///
    /// See [`View::permute`].
    pub fn permute(&self, axis: &[usize]) -> Result<ShapeTracker> {
        Ok(self.with_last(self.last().permute(axis)?))
    }

    /// # Errors
    ///
    /// See [`View::stride`].
    pub fn stride(&self, mul: &[i64]) -> Result<ShapeTracker> {
        Ok(self.with_last(self.last().stride(mul)?))
    }

    /// # Errors
    ///
    /// `InvalidMovement` on a size mismatch, or when a symbolic view would
    /// have to be buried under a new one.
    pub fn reshape(&self, new_shape: &[Node]) -> Result<ShapeTracker> {
        if let Some(view) = self.last().reshape(new_shape)? {
            return Ok(self.with_last(view));
        }
        ensure!(
            all_int(self.shape()),
            InvalidMovementSnafu {
                op: "reshape",
                shape: render_shape(self.shape()),
                reason: format!("can't stack a view for {} on a symbolic view", render_shape(new_shape)),
            }
        );
        let extra = View::from_shape(new_shape.to_vec())?;
        if let Some(merged) = merge_views(self.last(), &extra) {
            return Ok(self.with_last(merged));
        }
        let mut views = self.views.clone();
        views.push(extra);
        Ok(ShapeTracker { views })
    }
}

impl Display for ShapeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShapeTracker(views=(")?;
        for (i, v) in self.views.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "))")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::{iter_idxs, to_nodes};

    fn st(shape: &[i64]) -> ShapeTracker {
        ShapeTracker::from_shape(&to_nodes(shape)).unwrap()
    }

    fn check_against_exprs(t: &ShapeTracker) {
        let shape = as_ints(t.shape()).unwrap();
        let ranges: Vec<(i64, i64)> = shape.iter().map(|s| (0, s - 1)).collect();
        for idx in iter_idxs(&ranges) {
            let nodes = to_nodes(&idx);
            let (e, valid) = t.expr_idxs(Some(&nodes));
            let expected = if valid.as_num() == Some(0) { None } else { e.as_num() };
            assert_eq!(t.index_of(&idx), expected, "{t} at {idx:?}");
        }
    }

    #[test]
    fn test_reshape_pushes_view() {
        let t = st(&[4, 6]).permute(&[1, 0]).unwrap();
        let r = t.reshape(&to_nodes(&[2, 3, 4])).unwrap();
        // splitting the inner axis of a permuted tensor folds into one view
        assert_eq!(r.views().len(), 1);
        assert_eq!(r.real_strides(false), vec![Some(3), Some(1), Some(6)]);
        let r = t.reshape(&to_nodes(&[24])).unwrap();
        assert_eq!(r.views().len(), 2);
        check_against_exprs(&r);
    }

    #[test]
    fn test_pad_reshape_keeps_mask() {
        let t = st(&[2, 2]).pad(&[(1, 1), (0, 0)]).unwrap();
        assert!(t.axis_is_masked(0));
        assert!(!t.axis_is_masked(1));
        let r = t.reshape(&to_nodes(&[8])).unwrap();
        assert_eq!(r.views().len(), 2);
        assert_eq!(r.real_strides(false), vec![None]);
        check_against_exprs(&r);
        assert_eq!(r.index_of(&[0]), None);
        assert_eq!(r.index_of(&[2]), Some(0));
    }

    #[test]
    fn test_expand_real_strides() {
        let t = st(&[3, 1]).expand(&to_nodes(&[3, 4])).unwrap();
        assert_eq!(t.real_strides(false), vec![Some(1), Some(0)]);
        assert_eq!(t.unit_stride_axes(false), vec![0]);
        assert_eq!(t.size(), 3);
    }

    #[test]
    fn test_size_of_shrunk() {
        let t = st(&[4, 4]).shrink(&[(1, 3), (0, 4)]).unwrap();
        assert_eq!(t.size(), 12);
        assert_eq!(t.index_of(&[0, 0]), Some(4));
    }

    #[test]
    fn test_contraction() {
        let c = get_contraction(&to_nodes(&[2, 3, 4]), &to_nodes(&[6, 4]));
        assert_eq!(c, Some(vec![vec![0, 1], vec![2]]));
        let c = get_contraction(&to_nodes(&[2, 3, 4]), &to_nodes(&[1, 6, 4]));
        assert_eq!(c, Some(vec![vec![], vec![0, 1], vec![2]]));
        assert_eq!(get_contraction(&to_nodes(&[2, 3, 4]), &to_nodes(&[4, 6])), None);
    }

    #[test]
    fn test_symbolic_view_cannot_be_buried() {
        let n = Node::var("n", 1, 8).unwrap();
        let t = ShapeTracker::from_shape(&[n.clone(), Node::num(4)]).unwrap();
        let p = t.permute(&[1, 0]).unwrap();
        assert!(p.reshape(&[n.times(4)]).is_err());
        assert!(t.reshape(&[n.times(4)]).unwrap().contiguous());
    }

    #[test]
    fn test_expr_node_composes() {
        let t = st(&[2, 3]).permute(&[1, 0]).unwrap().reshape(&to_nodes(&[6])).unwrap();
        let (idx, valid) = t.expr_node(None);
        assert_eq!(valid.as_num(), Some(1));
        let vals: Vec<i64> = (0..6)
            .map(|i| {
                let var = idx.vars()[0].clone();
                idx.eval(&[(var, i)].into_iter().collect()).unwrap()
            })
            .collect();
        assert_eq!(vals, vec![0, 3, 1, 4, 2, 5]);
    }
}
