use std::fmt::Display;

use snafu::ensure;

use crate::{
    error::{InvalidMovementSnafu, Result},
    symbolic::{all_int, as_ints, render_shape, sym_prod, Node, VarVals, Variable},
};

/// A valid range `[lo, hi)` per dimension. Views without a mask are valid everywhere.
pub type Mask = Vec<(i64, i64)>;

/// Zero out the strides of unit dimensions, they never move the index.
pub fn filter_strides(shape: &[Node], strides: &[i64]) -> Vec<i64> {
    shape
        .iter()
        .zip(strides.iter())
        .map(|(s, st)| if *s == 1 { 0 } else { *st })
        .collect()
}

/// Row-major strides for a contiguous buffer of the given shape.
///
/// Strides are integers, so a symbolic dimension is only allowed where no
/// stride depends on it: as the outermost non-unit dimension. Returns `None`
/// otherwise.
pub fn strides_for_shape(shape: &[Node]) -> Option<Vec<i64>> {
    let mut strides = vec![0; shape.len()];
    let mut acc = Some(1);
    for (i, d) in shape.iter().enumerate().rev() {
        if *d == 1 {
            continue;
        }
        strides[i] = acc?;
        acc = match (acc, d.as_num()) {
            (Some(a), Some(n)) => Some(a * n),
            _ => None,
        };
    }
    Some(filter_strides(shape, &strides))
}

/// Merge adjacent dims that stride through memory as one.
pub(crate) fn to_shape_strides(shape: &[Node], strides: &[i64]) -> Vec<(Node, i64)> {
    assert_eq!(shape.len(), strides.len());
    let mut ret: Vec<(Node, i64)> = match shape.first() {
        Some(s) => vec![(s.clone(), strides[0])],
        None => return vec![],
    };
    for i in 1..shape.len() {
        let last = ret.len() - 1;
        let folds = match shape[i].as_num() {
            Some(n) => ret[last].1 == n * strides[i],
            None => false,
        };
        if folds || ret[last].0 == 1 {
            ret[last] = (mul_dims(&ret[last].0, &shape[i]), strides[i]);
        } else if shape[i] == 1 {
            continue;
        } else {
            ret.push((shape[i].clone(), strides[i]));
        }
    }
    ret
}

/// Product of two dims, at most one of them symbolic.
pub(crate) fn mul_dims(a: &Node, b: &Node) -> Node {
    match (a.as_num(), b.as_num()) {
        (Some(x), _) => b.times(x),
        (None, Some(y)) => a.times(y),
        (None, None) => panic!("product of two symbolic dims {a} * {b}"),
    }
}

fn invalid(op: &str, shape: &[Node], reason: impl Into<String>) -> crate::error::Error {
    InvalidMovementSnafu {
        op,
        shape: render_shape(shape),
        reason: reason.into(),
    }
    .build()
}

/// One strided, optionally masked, window onto a flat buffer.
///
/// Strides, offset and mask are concrete. A symbolic dimension can only
/// appear in views without a mask.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct View {
    shape: Vec<Node>,
    strides: Vec<i64>,
    offset: i64,
    mask: Option<Mask>,
    contiguous: bool,
}

impl View {
    /// Build a view, normalizing unit strides and a mask that covers everything.
    pub fn new(shape: Vec<Node>, strides: &[i64], offset: i64, mask: Option<Mask>) -> View {
        assert_eq!(shape.len(), strides.len(), "strides don't match shape");
        let strides = filter_strides(&shape, strides);
        let mask = mask.filter(|m| {
            !m.iter()
                .zip(shape.iter())
                .all(|(&(lo, hi), s)| lo == 0 && *s == hi)
        });
        let contiguous =
            offset == 0 && mask.is_none() && strides_for_shape(&shape).as_ref() == Some(&strides);
        View {
            shape,
            strides,
            offset,
            mask,
            contiguous,
        }
    }

    /// A contiguous row-major view.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` if a symbolic dimension would end up inside a stride.
    pub fn from_shape(shape: Vec<Node>) -> Result<View> {
        ensure!(
            shape.iter().all(|s| s.min() >= 0),
            InvalidMovementSnafu {
                op: "create",
                shape: render_shape(&shape),
                reason: "negative dimension",
            }
        );
        match strides_for_shape(&shape) {
            Some(strides) => Ok(View::new(shape, &strides, 0, None)),
            None => Err(invalid(
                "create",
                &shape,
                "a symbolic dimension must be outermost",
            )),
        }
    }

    pub fn shape(&self) -> &[Node] {
        &self.shape
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn mask(&self) -> Option<&Mask> {
        self.mask.as_ref()
    }

    pub fn contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn vars(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = vec![];
        for v in self.shape.iter().flat_map(Node::vars) {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    #[must_use]
    pub fn substitute(&self, var_vals: &VarVals) -> View {
        let shape = self.shape.iter().map(|s| s.substitute_vals(var_vals)).collect();
        View::new(shape, &self.strides, self.offset, self.mask.clone())
    }

    fn int_shape(&self, op: &str) -> Result<Vec<i64>> {
        as_ints(&self.shape).ok_or_else(|| invalid(op, &self.shape, "not supported on symbolic shapes"))
    }

    // Moves the origin and resizes without checking bounds; the mask keeps
    // out of range elements invalid.
    fn unsafe_resize(&self, arg: &[(i64, i64)], mask: Option<Mask>) -> View {
        let offset = self.offset
            + self
                .strides
                .iter()
                .zip(arg.iter())
                .map(|(st, (b, _))| st * b)
                .sum::<i64>();
        let mask = match &self.mask {
            Some(m) => {
                let nmask: Mask = m
                    .iter()
                    .zip(arg.iter())
                    .map(|(&(mx, my), &(ax, ay))| ((mx - ax).max(0), (my - ax).min(ay - ax)))
                    .collect();
                Some(match mask {
                    Some(given) => given
                        .iter()
                        .zip(nmask.iter())
                        .map(|(&(mx1, my1), &(mx2, my2))| (mx1.max(mx2), my1.min(my2)))
                        .collect(),
                    None => nmask,
                })
            }
            None => mask,
        };
        let shape = arg.iter().map(|(b, e)| Node::num(e - b)).collect();
        View::new(shape, &self.strides, offset, mask)
    }

    /// Pad each dim with `(before, after)` masked out elements.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on a rank mismatch, negative padding, or a symbolic shape.
    pub fn pad(&self, arg: &[(i64, i64)]) -> Result<View> {
        ensure!(
            arg.len() == self.shape.len(),
            InvalidMovementSnafu {
                op: "pad",
                shape: render_shape(&self.shape),
                reason: format!("{} pads for {} dims", arg.len(), self.shape.len()),
            }
        );
        ensure!(
            arg.iter().all(|(b, e)| *b >= 0 && *e >= 0),
            InvalidMovementSnafu {
                op: "pad",
                shape: render_shape(&self.shape),
                reason: format!("negative padding {arg:?}"),
            }
        );
        if arg.iter().all(|p| *p == (0, 0)) {
            return Ok(self.clone());
        }
        let shape = self.int_shape("pad")?;
        let zvarg: Vec<(i64, i64)> = shape.iter().zip(arg).map(|(s, (b, e))| (-b, s + e)).collect();
        let mask: Mask = shape.iter().zip(arg).map(|(s, (b, _))| (*b, s + b)).collect();
        Ok(self.unsafe_resize(&zvarg, Some(mask)))
    }

    /// Keep `[begin, end)` of each dim.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` if a range is out of bounds or the shape is symbolic.
    pub fn shrink(&self, arg: &[(i64, i64)]) -> Result<View> {
        ensure!(
            arg.len() == self.shape.len(),
            InvalidMovementSnafu {
                op: "shrink",
                shape: render_shape(&self.shape),
                reason: format!("{} ranges for {} dims", arg.len(), self.shape.len()),
            }
        );
        let shape = self.int_shape("shrink")?;
        ensure!(
            shape.iter().zip(arg).all(|(s, (b, e))| 0 <= *b && b <= e && e <= s),
            InvalidMovementSnafu {
                op: "shrink",
                shape: render_shape(&self.shape),
                reason: format!("out of bounds {arg:?}"),
            }
        );
        Ok(self.unsafe_resize(arg, None))
    }

    /// Broadcast unit dims to `new_shape`.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` if a non-unit dim changes size.
    pub fn expand(&self, new_shape: &[Node]) -> Result<View> {
        ensure!(
            new_shape.len() == self.shape.len(),
            InvalidMovementSnafu {
                op: "expand",
                shape: render_shape(&self.shape),
                reason: format!("can't expand to {}", render_shape(new_shape)),
            }
        );
        if self.shape.iter().any(|s| *s == 0) {
            return View::from_shape(new_shape.to_vec());
        }
        for ((s, x), st) in self.shape.iter().zip(new_shape).zip(&self.strides) {
            ensure!(
                s == x || (*s == 1 && *st == 0),
                InvalidMovementSnafu {
                    op: "expand",
                    shape: render_shape(&self.shape),
                    reason: format!("can't expand to {}", render_shape(new_shape)),
                }
            );
        }
        let mask = match &self.mask {
            Some(m) => {
                let mut nmask = Vec::with_capacity(m.len());
                for ((&(lo, hi), s), ns) in m.iter().zip(&self.shape).zip(new_shape) {
                    if s == ns {
                        nmask.push((lo, hi));
                    } else if (lo, hi) == (0, 1) {
                        let ns = ns.as_num().ok_or_else(|| {
                            invalid("expand", &self.shape, "masked dim can't become symbolic")
                        })?;
                        nmask.push((0, ns));
                    } else {
                        nmask.push((0, 0));
                    }
                }
                Some(nmask)
            }
            None => None,
        };
        Ok(View::new(new_shape.to_vec(), &self.strides, self.offset, mask))
    }

    /// # Errors
    ///
    /// `InvalidMovement` if `axis` is not a permutation of the dims.
    pub fn permute(&self, axis: &[usize]) -> Result<View> {
        let mut seen = vec![false; self.shape.len()];
        let valid = axis.len() == self.shape.len()
            && axis.iter().all(|&a| a < seen.len() && !std::mem::replace(&mut seen[a], true));
        ensure!(
            valid,
            InvalidMovementSnafu {
                op: "permute",
                shape: render_shape(&self.shape),
                reason: format!("{axis:?} is not a permutation"),
            }
        );
        let shape = axis.iter().map(|&a| self.shape[a].clone()).collect();
        let strides: Vec<i64> = axis.iter().map(|&a| self.strides[a]).collect();
        let mask = self.mask.as_ref().map(|m| axis.iter().map(|&a| m[a]).collect());
        Ok(View::new(shape, &strides, self.offset, mask))
    }

    /// Take every `mul`-th element, walking backwards for negative `mul`.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on a zero multiplier, or a negative one on a symbolic dim.
    pub fn stride(&self, mul: &[i64]) -> Result<View> {
        ensure!(
            mul.len() == self.shape.len() && mul.iter().all(|m| *m != 0),
            InvalidMovementSnafu {
                op: "stride",
                shape: render_shape(&self.shape),
                reason: format!("bad multipliers {mul:?}"),
            }
        );
        let mut offset = self.offset;
        for ((s, z), m) in self.shape.iter().zip(&self.strides).zip(mul) {
            if *m < 0 {
                let s = s
                    .as_num()
                    .ok_or_else(|| invalid("stride", &self.shape, "negative stride on a symbolic dim"))?;
                offset += (s - 1) * z;
            }
        }
        let strides: Vec<i64> = self.strides.iter().zip(mul).map(|(z, m)| z * m).collect();
        let shape: Vec<Node> = self
            .shape
            .iter()
            .zip(mul)
            .map(|(s, m)| (s + (m.abs() - 1)).floordiv(m.abs()))
            .collect();
        let mask = match &self.mask {
            Some(mask) => {
                let shape = self.int_shape("stride")?;
                Some(
                    mask.iter()
                        .zip(shape.iter().zip(mul))
                        .map(|(&(mx, my), (&s, &m))| {
                            let am = m.abs();
                            let lo = if m > 0 { mx } else { s - my };
                            let hi = if m > 0 { my } else { s - mx };
                            ((lo + am - 1).div_euclid(am), (hi + am - 1).div_euclid(am))
                        })
                        .collect(),
                )
            }
            None => None,
        };
        Ok(View::new(shape, &strides, offset, mask))
    }

    /// Reshape in place when possible. `Ok(None)` means a new view is needed on top.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on negative dims or mismatched element counts.
    pub fn reshape(&self, new_shape: &[Node]) -> Result<Option<View>> {
        if self.shape == new_shape {
            return Ok(Some(self.clone()));
        }
        ensure!(
            new_shape.iter().all(|s| s.min() >= 0),
            InvalidMovementSnafu {
                op: "reshape",
                shape: render_shape(&self.shape),
                reason: format!("negative dim in {}", render_shape(new_shape)),
            }
        );
        if self.shape.iter().any(|s| *s == 0) {
            ensure!(
                new_shape.iter().any(|s| *s == 0),
                InvalidMovementSnafu {
                    op: "reshape",
                    shape: render_shape(&self.shape),
                    reason: format!("can't reshape 0 size to {}", render_shape(new_shape)),
                }
            );
            return View::from_shape(new_shape.to_vec()).map(Some);
        }
        if all_int(&self.shape) && all_int(new_shape) {
            ensure!(
                sym_prod(&self.shape) == sym_prod(new_shape),
                InvalidMovementSnafu {
                    op: "reshape",
                    shape: render_shape(&self.shape),
                    reason: format!("size mismatch with {}", render_shape(new_shape)),
                }
            );
        }
        if self.contiguous {
            return View::from_shape(new_shape.to_vec()).map(Some);
        }

        // only adding or removing 1s
        let old_dims: Vec<&Node> = self.shape.iter().filter(|x| **x != 1).collect();
        let new_dims: Vec<&Node> = new_shape.iter().filter(|x| **x != 1).collect();
        if old_dims == new_dims {
            let mut kept = self
                .shape
                .iter()
                .zip(&self.strides)
                .filter(|(x, _)| **x != 1)
                .map(|(_, st)| *st);
            let strides: Vec<i64> = new_shape
                .iter()
                .map(|x| if *x == 1 { 0 } else { kept.next().unwrap_or(0) })
                .collect();
            let mask = self.mask.as_ref().map(|m| {
                let unit_masked = self
                    .shape
                    .iter()
                    .zip(m)
                    .any(|(x, y)| *x == 1 && *y != (0, 1));
                if unit_masked {
                    vec![(0, 0); new_shape.len()]
                } else {
                    let mut kept = self
                        .shape
                        .iter()
                        .zip(m)
                        .filter(|(x, _)| **x != 1)
                        .map(|(_, y)| *y);
                    new_shape
                        .iter()
                        .map(|x| if *x == 1 { (0, 1) } else { kept.next().unwrap_or((0, 0)) })
                        .collect()
                }
            });
            return Ok(Some(View::new(new_shape.to_vec(), &strides, self.offset, mask)));
        }
        Ok(None)
    }

    /// Flat index for one index node per dimension.
    pub fn expr_idxs(&self, idxs: &[Node]) -> Node {
        assert_eq!(idxs.len(), self.shape.len(), "need an idx for all dimensions");
        let mut terms = vec![Node::num(self.offset)];
        for ((idx, sh), st) in idxs.iter().zip(&self.shape).zip(&self.strides) {
            if *sh != 1 && *st != 0 {
                terms.push(idx.times(*st));
            }
        }
        Node::sum(terms)
    }

    /// Flat index for a single row-major index into this view's shape.
    pub fn expr_node(&self, idx: Option<&Node>) -> Node {
        let default;
        let idx = match idx {
            Some(idx) => idx,
            None => {
                default = Node::loop_var("idx", 0, sym_prod(&self.shape).max() - 1);
                &default
            }
        };
        let mut terms = vec![];
        if self.offset != 0 {
            terms.push(Node::num(self.offset));
        }
        let merged = to_shape_strides(&self.shape, &self.strides);
        let mut acc = 1;
        for (i, (d, s)) in merged.iter().enumerate().rev() {
            let part = idx.floordiv(acc);
            let part = match d.as_num() {
                Some(d) => part.modulo(d),
                None => {
                    assert!(i == 0, "symbolic dim {d} is not outermost");
                    part
                }
            };
            terms.push(part.times(*s));
            if i > 0 {
                acc *= d.as_num().unwrap_or(1);
            }
        }
        Node::sum(terms)
    }

    /// Validity of a single row-major index, and-ed onto `valid`.
    pub fn expr_node_mask(&self, idx: &Node, valid: Option<Node>) -> Node {
        let mut expr: Vec<Node> = valid.into_iter().collect();
        if let Some(mask) = &self.mask {
            let mut acc = 1;
            for (ns, &(x, y)) in self.shape.iter().zip(mask).rev() {
                let ns = match ns.as_num() {
                    Some(n) => n,
                    None => panic!("masked view with symbolic dim {ns}"),
                };
                if x != 0 || y != ns {
                    let base = idx.floordiv(acc).modulo(ns);
                    expr.push(base.ge(x));
                    expr.push(base.lt(y));
                }
                acc *= ns;
            }
        }
        Node::ands(expr)
    }

    /// Validity for one index node per dimension.
    pub(crate) fn expr_idxs_mask(&self, idxs: &[Node]) -> Node {
        self.expr_node_mask(&idxs_to_idx(&self.shape, idxs), None)
    }

    // Numeric mask check for a multi-index.
    pub(crate) fn is_valid(&self, idx: &[i64]) -> bool {
        match &self.mask {
            Some(m) => idx.iter().zip(m).all(|(i, (lo, hi))| lo <= i && i < hi),
            None => true,
        }
    }

    pub(crate) fn flat_offset(&self, idx: &[i64]) -> i64 {
        self.offset + idx.iter().zip(&self.strides).map(|(i, st)| i * st).sum::<i64>()
    }
}

/// Row-major flat index of a multi-index.
pub(crate) fn idxs_to_idx(shape: &[Node], idxs: &[Node]) -> Node {
    assert_eq!(idxs.len(), shape.len(), "need an idx for all dimensions");
    let mut acc = 1;
    let mut terms = vec![];
    for (tidx, d) in idxs.iter().zip(shape).rev() {
        terms.push(tidx.times(acc));
        acc *= d.as_num().unwrap_or(1);
    }
    Node::sum(terms)
}

impl Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "View(shape={}, strides={:?}, offset={}, mask={:?}, contiguous={})",
            render_shape(&self.shape),
            self.strides,
            self.offset,
            self.mask,
            self.contiguous
        )
    }
}
