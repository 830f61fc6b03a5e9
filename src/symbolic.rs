use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock},
};

use snafu::ensure;

use crate::{
    error::{InvalidVariableSnafu, Result},
    math_macros::{impl_bin_op, impl_un_op},
};

/// Values bound to symbolic variables.
pub type VarVals = BTreeMap<Variable, i64>;

/// A named integer in `[min, max]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    name: Arc<str>,
    min: i64,
    max: i64,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

impl Variable {
    /// A user-facing variable. Ranges must be non-negative and non-empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidVariable` if the name is not an identifier, `min < 0` or `min >= max`.
    pub fn new(name: &str, min: i64, max: i64) -> Result<Variable> {
        ensure!(
            is_identifier(name),
            InvalidVariableSnafu {
                name,
                min,
                max,
                reason: "name is not a valid identifier",
            }
        );
        ensure!(
            min >= 0,
            InvalidVariableSnafu {
                name,
                min,
                max,
                reason: "min must be non-negative",
            }
        );
        ensure!(
            min < max,
            InvalidVariableSnafu {
                name,
                min,
                max,
                reason: "min must be less than max",
            }
        );
        Ok(Variable {
            name: name.into(),
            min,
            max,
        })
    }

    /// Loop and index variables created by the compiler. An empty name
    /// marks an anonymous variable that `Node::expand` picks by default.
    pub(crate) fn loop_var(name: &str, min: i64, max: i64) -> Variable {
        assert!(min <= max, "bad range for {name}: [{min}, {max}]");
        Variable {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vmin(&self) -> i64 {
        self.min
    }

    pub fn vmax(&self) -> i64 {
        self.max
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    pub fn node(&self) -> Node {
        Node::from(self.clone())
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}-{}]", self.name, self.min, self.max)
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Num(i64),
    Var(Variable),
    Mul(Node, i64),
    Div(Node, i64),
    Mod(Node, i64),
    Lt(Node, i64),
    Sum(Vec<Node>),
    And(Vec<Node>),
}

struct Inner {
    kind: NodeKind,
    min: i64,
    max: i64,
    key: OnceLock<String>,
}

/// An integer expression over bounded variables.
///
/// Constructors and arithmetic always return simplified nodes. Two nodes are
/// equal when their canonical keys are equal.
#[derive(Clone)]
pub struct Node(Arc<Inner>);

/// Floor division, rounding toward negative infinity.
pub fn floordiv(a: i64, b: i64) -> i64 {
    let (q, r) = (a / b, a % b);
    if r != 0 && ((r < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Modulo with the sign of the divisor.
pub fn pymod(a: i64, b: i64) -> i64 {
    a - b * floordiv(a, b)
}

pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl Node {
    fn raw(kind: NodeKind, min: i64, max: i64) -> Node {
        Node(Arc::new(Inner {
            kind,
            min,
            max,
            key: OnceLock::new(),
        }))
    }

    fn create(kind: NodeKind, min: i64, max: i64) -> Node {
        assert!(min <= max, "min greater than max! {min} {max} when creating {kind:?}");
        if min == max {
            Node::num(min)
        } else {
            Node::raw(kind, min, max)
        }
    }

    pub fn num(n: i64) -> Node {
        Node::raw(NodeKind::Num(n), n, n)
    }

    /// # Errors
    ///
    /// See [`Variable::new`].
    pub fn var(name: &str, min: i64, max: i64) -> Result<Node> {
        Ok(Variable::new(name, min, max)?.node())
    }

    pub(crate) fn loop_var(name: &str, min: i64, max: i64) -> Node {
        Variable::loop_var(name, min, max).node()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn min(&self) -> i64 {
        self.0.min
    }

    pub fn max(&self) -> i64 {
        self.0.max
    }

    pub fn as_num(&self) -> Option<i64> {
        match self.kind() {
            NodeKind::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_num(&self) -> bool {
        self.as_num().is_some()
    }

    pub fn as_var(&self) -> Option<&Variable> {
        match self.kind() {
            NodeKind::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Canonical debug rendering, the basis of equality and hashing.
    pub fn canonical_key(&self) -> &str {
        self.0.key.get_or_init(|| self.render_with(&DebugRenderer))
    }

    pub fn render(&self) -> String {
        self.render_with(&PlainRenderer)
    }

    pub fn render_with(&self, r: &dyn NodeRenderer) -> String {
        match self.kind() {
            NodeKind::Num(n) => r.num(*n),
            NodeKind::Var(v) => r.variable(v),
            NodeKind::Mul(a, b) => r.mul(&a.render_with(r), *b),
            NodeKind::Div(a, b) => r.div(&a.render_with(r), *b),
            NodeKind::Mod(a, b) => r.modulo(&a.render_with(r), *b),
            NodeKind::Lt(a, b) => r.lt(&a.render_with(r), *b),
            NodeKind::Sum(nodes) => r.sum(nodes.iter().map(|x| x.render_with(r)).collect()),
            NodeKind::And(nodes) => r.and(nodes.iter().map(|x| x.render_with(r)).collect()),
        }
    }

    /// All variables in order of first appearance.
    pub fn vars(&self) -> Vec<Variable> {
        fn walk(n: &Node, out: &mut Vec<Variable>) {
            match n.kind() {
                NodeKind::Num(_) => {}
                NodeKind::Var(v) => {
                    if !out.contains(v) {
                        out.push(v.clone());
                    }
                }
                NodeKind::Mul(a, _)
                | NodeKind::Div(a, _)
                | NodeKind::Mod(a, _)
                | NodeKind::Lt(a, _) => walk(a, out),
                NodeKind::Sum(nodes) | NodeKind::And(nodes) => {
                    nodes.iter().for_each(|x| walk(x, out));
                }
            }
        }
        let mut out = vec![];
        walk(self, &mut out);
        out
    }

    #[must_use]
    pub fn negate(&self) -> Node {
        self.times(-1)
    }

    #[must_use]
    pub fn plus(&self, b: &Node) -> Node {
        Node::sum(vec![self.clone(), b.clone()])
    }

    #[must_use]
    pub fn minus(&self, b: &Node) -> Node {
        self.plus(&b.negate())
    }

    #[must_use]
    pub fn times(&self, b: i64) -> Node {
        if b == 0 {
            return Node::num(0);
        }
        if b == 1 {
            return self.clone();
        }
        match self.kind() {
            NodeKind::Num(n) => Node::num(n * b),
            NodeKind::Mul(a, c) => a.times(c * b),
            NodeKind::Sum(nodes) => Node::sum(nodes.iter().map(|x| x.times(b)).collect()),
            _ => {
                let (lo, hi) = if b >= 0 {
                    (self.min() * b, self.max() * b)
                } else {
                    (self.max() * b, self.min() * b)
                };
                Node::create(NodeKind::Mul(self.clone(), b), lo, hi)
            }
        }
    }

    /// Floor division by a non-zero constant.
    #[must_use]
    pub fn floordiv(&self, b: i64) -> Node {
        self.floordiv_with(b, true)
    }

    fn floordiv_with(&self, b: i64, factoring_allowed: bool) -> Node {
        assert!(b != 0, "division by zero: {self}");
        match self.kind() {
            NodeKind::Num(n) => Node::num(floordiv(*n, b)),
            NodeKind::Mul(a, c) => {
                if pymod(*c, b) == 0 {
                    a.times(floordiv(*c, b))
                } else if pymod(b, *c) == 0 && *c > 0 {
                    a.floordiv(floordiv(b, *c))
                } else {
                    self.generic_floordiv(b)
                }
            }
            // two divs is one div
            NodeKind::Div(a, c) => a.floordiv(c * b),
            NodeKind::Mod(a, c) => {
                if pymod(*c, b) == 0 {
                    a.floordiv(b).modulo(floordiv(*c, b))
                } else {
                    self.generic_floordiv(b)
                }
            }
            NodeKind::Lt(a, c) => a.floordiv(b).lt(floordiv(*c, b)),
            NodeKind::And(nodes) => Node::ands(nodes.iter().map(|x| x.floordiv(b)).collect()),
            NodeKind::Sum(_) => self.sum_floordiv(b, factoring_allowed),
            NodeKind::Var(_) => self.generic_floordiv(b),
        }
    }

    fn generic_floordiv(&self, b: i64) -> Node {
        if b < 0 {
            return self.floordiv(-b).times(-1);
        }
        if b == 1 {
            return self.clone();
        }
        // the numerator of div is not allowed to be negative
        if self.min() < 0 {
            let offset = floordiv(self.min(), b);
            return self
                .plus(&Node::num(-offset * b))
                .floordiv_with(b, false)
                .plus(&Node::num(offset));
        }
        Node::create(
            NodeKind::Div(self.clone(), b),
            floordiv(self.min(), b),
            floordiv(self.max(), b),
        )
    }

    fn sum_floordiv(&self, b: i64, factoring_allowed: bool) -> Node {
        if b < 0 || !factoring_allowed {
            return self.generic_floordiv(b);
        }
        if b == 1 {
            return self.clone();
        }
        let mut fully_divided = vec![];
        let mut rest = vec![];
        let mut g = b;
        let mut divisor = 1;
        for x in self.flat_components() {
            match x.kind() {
                NodeKind::Num(c) | NodeKind::Mul(_, c) => {
                    if pymod(*c, b) == 0 {
                        fully_divided.push(x.floordiv(b));
                    } else {
                        g = gcd(g, *c);
                        if matches!(x.kind(), NodeKind::Mul(..)) && divisor == 1 && pymod(b, *c) == 0
                        {
                            divisor = *c;
                        }
                        rest.push(x);
                    }
                }
                _ => {
                    rest.push(x);
                    g = 1;
                }
            }
        }
        let divided = Node::sum(fully_divided);
        if g > 1 {
            return divided.plus(&Node::sum(rest).floordiv(g).floordiv(b / g));
        }
        if divisor > 1 {
            return divided.plus(&Node::sum(rest).floordiv(divisor).floordiv(b / divisor));
        }
        divided.plus(&Node::sum(rest).generic_floordiv(b))
    }

    /// Modulo by a positive constant.
    #[must_use]
    pub fn modulo(&self, b: i64) -> Node {
        assert!(b > 0, "modulo by non-positive {b}: {self}");
        match self.kind() {
            NodeKind::Mul(a, c) => a.times(pymod(*c, b)).generic_mod(b),
            NodeKind::Mod(a, c) if gcd(*c, b) == b => a.modulo(b),
            NodeKind::Sum(nodes) => {
                let new_nodes = nodes
                    .iter()
                    .map(|x| match x.kind() {
                        NodeKind::Num(n) => Node::num(pymod(*n, b)),
                        NodeKind::Mul(a, c) => a.times(pymod(*c, b)),
                        _ => x.clone(),
                    })
                    .collect();
                Node::sum(new_nodes).generic_mod(b)
            }
            _ => self.generic_mod(b),
        }
    }

    fn generic_mod(&self, b: i64) -> Node {
        if b == 1 {
            return Node::num(0);
        }
        if self.min() >= 0 && self.max() < b {
            return self.clone();
        }
        if floordiv(self.min(), b) == floordiv(self.max(), b) {
            return self.minus(&Node::num(b * floordiv(self.min(), b)));
        }
        if self.min() < 0 {
            return self
                .minus(&Node::num(floordiv(self.min(), b) * b))
                .modulo(b);
        }
        let (lo, hi) = (self.min(), self.max());
        let (bmin, bmax) = if hi - lo >= b || pymod(lo, b) >= pymod(hi, b) {
            (0, b - 1)
        } else {
            (pymod(lo, b), pymod(hi, b))
        };
        Node::create(NodeKind::Mod(self.clone(), b), bmin, bmax)
    }

    /// `self < b` as a 0/1 node.
    #[must_use]
    pub fn lt(&self, b: i64) -> Node {
        match self.kind() {
            NodeKind::Mul(a, c) if *c != -1 => {
                let sgn = c.signum();
                a.times(sgn).generic_lt(floordiv(b + c.abs() - 1, c.abs()))
            }
            NodeKind::Sum(nodes) => {
                let mut b = b;
                let mut new_sum = vec![];
                for x in nodes {
                    match x.kind() {
                        NodeKind::Num(n) => b -= *n,
                        _ => new_sum.push(x.clone()),
                    }
                }
                let lhs = Node::sum(new_sum);
                let parts = match lhs.kind() {
                    NodeKind::Sum(nodes) => nodes.clone(),
                    _ => vec![lhs.clone()],
                };
                let (muls, others): (Vec<Node>, Vec<Node>) = parts.into_iter().partition(|x| {
                    matches!(x.kind(), NodeKind::Mul(_, c) if *c > 0) && x.max() >= b
                });
                if !muls.is_empty() {
                    let mul_gcd = muls.iter().fold(b, |g, x| match x.kind() {
                        NodeKind::Mul(_, c) => gcd(g, *c),
                        _ => g,
                    });
                    let all_others = Node::sum(others);
                    if all_others.min() >= 0 && all_others.max() < mul_gcd {
                        return Node::sum(muls.iter().map(|m| m.floordiv(mul_gcd)).collect())
                            .generic_lt(floordiv(b, mul_gcd));
                    }
                }
                lhs.generic_lt(b)
            }
            _ => self.generic_lt(b),
        }
    }

    fn generic_lt(&self, b: i64) -> Node {
        let (lo, hi) = if self.max() < b {
            (1, 1)
        } else if self.min() >= b {
            (0, 0)
        } else {
            (0, 1)
        };
        Node::create(NodeKind::Lt(self.clone(), b), lo, hi)
    }

    #[must_use]
    pub fn le(&self, b: i64) -> Node {
        self.lt(b + 1)
    }

    #[must_use]
    pub fn gt(&self, b: i64) -> Node {
        self.negate().lt(-b)
    }

    #[must_use]
    pub fn ge(&self, b: i64) -> Node {
        self.negate().lt(-b + 1)
    }

    fn flat_components(&self) -> Vec<Node> {
        match self.kind() {
            NodeKind::Sum(nodes) => nodes.iter().flat_map(Node::flat_components).collect(),
            _ => vec![self.clone()],
        }
    }

    fn mul_parts(&self) -> (Node, i64) {
        match self.kind() {
            NodeKind::Mul(a, b) => (a.clone(), *b),
            _ => (self.clone(), 1),
        }
    }

    fn factorize(nodes: Vec<Node>) -> Vec<Node> {
        let mut groups: Vec<(Node, i64)> = vec![];
        for x in nodes {
            let (a, b) = x.mul_parts();
            match groups.iter_mut().find(|(g, _)| *g == a) {
                Some((_, sum)) => *sum += b,
                None => groups.push((a, b)),
            }
        }
        groups
            .into_iter()
            .filter(|(_, b)| *b != 0)
            .map(|(a, b)| a.times(b))
            .collect()
    }

    /// Sum of nodes, flattened and with constants folded and like terms merged.
    pub fn sum(nodes: Vec<Node>) -> Node {
        let nodes: Vec<Node> = nodes
            .into_iter()
            .filter(|x| x.min() != 0 || x.max() != 0)
            .collect();
        if nodes.len() <= 1 {
            return nodes.into_iter().next().unwrap_or_else(|| Node::num(0));
        }

        let mut new_nodes = vec![];
        let mut num_sum = 0;
        for node in nodes.iter().flat_map(Node::flat_components) {
            match node.kind() {
                NodeKind::Num(n) => num_sum += n,
                _ => new_nodes.push(node),
            }
        }

        if new_nodes.len() > 1 {
            let mut bases: Vec<Node> = new_nodes.iter().map(|x| x.mul_parts().0).collect();
            bases.sort_by(|a, b| a.canonical_key().cmp(b.canonical_key()));
            bases.dedup();
            if bases.len() < new_nodes.len() {
                new_nodes = Node::factorize(new_nodes);
            }
        }
        if num_sum != 0 {
            new_nodes.push(Node::num(num_sum));
        }
        match new_nodes.len() {
            0 => Node::num(0),
            1 => new_nodes.remove(0),
            _ => {
                let lo = new_nodes.iter().map(Node::min).sum();
                let hi = new_nodes.iter().map(Node::max).sum();
                Node::create(NodeKind::Sum(new_nodes), lo, hi)
            }
        }
    }

    /// Logical and of 0/1 nodes.
    pub fn ands(nodes: Vec<Node>) -> Node {
        if nodes.len() <= 1 {
            return nodes.into_iter().next().unwrap_or_else(|| Node::num(1));
        }
        if nodes.iter().any(|x| x.as_num() == Some(0)) {
            return Node::num(0);
        }
        let mut flat = vec![];
        for x in nodes {
            match x.kind() {
                NodeKind::And(inner) => flat.extend(inner.iter().cloned()),
                _ => flat.push(x),
            }
        }
        // filter 1s
        let mut nodes: Vec<Node> = flat.into_iter().filter(|x| x.min() != x.max()).collect();
        match nodes.len() {
            0 => Node::num(1),
            1 => nodes.remove(0),
            _ => {
                let lo = nodes.iter().map(Node::min).min().unwrap_or(1);
                let hi = nodes.iter().map(Node::max).max().unwrap_or(1);
                Node::create(NodeKind::And(nodes), lo, hi)
            }
        }
    }

    /// Replace variables and resimplify.
    #[must_use]
    pub fn substitute(&self, var_vals: &BTreeMap<Variable, Node>) -> Node {
        match self.kind() {
            NodeKind::Num(_) => self.clone(),
            NodeKind::Var(v) => var_vals.get(v).cloned().unwrap_or_else(|| self.clone()),
            NodeKind::Mul(a, b) => a.substitute(var_vals).times(*b),
            NodeKind::Div(a, b) => a.substitute(var_vals).floordiv(*b),
            NodeKind::Mod(a, b) => a.substitute(var_vals).modulo(*b),
            NodeKind::Lt(a, b) => a.substitute(var_vals).lt(*b),
            NodeKind::Sum(nodes) => Node::sum(nodes.iter().map(|x| x.substitute(var_vals)).collect()),
            NodeKind::And(nodes) => {
                let mut subed = vec![];
                for node in nodes {
                    let sub = node.substitute(var_vals);
                    if sub.as_num() == Some(0) {
                        return Node::num(0);
                    }
                    subed.push(sub);
                }
                Node::ands(subed)
            }
        }
    }

    /// Substitute bound integer values.
    #[must_use]
    pub fn substitute_vals(&self, var_vals: &VarVals) -> Node {
        let map = var_vals
            .iter()
            .map(|(k, v)| (k.clone(), Node::num(*v)))
            .collect();
        self.substitute(&map)
    }

    /// Concrete value under the given bindings, `None` if a variable is unbound.
    pub fn eval(&self, var_vals: &VarVals) -> Option<i64> {
        Some(match self.kind() {
            NodeKind::Num(n) => *n,
            NodeKind::Var(v) => *var_vals.get(v)?,
            NodeKind::Mul(a, b) => a.eval(var_vals)? * b,
            NodeKind::Div(a, b) => floordiv(a.eval(var_vals)?, *b),
            NodeKind::Mod(a, b) => pymod(a.eval(var_vals)?, *b),
            NodeKind::Lt(a, b) => i64::from(a.eval(var_vals)? < *b),
            NodeKind::Sum(nodes) => {
                let mut total = 0;
                for x in nodes {
                    total += x.eval(var_vals)?;
                }
                total
            }
            NodeKind::And(nodes) => {
                let mut all = true;
                for x in nodes {
                    all &= x.eval(var_vals)? != 0;
                }
                i64::from(all)
            }
        })
    }

    /// The variable `expand` uses when none are given.
    pub fn expand_idx(&self) -> Option<Variable> {
        self.vars().into_iter().find(Variable::is_anonymous)
    }

    /// Enumerate this node over every value of `idxs`, earlier variables
    /// incrementing fastest.
    pub fn expand(&self, idxs: &[Variable]) -> Vec<Node> {
        let ranges: Vec<(i64, i64)> = idxs.iter().map(|v| (v.min, v.max)).collect();
        iter_idxs(&ranges)
            .into_iter()
            .map(|rep| {
                let map = idxs
                    .iter()
                    .cloned()
                    .zip(rep.into_iter().map(Node::num))
                    .collect();
                self.substitute(&map)
            })
            .collect()
    }

    /// `expand` over the first anonymous variable, or just `[self]`.
    pub fn expand_default(&self) -> Vec<Node> {
        match self.expand_idx() {
            Some(v) => self.expand(&[v]),
            None => vec![self.clone()],
        }
    }
}

/// Every combination of values in the given inclusive ranges, first range fastest.
pub fn iter_idxs(ranges: &[(i64, i64)]) -> Vec<Vec<i64>> {
    let mut out = vec![vec![]];
    for &(lo, hi) in ranges.iter().rev() {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                (lo..=hi).map(move |x| {
                    let mut p = prefix.clone();
                    p.push(x);
                    p
                })
            })
            .collect();
    }
    for x in &mut out {
        x.reverse();
    }
    out
}

/// Evaluate a node with all its variables bound.
pub fn sym_infer(node: &Node, var_vals: &VarVals) -> Option<i64> {
    node.eval(var_vals)
}

pub fn all_int(shape: &[Node]) -> bool {
    shape.iter().all(Node::is_num)
}

/// Product of a shape. At most one dimension may be symbolic.
pub fn sym_prod(shape: &[Node]) -> Node {
    let mut ints = 1;
    let mut sym: Option<Node> = None;
    for s in shape {
        match s.as_num() {
            Some(n) => ints *= n,
            None => {
                assert!(sym.is_none(), "more than one symbolic dim in {shape:?}");
                sym = Some(s.clone());
            }
        }
    }
    match sym {
        Some(s) => s.times(ints),
        None => Node::num(ints),
    }
}

pub fn to_nodes(shape: &[i64]) -> Vec<Node> {
    shape.iter().copied().map(Node::num).collect()
}

/// Concrete shape, `None` if any dimension is symbolic.
pub fn as_ints(shape: &[Node]) -> Option<Vec<i64>> {
    shape.iter().map(Node::as_num).collect()
}

pub fn render_shape(shape: &[Node]) -> String {
    let dims: Vec<String> = shape.iter().map(Node::render).collect();
    format!("({})", dims.join(", "))
}

impl From<i64> for Node {
    fn from(n: i64) -> Node {
        Node::num(n)
    }
}

impl From<Variable> for Node {
    fn from(v: Variable) -> Node {
        if v.min == v.max {
            Node::num(v.min)
        } else {
            let (min, max) = (v.min, v.max);
            Node::raw(NodeKind::Var(v), min, max)
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.canonical_key() == other.canonical_key()
    }
}

impl Eq for Node {}

impl PartialEq<i64> for Node {
    fn eq(&self, other: &i64) -> bool {
        self.as_num() == Some(*other)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_key().hash(state);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.canonical_key())
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl_bin_op!(Add, add, Node, Node, |a, b| a.plus(b));
impl_bin_op!(Add, add, Node, i64, |a, b| a.plus(&Node::num(*b)));
impl_bin_op!(Sub, sub, Node, Node, |a, b| a.minus(b));
impl_bin_op!(Sub, sub, Node, i64, |a, b| a.plus(&Node::num(-*b)));
impl_bin_op!(Mul, mul, Node, i64, |a, b| a.times(*b));
impl_bin_op!(Div, div, Node, i64, |a, b| a.floordiv(*b));
impl_bin_op!(Rem, rem, Node, i64, |a, b| a.modulo(*b));
impl_un_op!(Neg, neg, Node, |a| a.negate());

/// Renders nodes to text. The defaults give the canonical form; code
/// generators override the operators they spell differently.
pub trait NodeRenderer {
    fn variable(&self, v: &Variable) -> String {
        v.name().to_string()
    }

    fn num(&self, n: i64) -> String {
        n.to_string()
    }

    fn mul(&self, a: &str, b: i64) -> String {
        format!("({a}*{b})")
    }

    fn div(&self, a: &str, b: i64) -> String {
        format!("({a}//{b})")
    }

    fn modulo(&self, a: &str, b: i64) -> String {
        format!("({a}%{b})")
    }

    fn lt(&self, a: &str, b: i64) -> String {
        format!("({a}<{b})")
    }

    fn sum(&self, mut parts: Vec<String>) -> String {
        parts.sort();
        format!("({})", parts.join("+"))
    }

    fn and(&self, mut parts: Vec<String>) -> String {
        parts.sort();
        format!("({})", parts.join(" and "))
    }
}

pub struct PlainRenderer;

impl NodeRenderer for PlainRenderer {}

struct DebugRenderer;

impl NodeRenderer for DebugRenderer {
    fn variable(&self, v: &Variable) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, min: i64, max: i64) -> Node {
        Node::var(name, min, max).unwrap()
    }

    fn check(n: &Node, min: i64, max: i64, s: &str) {
        assert_eq!(n.render(), s);
        assert_eq!(n.min(), min, "min of {s}");
        assert_eq!(n.max(), max, "max of {s}");
    }

    #[test]
    fn test_variable_bounds() {
        let a = Variable::new("a", 1, 8).unwrap();
        let b = Variable::new("b", 2, 4).unwrap();
        assert_eq!((a.vmin(), a.vmax()), (1, 8));
        let lo = a.clone().min(b.clone());
        assert_eq!(lo.name(), "a");
        assert_eq!(a.node().max(), a.vmax());
        assert_eq!(b.node().min(), b.vmin());
    }

    #[test]
    fn test_floordiv_pymod() {
        assert_eq!(floordiv(-7, 2), -4);
        assert_eq!(floordiv(7, -2), -4);
        assert_eq!(floordiv(7, 2), 3);
        assert_eq!(pymod(-7, 3), 2);
        assert_eq!(pymod(7, -3), -2);
        assert_eq!(gcd(-12, 18), 6);
        assert_eq!(gcd(0, 5), 5);
    }

    #[test]
    fn test_invalid_variables() {
        assert!(Node::var("a", 3, 3).is_err());
        assert!(Node::var("a", 5, 3).is_err());
        assert!(Node::var("a", -1, 3).is_err());
        assert!(Node::var("1a", 0, 3).is_err());
        assert!(Node::var("", 0, 3).is_err());
        assert!(Node::var("a b", 0, 3).is_err());
        assert!(Node::var("_ok9", 0, 3).is_ok());
    }

    #[test]
    fn test_loop_var_becomes_num() {
        check(&Node::loop_var("a", 2, 2), 2, 2, "2");
    }

    #[test]
    fn test_ge() {
        check(&var("a", 3, 8).ge(77), 0, 0, "0");
        check(&var("a", 3, 8).ge(9), 0, 0, "0");
        check(&var("a", 3, 8).ge(8), 0, 1, "((a*-1)<-7)");
        check(&var("a", 3, 8).ge(4), 0, 1, "((a*-1)<-3)");
        check(&var("a", 3, 8).ge(3), 1, 1, "1");
        check(&var("a", 3, 8).ge(2), 1, 1, "1");
    }

    #[test]
    fn test_lt() {
        check(&var("a", 3, 8).lt(77), 1, 1, "1");
        check(&var("a", 3, 8).lt(9), 1, 1, "1");
        check(&var("a", 3, 8).lt(8), 0, 1, "(a<8)");
        check(&var("a", 3, 8).lt(4), 0, 1, "(a<4)");
        check(&var("a", 3, 8).lt(3), 0, 0, "0");
        check(&var("a", 3, 8).lt(2), 0, 0, "0");
    }

    #[test]
    fn test_mul_lt() {
        check(&(var("a", 0, 5) * 4).lt(13), 0, 1, "(a<4)");
        check(&(var("a", 0, 5) * 4).lt(16), 0, 1, "(a<4)");
        check(&(var("a", 0, 5) * 4).gt(11), 0, 1, "((a*-1)<-2)");
    }

    #[test]
    fn test_ge_divides() {
        let expr = (var("idx", 0, 511) * 4 + var("FLOAT4_INDEX", 0, 3)).lt(512);
        check(&expr, 0, 1, "(idx<128)");
    }

    #[test]
    fn test_ge_divides_and() {
        let expr = Node::ands(vec![
            (var("idx1", 0, 511) * 4 + var("FLOAT4_INDEX", 0, 3)).lt(512),
            (var("idx2", 0, 511) * 4 + var("FLOAT4_INDEX", 0, 3)).lt(512),
        ]);
        check(&expr, 0, 1, "((idx1<128) and (idx2<128))");
        let expr = Node::ands(vec![
            (var("idx1", 0, 511) * 4 + var("FLOAT4_INDEX", 0, 3)).lt(512),
            (var("idx2", 0, 511) * 4 + var("FLOAT8_INDEX", 0, 7)).lt(512),
        ]);
        check(
            &(expr / 4),
            0,
            1,
            "((((FLOAT8_INDEX//4)+idx2)<128) and ((idx1//4)<32))",
        );
    }

    #[test]
    fn test_lt_factors() {
        let expr = Node::ands(vec![
            (var("idx1", 0, 511) * 4 + var("FLOAT4_INDEX", 0, 256)).lt(512)
        ]);
        check(&expr, 0, 1, "(((idx1*4)+FLOAT4_INDEX)<512)");
    }

    #[test]
    fn test_div_becomes_num() {
        check(&(var("a", 2, 3) / 2), 1, 1, "1");
    }

    #[test]
    fn test_equality() {
        let a = var("a", 0, 8);
        assert_eq!(&a * 2, &a * 2);
        assert_ne!(&a * 2, &a * 3);
        assert_ne!(var("a", 0, 8), var("a", 0, 9));
        assert_eq!(Node::num(3), 3);
    }

    #[test]
    fn test_factorize() {
        let a = var("a", 0, 8);
        check(&Node::sum(vec![&a * 2, &a * 3]), 0, 40, "(a*5)");
        check(&Node::sum(vec![a.clone(), &a * 3]), 0, 32, "(a*4)");
    }

    #[test]
    fn test_neg_add_sub() {
        let a = var("a", 0, 8);
        check(&-&a, -8, 0, "(a*-1)");
        check(&(&a + 1), 1, 9, "(1+a)");
        check(&(&a + Node::num(1)), 1, 9, "(1+a)");
        check(&(&a - 1), -1, 7, "(-1+a)");
        check(&(&a - Node::num(1)), -1, 7, "(-1+a)");
    }

    #[test]
    fn test_mul_identities() {
        let a = var("a", 0, 8);
        check(&(&a * 0), 0, 0, "0");
        check(&(&a * 1), 0, 8, "a");
        check(&(&a * 2), 0, 16, "(a*2)");
        check(&(&a / 1), 0, 8, "a");
        check(&(&a % 1), 0, 0, "0");
    }

    #[test]
    fn test_mul_neg_1() {
        check(&((var("a", 0, 2) * -1) / 3), -1, 0, "((((a*-1)+3)//3)+-1)");
    }

    #[test]
    fn test_add_min_max() {
        check(&(var("a", 0, 8) * 2 + 12), 12, 28, "((a*2)+12)");
    }

    #[test]
    fn test_div_min_max() {
        check(&(var("a", 0, 7) / 2), 0, 3, "(a//2)");
        check(&(var("a", 0, 7) / -2), -3, 0, "((a//2)*-1)");
    }

    #[test]
    fn test_sum_div() {
        let (a, b) = (var("a", 0, 7), var("b", 0, 3));
        check(&(Node::sum(vec![a.clone(), b.clone()]) / 20), 0, 0, "0");
        check(&(Node::sum(vec![a.clone(), b.clone()]) / 2), 0, 5, "((a+b)//2)");
        check(&(Node::sum(vec![&a * 4, &b * 4]) / 2), 0, 20, "((a*2)+(b*2))");
        check(&(Node::sum(vec![&a * 5, &b * 4]) / 2), 0, 23, "(((a*5)//2)+(b*2))");
        check(&(Node::sum(vec![&a * 5, &b * 5]) / 2), 0, 25, "(((a*5)+(b*5))//2)");
    }

    #[test]
    fn test_sum_div_some_partial_factor() {
        let (a, b) = (var("a", 0, 7), var("b", 0, 7));
        check(&(Node::sum(vec![&a * 6, &b * 6]) / 16), 0, 5, "(((a*3)+(b*3))//8)");
        check(
            &(Node::sum(vec![Node::num(16), &a * 6, &b * 6]) / 16),
            1,
            6,
            "((((a*3)+(b*3))//8)+1)",
        );
    }

    #[test]
    fn test_sum_div_const() {
        let a = var("a", 0, 7);
        check(&(Node::sum(vec![&a * 4, Node::num(3)]) / 4), 0, 7, "a");
        check(&(Node::sum(vec![&a * 4, Node::num(3)]) / 16), 0, 1, "(a//4)");
    }

    #[test]
    fn test_div_remove() {
        let e = Node::sum(vec![var("idx0", 0, 127) * 4, var("idx2", 0, 3)]) / 4;
        check(&e, 0, 127, "idx0");
    }

    #[test]
    fn test_div_factor() {
        let e = Node::sum(vec![Node::num(-40), var("a", 0, 10) * 2, var("b", 0, 10) * 40]) / 40;
        check(&e, -1, 9, "(-1+b)");
    }

    #[test]
    fn test_div_numerator_negative() {
        check(&((var("idx", 0, 9) * -10) / 11), -9, 0, "((((idx*-10)+99)//11)+-9)");
    }

    #[test]
    fn test_div_into_mod() {
        check(&((var("idx", 0, 16) * 4) % 8 / 4), 0, 1, "(idx%2)");
    }

    #[test]
    fn test_mul_div() {
        let a = var("a", 0, 10);
        check(&((&a * 4) / 4), 0, 10, "a");
        check(&((&a * 8) / 4), 0, 20, "(a*2)");
        check(&((&a * 4) / 8), 0, 5, "(a//2)");
    }

    #[test]
    fn test_mul_mul_div_div() {
        check(&(var("a", 0, 5) * 10 * 9), 0, 450, "(a*90)");
        check(&(var("a", 0, 1800) / 10 / 9), 0, 20, "(a//90)");
    }

    #[test]
    fn test_distribute_mul() {
        let e = Node::sum(vec![var("a", 0, 3), var("b", 0, 5)]) * 3;
        check(&e, 0, 24, "((a*3)+(b*3))");
    }

    #[test]
    fn test_mod() {
        check(&(var("a", 0, 5) * 100 % 10), 0, 0, "0");
        check(&(var("a", 0, 6) % 100), 0, 6, "a");
        check(&(var("a", 0, 20) % 10), 0, 9, "(a%10)");
        check(&(var("a", 0, 20) % 10 % 5), 0, 4, "(a%5)");
        check(
            &(Node::sum(vec![var("b", 0, 2), var("a", 0, 5) * 10]) % 9),
            0,
            7,
            "(a+b)",
        );
        check(
            &(Node::sum(vec![var("a", 0, 7) * 100, var("b", 0, 3) * 50]) % 100),
            0,
            99,
            "((b*50)%100)",
        );
    }

    #[test]
    fn test_mod_factor_negative() {
        for hi in [10, 100] {
            let e = Node::sum(vec![Node::num(-29), var("a", 0, hi), var("b", 0, 10) * 28]) % 28;
            check(&e, 0, 27, "((27+a)%28)");
        }
    }

    #[test]
    fn test_sum_combine_num() {
        let e = Node::sum(vec![Node::num(29), var("a", 0, 10), Node::num(-23)]);
        check(&e, 6, 16, "(6+a)");
        let a = var("a", 0, 7);
        check(&Node::sum(vec![&a * -1, Node::num(1), a.clone()]), 1, 1, "1");
    }

    #[test]
    fn test_lt_and_remove() {
        check(&var("a", 0, 6).ge(0), 1, 1, "1");
        check(&var("a", 0, 6).lt(-3), 0, 0, "0");
        check(&var("a", 0, 6).lt(3), 0, 1, "(a<3)");
        check(&var("a", 0, 6).lt(8), 1, 1, "1");
        check(&Node::ands(vec![Node::num(0), var("a", 0, 6).lt(3)]), 0, 0, "0");
        check(&Node::ands(vec![Node::num(1), var("a", 0, 6).lt(3)]), 0, 1, "(a<3)");
        check(&Node::ands(vec![]), 1, 1, "1");
    }

    #[test]
    fn test_nested_and_flattens() {
        let (a, b, c) = (var("a", 0, 6), var("b", 0, 6), var("c", 0, 6));
        let inner = Node::ands(vec![a.lt(3), b.lt(3)]);
        check(
            &Node::ands(vec![inner, c.lt(2)]),
            0,
            1,
            "((a<3) and (b<3) and (c<2))",
        );
    }

    #[test]
    fn test_substitute() {
        let a = var("a", 0, 10);
        let b = var("b", 0, 10);
        let e = &a * 3 + &b % 4;
        let mut map = BTreeMap::new();
        map.insert(a.as_var().unwrap().clone(), Node::num(2));
        let s = e.substitute(&map);
        check(&s, 6, 9, "((b%4)+6)");
        assert_eq!(s.substitute(&map), s);
        map.insert(b.as_var().unwrap().clone(), Node::num(7));
        check(&e.substitute(&map), 9, 9, "9");
    }

    #[test]
    fn test_and_substitute_short_circuits() {
        let a = var("a", 0, 10);
        let b = var("b", 0, 10);
        let e = Node::ands(vec![a.lt(3), b.lt(3)]);
        let mut map = BTreeMap::new();
        map.insert(a.as_var().unwrap().clone(), Node::num(5));
        check(&e.substitute(&map), 0, 0, "0");
    }

    #[test]
    fn test_expand() {
        let a = Variable::new("a", 0, 1).unwrap();
        let b = Variable::new("b", 0, 2).unwrap();
        let e = a.node() + b.node() * 2;
        let vals: Vec<i64> = e
            .expand(&[a, b])
            .iter()
            .map(|n| n.as_num().unwrap())
            .collect();
        assert_eq!(vals, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_expand_default_picks_anonymous() {
        let u = Node::loop_var("", 0, 3);
        let e = var("i", 0, 7) * 4 + u;
        let expanded: Vec<String> = e.expand_default().iter().map(Node::render).collect();
        assert_eq!(expanded, vec!["(i*4)", "((i*4)+1)", "((i*4)+2)", "((i*4)+3)"]);
        assert_eq!(var("i", 0, 7).expand_default().len(), 1);
    }

    #[test]
    fn test_iter_idxs_order() {
        assert_eq!(
            iter_idxs(&[(0, 1), (5, 6)]),
            vec![vec![0, 5], vec![1, 5], vec![0, 6], vec![1, 6]]
        );
    }

    #[test]
    fn test_sym_prod_and_infer() {
        let n = Variable::new("n", 1, 10).unwrap();
        let p = sym_prod(&[Node::num(3), n.node(), Node::num(2)]);
        check(&p, 6, 60, "(n*6)");
        let mut vals = VarVals::new();
        vals.insert(n, 4);
        assert_eq!(sym_infer(&p, &vals), Some(24));
        assert_eq!(sym_infer(&p, &VarVals::new()), None);
    }

    #[test]
    fn test_debug_key_includes_bounds() {
        let e = var("a", 0, 8) * 2;
        assert_eq!(e.canonical_key(), "(a[0-8]*2)");
        assert_eq!(format!("{e:?}"), "<(a[0-8]*2)>");
    }
}
