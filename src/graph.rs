//! Arena-backed computational graph ("tape").
//!
//! # Computational Graph
//!
//! A [`Graph`] records scalar operations as they are evaluated. Each node
//! stores the already-computed forward `value`, a `grad` accumulator and up to
//! two operand references. There is no symbolic expression; the graph exists
//! only so [`backward`](crate::backprop::backward) can replay it in reverse.
//!
//! Nodes live in a single `Vec` owned by the graph and are addressed by
//! [`NodeId`], which carries both the owning graph's id and the node's index.
//! Every access validates both, so a handle from another graph or an
//! out-of-range index is a [`RuntimeError::InvalidHandle`], never a wild read.
//!
//! Operands are always created before their consumers, so creation order is a
//! topological order of the DAG.
//!
//! ## Example
//!
//! ```rust
//! use tapegrad::graph::Graph;
//!
//! let mut g = Graph::new();
//! let x = g.var(2.0).unwrap();
//! let x2 = g.mul(x, x).unwrap();
//! let three = g.constant(3.0).unwrap();
//! let three_x = g.mul(three, x).unwrap();
//! let one = g.constant(1.0).unwrap();
//! let partial = g.add(x2, three_x).unwrap();
//! let y = g.add(partial, one).unwrap();
//!
//! g.backward(y).unwrap();
//! assert_eq!(g.value(y).unwrap(), 11.0);
//! assert_eq!(g.grad(x).unwrap(), 7.0);
//! ```

use crate::error::{Result, RuntimeError};
use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(1);

/// Largest graph id ever handed out. Raw node handles stay below `2^63`.
pub const MAX_GRAPH_ID: u32 = 0x7FFF_FFFF;

/// Takes the next id from `counter`, refusing to wrap.
fn take_id(counter: &AtomicU32) -> Result<u32> {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            (id <= MAX_GRAPH_ID).then_some(id + 1)
        })
        .map_err(|_| RuntimeError::GraphIdsExhausted { max: MAX_GRAPH_ID })
}

/// Operator kinds a node can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// A leaf: variable or constant.
    Constant,
    Add,
    Mul,
    Sub,
    Div,
    Pow,
    Exp,
    Log,
    Sin,
    Cos,
    /// Product of two scalars viewed as 1x1 matrices.
    MatMul,
}

impl Op {
    /// Number of operands the operator takes.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Constant => 0,
            Self::Exp | Self::Log | Self::Sin | Self::Cos => 1,
            Self::Add | Self::Mul | Self::Sub | Self::Div | Self::Pow | Self::MatMul => 2,
        }
    }

    /// Evaluates the operator. `r` is ignored by unary operators, and both
    /// operands by [`Op::Constant`] (which yields `l`).
    #[must_use]
    pub fn forward(self, l: f64, r: f64) -> f64 {
        match self {
            Self::Constant => l,
            Self::Add => l + r,
            Self::Sub => l - r,
            Self::Mul | Self::MatMul => l * r,
            Self::Div => l / r,
            Self::Pow => l.powf(r),
            Self::Exp => l.exp(),
            Self::Log => l.ln(),
            Self::Sin => l.sin(),
            Self::Cos => l.cos(),
        }
    }
}

/// Handle to a node: owning graph id plus index in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    graph: u32,
    index: u32,
}

impl NodeId {
    #[must_use]
    pub const fn graph(self) -> u32 {
        self.graph
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Packs the handle into a non-zero integer: graph id in the high half,
    /// `index + 1` in the low half.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.graph as u64) << 32) | (self.index as u64 + 1)
    }

    /// Inverse of [`NodeId::to_raw`]. `None` for zero, a zero low half, or a
    /// graph id above [`MAX_GRAPH_ID`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        let low = raw & 0xFFFF_FFFF;
        if low == 0 || (raw >> 32) > MAX_GRAPH_ID as u64 {
            return None;
        }
        Some(Self {
            graph: (raw >> 32) as u32,
            index: (low - 1) as u32,
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}#{}", self.graph, self.index)
    }
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub(crate) id: NodeId,
    pub(crate) op: Op,
    pub(crate) value: f64,
    pub(crate) grad: f64,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) requires_grad: bool,
    pub(crate) visited: bool,
}

impl GraphNode {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn op(&self) -> Op {
        self.op
    }

    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub const fn grad(&self) -> f64 {
        self.grad
    }

    #[must_use]
    pub const fn left(&self) -> Option<NodeId> {
        self.left
    }

    #[must_use]
    pub const fn right(&self) -> Option<NodeId> {
        self.right
    }

    #[must_use]
    pub const fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// An ordered arena of [`GraphNode`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    id: u32,
    pub(crate) nodes: Vec<GraphNode>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// An empty graph with a fresh, process-unique id.
    ///
    /// # Panics
    ///
    /// Once [`MAX_GRAPH_ID`] graphs have been created; use [`Graph::try_new`]
    /// to get the error instead.
    #[must_use]
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(graph) => graph,
            Err(err) => panic!("{err}"),
        }
    }

    /// # Errors
    ///
    /// [`RuntimeError::GraphIdsExhausted`] once every id has been used.
    pub fn try_new() -> Result<Self> {
        Ok(Self {
            id: take_id(&NEXT_GRAPH_ID)?,
            nodes: Vec::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    /// Validates `id` against this graph and returns its arena index.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a handle of another graph or past
    /// the end of this one.
    pub fn check(&self, id: NodeId) -> Result<usize> {
        if id.graph != self.id || id.index() >= self.nodes.len() {
            return Err(RuntimeError::InvalidHandle {
                handle: id.to_raw(),
            });
        }
        Ok(id.index())
    }

    /// # Errors
    ///
    /// As [`Graph::check`].
    pub fn node(&self, id: NodeId) -> Result<&GraphNode> {
        let i = self.check(id)?;
        Ok(&self.nodes[i])
    }

    /// # Errors
    ///
    /// As [`Graph::check`].
    pub fn value(&self, id: NodeId) -> Result<f64> {
        Ok(self.node(id)?.value)
    }

    /// # Errors
    ///
    /// As [`Graph::check`].
    pub fn grad(&self, id: NodeId) -> Result<f64> {
        Ok(self.node(id)?.grad)
    }

    fn push(
        &mut self,
        op: Op,
        value: f64,
        left: Option<NodeId>,
        right: Option<NodeId>,
        requires_grad: bool,
    ) -> Result<NodeId> {
        let index = u32::try_from(self.nodes.len())
            .ok()
            .filter(|&i| i < u32::MAX)
            .ok_or_else(|| RuntimeError::invalid("graph", "node limit reached"))?;
        let id = NodeId {
            graph: self.id,
            index,
        };
        self.nodes.push(GraphNode {
            id,
            op,
            value,
            grad: 0.0,
            left,
            right,
            requires_grad,
            visited: false,
        });
        Ok(id)
    }

    /// A leaf that gradients flow into.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] once the graph holds `u32::MAX` nodes.
    pub fn var(&mut self, value: f64) -> Result<NodeId> {
        self.push(Op::Constant, value, None, None, true)
    }

    /// A leaf that takes no gradient.
    ///
    /// # Errors
    ///
    /// As [`Graph::var`].
    pub fn constant(&mut self, value: f64) -> Result<NodeId> {
        self.push(Op::Constant, value, None, None, false)
    }

    /// Records a binary operator applied to two existing nodes.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a foreign or stale operand, and
    /// [`RuntimeError::InvalidArgument`] if `op` is not binary.
    pub fn binary(&mut self, op: Op, l: NodeId, r: NodeId) -> Result<NodeId> {
        if op.arity() != 2 {
            return Err(RuntimeError::invalid("binary", format!("{op:?} is not binary")));
        }
        let (lv, lg) = {
            let n = self.node(l)?;
            (n.value, n.requires_grad)
        };
        let (rv, rg) = {
            let n = self.node(r)?;
            (n.value, n.requires_grad)
        };
        self.push(op, op.forward(lv, rv), Some(l), Some(r), lg || rg)
    }

    /// Records a unary operator applied to an existing node.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a foreign or stale operand, and
    /// [`RuntimeError::InvalidArgument`] if `op` is not unary.
    pub fn unary(&mut self, op: Op, l: NodeId) -> Result<NodeId> {
        if op.arity() != 1 {
            return Err(RuntimeError::invalid("unary", format!("{op:?} is not unary")));
        }
        let n = self.node(l)?;
        let (value, requires_grad) = (op.forward(n.value, 0.0), n.requires_grad);
        self.push(op, value, Some(l), None, requires_grad)
    }

    /// Clears every gradient accumulator.
    pub fn zero_grad(&mut self) {
        self.nodes.iter_mut().for_each(|n| n.grad = 0.0);
    }

    /// Runs reverse-mode differentiation from `output`.
    ///
    /// # Errors
    ///
    /// As [`crate::backprop::backward`].
    pub fn backward(&mut self, output: NodeId) -> Result<()> {
        crate::backprop::backward(self, output)
    }
}

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        impl Graph {$(
            $(#[$doc])*
            ///
            /// # Errors
            ///
            /// [`RuntimeError::InvalidHandle`] for a foreign or stale operand.
            pub fn $name(&mut self, l: NodeId, r: NodeId) -> Result<NodeId> {
                self.binary(Op::$op, l, r)
            }
        )*}
    };
}

macro_rules! unary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        impl Graph {$(
            $(#[$doc])*
            ///
            /// # Errors
            ///
            /// [`RuntimeError::InvalidHandle`] for a foreign or stale operand.
            pub fn $name(&mut self, l: NodeId) -> Result<NodeId> {
                self.unary(Op::$op, l)
            }
        )*}
    };
}

binary_ops! {
    /// `l + r`
    add => Add,
    /// `l - r`
    sub => Sub,
    /// `l * r`
    mul => Mul,
    /// `l / r`
    div => Div,
    /// `l ^ r`
    pow => Pow,
    /// `l * r`, recorded as a 1x1 matrix product.
    matmul => MatMul,
}

unary_ops! {
    /// `e ^ l`
    exp => Exp,
    /// Natural logarithm of `l`.
    log => Log,
    sin => Sin,
    cos => Cos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_values_are_eager() {
        let mut g = Graph::new();
        let a = g.var(3.0).unwrap();
        let b = g.constant(2.0).unwrap();
        let ops = [
            (g.sub(a, b).unwrap(), 1.0),
            (g.div(a, b).unwrap(), 1.5),
            (g.pow(a, b).unwrap(), 9.0),
            (g.matmul(a, b).unwrap(), 6.0),
            (g.log(b).unwrap(), 2.0f64.ln()),
        ];
        for (id, want) in ops {
            assert_eq!(g.value(id).unwrap(), want);
        }
        assert_eq!(g.len(), 7);
    }

    #[test]
    fn requires_grad_is_or_of_operands() {
        let mut g = Graph::new();
        let x = g.var(1.0).unwrap();
        let c = g.constant(2.0).unwrap();
        let cc = g.add(c, c).unwrap();
        let xc = g.mul(x, c).unwrap();
        assert!(!g.node(cc).unwrap().requires_grad());
        assert!(g.node(xc).unwrap().requires_grad());
        let s = g.sin(xc).unwrap();
        assert!(g.node(s).unwrap().requires_grad());
    }

    #[test]
    fn arity_matches_recorded_operands() {
        let mut g = Graph::new();
        let x = g.var(0.5).unwrap();
        let e = g.exp(x).unwrap();
        let s = g.add(x, e).unwrap();
        for n in g.nodes() {
            let count = usize::from(n.left().is_some()) + usize::from(n.right().is_some());
            assert_eq!(count, n.op().arity());
        }
        assert_eq!(g.node(s).unwrap().left(), Some(x));
        assert!(g.binary(Op::Exp, x, x).is_err());
        assert!(g.unary(Op::Add, x).is_err());
    }

    #[test]
    fn foreign_and_stale_handles_are_rejected() {
        let mut a = Graph::new();
        let mut b = Graph::new();
        let xa = a.var(1.0).unwrap();
        let xb = b.var(1.0).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(
            a.add(xa, xb),
            Err(RuntimeError::InvalidHandle {
                handle: xb.to_raw()
            })
        );
        let forged = NodeId::from_raw(xa.to_raw() + 5).unwrap();
        assert!(a.value(forged).is_err());
    }

    #[test]
    fn raw_handles_are_nonzero() {
        let mut g = Graph::new();
        let x = g.var(0.0).unwrap();
        assert_ne!(x.to_raw(), 0);
        assert_eq!(NodeId::from_raw(x.to_raw()), Some(x));
        assert_eq!(NodeId::from_raw(0), None);
        assert_eq!(NodeId::from_raw(7 << 32), None);
        assert_eq!(NodeId::from_raw((1 << 63) | 1), None);
    }

    #[test]
    fn graph_ids_do_not_wrap() {
        let counter = AtomicU32::new(MAX_GRAPH_ID - 1);
        assert_eq!(take_id(&counter), Ok(MAX_GRAPH_ID - 1));
        assert_eq!(take_id(&counter), Ok(MAX_GRAPH_ID));
        for _ in 0..3 {
            assert_eq!(
                take_id(&counter),
                Err(RuntimeError::GraphIdsExhausted { max: MAX_GRAPH_ID })
            );
        }
        let raw = NodeId { graph: MAX_GRAPH_ID, index: u32::MAX - 1 }.to_raw();
        assert!(i64::try_from(raw).is_ok());
    }
}
