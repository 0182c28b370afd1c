//! Recording sessions and the variable handles they hand out.
//!
//! A [`Session`] is a two-state machine:
//!
//! ```text
//!   NoSession --begin--> Recording --end--> NoSession
//!                         |    ^
//!                         +----+ begin (discards the current graph)
//! ```
//!
//! While recording, node-producing calls append to the session's [`Graph`]
//! and return [`Var::Tracked`]. Without a session they still compute the
//! forward value but return [`Var::Detached`], which is never differentiated:
//! its gradient reads as `0.0` no matter how often `backward` runs.
//!
//! A tracked handle is tied to the graph it was created in. Once that graph
//! is gone (the session ended or restarted) every use of the handle reports
//! [`RuntimeError::InvalidHandle`].
//!
//! Sessions are plain values. Independent sessions can record concurrently
//! on different threads.

use crate::error::{Result, RuntimeError};
use crate::graph::{Graph, NodeId, Op};
use tracing::{debug, warn};

/// A scalar produced by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Var {
    /// A node in the session's graph.
    Tracked(NodeId),
    /// A plain value computed outside any recording.
    Detached(f64),
}

impl Var {
    #[must_use]
    pub const fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked(_))
    }

    #[must_use]
    pub const fn node(&self) -> Option<NodeId> {
        match self {
            Self::Tracked(id) => Some(*id),
            Self::Detached(_) => None,
        }
    }
}

/// Caller-owned recording state.
#[derive(Debug, Default)]
pub struct Session {
    graph: Option<Graph>,
}

impl Session {
    /// A session in the `NoSession` state.
    #[must_use]
    pub const fn new() -> Self {
        Self { graph: None }
    }

    /// Starts recording into a fresh graph, discarding any graph already being
    /// recorded.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::GraphIdsExhausted`] if no fresh graph can be created;
    /// the active graph, if any, is kept.
    pub fn begin(&mut self) -> Result<()> {
        let graph = Graph::try_new()?;
        if let Some(stale) = self.graph.take() {
            warn!(graph = stale.id(), nodes = stale.len(), "discarding active graph");
        }
        debug!(graph = graph.id(), "recording started");
        self.graph = Some(graph);
        Ok(())
    }

    /// Stops recording and returns the finished graph, if there was one.
    pub fn end(&mut self) -> Option<Graph> {
        let graph = self.graph.take();
        if let Some(g) = &graph {
            debug!(graph = g.id(), nodes = g.len(), "recording ended");
        }
        graph
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.graph.is_some()
    }

    #[must_use]
    pub const fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    fn stale(id: NodeId) -> RuntimeError {
        RuntimeError::InvalidHandle {
            handle: id.to_raw(),
        }
    }

    /// Forward value of a handle without touching the graph's shape.
    fn peek(&self, v: Var) -> Result<f64> {
        match (v, &self.graph) {
            (Var::Detached(x), _) => Ok(x),
            (Var::Tracked(id), Some(g)) => g.value(id),
            (Var::Tracked(id), None) => Err(Self::stale(id)),
        }
    }

    /// Node for `v` in the active graph, lifting detached values to constants.
    fn lift(graph: &mut Graph, v: Var) -> Result<NodeId> {
        match v {
            Var::Tracked(id) => graph.check(id).map(|_| id),
            Var::Detached(x) => graph.constant(x),
        }
    }

    /// A differentiable leaf when recording, a detached value otherwise.
    ///
    /// # Errors
    ///
    /// Only if the active graph is full.
    pub fn make_var(&mut self, value: f64) -> Result<Var> {
        match &mut self.graph {
            Some(g) => g.var(value).map(Var::Tracked),
            None => Ok(Var::Detached(value)),
        }
    }

    /// A non-differentiable leaf when recording, a detached value otherwise.
    ///
    /// # Errors
    ///
    /// Only if the active graph is full.
    pub fn constant(&mut self, value: f64) -> Result<Var> {
        match &mut self.graph {
            Some(g) => g.constant(value).map(Var::Tracked),
            None => Ok(Var::Detached(value)),
        }
    }

    /// Applies `op` to `l` (and `r` for binary operators).
    ///
    /// Two detached operands yield a detached result even while recording.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a tracked operand that does not
    /// belong to the active graph, or any tracked operand with no session.
    pub fn apply(&mut self, op: Op, l: Var, r: Option<Var>) -> Result<Var> {
        let r = r.unwrap_or(Var::Detached(0.0));
        let tracked = l.is_tracked() || (op.arity() == 2 && r.is_tracked());
        if let (true, Some(g)) = (tracked, self.graph.as_mut()) {
            for id in [l.node(), r.node()].into_iter().flatten() {
                g.check(id)?;
            }
            let ln = Self::lift(g, l)?;
            let id = if op.arity() == 2 {
                let rn = Self::lift(g, r)?;
                g.binary(op, ln, rn)?
            } else {
                g.unary(op, ln)?
            };
            return Ok(Var::Tracked(id));
        }
        Ok(Var::Detached(op.forward(self.peek(l)?, self.peek(r)?)))
    }

    /// Backpropagates from `output`. A detached output is a no-op.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a stale or foreign handle.
    pub fn backward(&mut self, output: Var) -> Result<()> {
        match (output, &mut self.graph) {
            (Var::Detached(_), _) => Ok(()),
            (Var::Tracked(id), Some(g)) => g.backward(id),
            (Var::Tracked(id), None) => Err(Self::stale(id)),
        }
    }

    /// Clears every gradient in the active graph.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NoActiveSession`] when not recording.
    pub fn zero_grad(&mut self) -> Result<()> {
        let g = self
            .graph
            .as_mut()
            .ok_or(RuntimeError::NoActiveSession { op: "zero_grad" })?;
        g.zero_grad();
        Ok(())
    }

    /// Forward value of `v`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a stale or foreign handle.
    pub fn value(&self, v: Var) -> Result<f64> {
        self.peek(v)
    }

    /// Accumulated gradient of `v`; always `0.0` for detached values.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidHandle`] for a stale or foreign handle.
    pub fn grad(&self, v: Var) -> Result<f64> {
        match (v, &self.graph) {
            (Var::Detached(_), _) => Ok(0.0),
            (Var::Tracked(id), Some(g)) => g.grad(id),
            (Var::Tracked(id), None) => Err(Self::stale(id)),
        }
    }
}

macro_rules! session_binary {
    ($($name:ident => $op:ident),* $(,)?) => {
        impl Session {$(
            #[doc = concat!("Records `", stringify!($op), "` over two variables.")]
            ///
            /// # Errors
            ///
            /// As [`Session::apply`].
            pub fn $name(&mut self, l: Var, r: Var) -> Result<Var> {
                self.apply(Op::$op, l, Some(r))
            }
        )*}
    };
}

macro_rules! session_unary {
    ($($name:ident => $op:ident),* $(,)?) => {
        impl Session {$(
            #[doc = concat!("Records `", stringify!($op), "` of a variable.")]
            ///
            /// # Errors
            ///
            /// As [`Session::apply`].
            pub fn $name(&mut self, l: Var) -> Result<Var> {
                self.apply(Op::$op, l, None)
            }
        )*}
    };
}

session_binary! {
    add => Add,
    sub => Sub,
    mul => Mul,
    div => Div,
    pow => Pow,
    matmul => MatMul,
}

session_unary! {
    exp => Exp,
    log => Log,
    sin => Sin,
    cos => Cos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let mut s = Session::new();
        assert!(!s.is_recording());
        assert!(s.end().is_none());
        s.begin().unwrap();
        assert!(s.is_recording());
        let x = s.make_var(1.0).unwrap();
        assert!(x.is_tracked());
        s.begin().unwrap();
        assert_eq!(s.graph().map(Graph::len), Some(0));
        assert!(matches!(
            s.value(x),
            Err(RuntimeError::InvalidHandle { .. })
        ));
        let g = s.end().unwrap();
        assert!(g.is_empty());
        assert!(!s.is_recording());
    }

    #[test]
    fn detached_without_session() {
        let mut s = Session::new();
        let x = s.make_var(3.0).unwrap();
        let y = s.mul(x, x).unwrap();
        assert_eq!(y, Var::Detached(9.0));
        s.backward(y).unwrap();
        assert_eq!(s.grad(x).unwrap(), 0.0);
        assert!(s.zero_grad().is_err());
    }

    #[test]
    fn detached_operands_are_lifted_while_recording() {
        let mut s = Session::new();
        let c = s.make_var(4.0).unwrap();
        s.begin().unwrap();
        let x = s.make_var(2.0).unwrap();
        let y = s.mul(x, c).unwrap();
        assert!(y.is_tracked());
        s.backward(y).unwrap();
        assert_eq!(s.grad(x).unwrap(), 4.0);
        assert_eq!(s.grad(c).unwrap(), 0.0);

        let both = s.add(c, c).unwrap();
        assert_eq!(both, Var::Detached(8.0));
    }

    #[test]
    fn tracked_handles_die_with_their_session() {
        let mut s = Session::new();
        s.begin().unwrap();
        let x = s.make_var(1.0).unwrap();
        s.end();
        assert!(s.grad(x).is_err());
        assert!(s.backward(x).is_err());
        assert!(s.exp(x).is_err());
    }
}
