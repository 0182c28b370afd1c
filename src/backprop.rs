//! Reverse-mode differentiation over a recorded [`Graph`].
//!
//! # Backward Pass
//!
//! [`backward`] seeds `output.grad = 1.0` and pushes gradients towards the
//! leaves with each operator's local rule, **adding** into operand
//! accumulators. A node reached along several paths therefore receives the
//! sum of every path's contribution.
//!
//! ## Traversal
//!
//! Operands are always created before their consumers, so walking the arena
//! from `output` down to index 0 visits every consumer before its operands.
//! A first sweep marks the nodes reachable from `output`; the second applies
//! each marked node's rule exactly once, after all of its consumers have
//! contributed to its gradient.
//!
//! ## Local rules
//!
//! | Op        | left operand                 | right operand                    |
//! |-----------|------------------------------|----------------------------------|
//! | `Add`     | `+= d`                       | `+= d`                           |
//! | `Sub`     | `+= d`                       | `-= d`                           |
//! | `Mul`     | `+= d * r`                   | `+= d * l`                       |
//! | `MatMul`  | `+= d * r`                   | `+= d * l`                       |
//! | `Div`     | `+= d / r`                   | `-= d * l / r²`                  |
//! | `Pow`     | `+= d * r * l^(r - 1)`       | `+= d * out * ln(l)`             |
//! | `Exp`     | `+= d * out`                 |                                  |
//! | `Log`     | `+= d / l`                   |                                  |
//! | `Sin`     | `+= d * cos(l)`              |                                  |
//! | `Cos`     | `-= d * sin(l)`              |                                  |
//!
//! Nodes that do not require a gradient neither propagate nor receive one.
//! Gradients keep accumulating across calls until [`Graph::zero_grad`].

use crate::error::Result;
use crate::graph::{Graph, Op};
use tracing::debug;

/// Contributions of one node to its (left, right) operands.
fn local_grads(op: Op, d: f64, out: f64, l: f64, r: f64) -> (f64, f64) {
    match op {
        Op::Constant => (0.0, 0.0),
        Op::Add => (d, d),
        Op::Sub => (d, -d),
        Op::Mul | Op::MatMul => (d * r, d * l),
        Op::Div => (d / r, -d * l / (r * r)),
        Op::Pow => (d * r * l.powf(r - 1.0), d * out * l.ln()),
        Op::Exp => (d * out, 0.0),
        Op::Log => (d / l, 0.0),
        Op::Sin => (d * l.cos(), 0.0),
        Op::Cos => (-d * l.sin(), 0.0),
    }
}

/// Backpropagates from `output` through every node it depends on.
///
/// # Errors
///
/// [`RuntimeError::InvalidHandle`](crate::RuntimeError::InvalidHandle) if
/// `output` does not belong to `graph`.
pub fn backward(graph: &mut Graph, output: crate::graph::NodeId) -> Result<()> {
    let out = graph.check(output)?;
    let nodes = &mut graph.nodes[..=out];

    nodes.iter_mut().for_each(|n| n.visited = false);
    nodes[out].visited = true;
    let mut reachable = 0usize;
    for i in (0..=out).rev() {
        if !nodes[i].visited {
            continue;
        }
        reachable += 1;
        for operand in [nodes[i].left, nodes[i].right].into_iter().flatten() {
            nodes[operand.index()].visited = true;
        }
    }

    nodes[out].grad = 1.0;
    for i in (0..=out).rev() {
        let node = &nodes[i];
        if !node.visited || !node.requires_grad || node.op.arity() == 0 {
            continue;
        }
        let (op, d, value) = (node.op, node.grad, node.value);
        let (left, right) = (node.left, node.right);
        let l = left.map_or(0.0, |id| nodes[id.index()].value);
        let r = right.map_or(0.0, |id| nodes[id.index()].value);
        let (dl, dr) = local_grads(op, d, value, l, r);

        for (operand, contribution) in [(left, dl), (right, dr)] {
            if let Some(id) = operand {
                let target = &mut nodes[id.index()];
                if target.requires_grad {
                    target.grad += contribution;
                }
            }
        }
    }

    nodes.iter_mut().for_each(|n| n.visited = false);
    debug!(graph = graph.id(), output = out, reachable, "backward pass");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(got: f64, want: f64) {
        assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
    }

    #[test]
    fn quadratic() {
        let mut g = Graph::new();
        let x = g.var(2.0).unwrap();
        let x2 = g.mul(x, x).unwrap();
        let three = g.constant(3.0).unwrap();
        let three_x = g.mul(three, x).unwrap();
        let one = g.constant(1.0).unwrap();
        let sum = g.add(x2, three_x).unwrap();
        let y = g.add(sum, one).unwrap();

        backward(&mut g, y).unwrap();
        assert_eq!(g.value(y).unwrap(), 11.0);
        assert_eq!(g.grad(x).unwrap(), 7.0);
        assert_eq!(g.grad(three).unwrap(), 0.0);
    }

    #[test]
    fn diamond_accumulates_every_path() {
        let mut g = Graph::new();
        let x = g.var(5.0).unwrap();
        let y = g.add(x, x).unwrap();
        backward(&mut g, y).unwrap();
        assert_eq!(g.grad(x).unwrap(), 2.0);

        // shared sub-expression used four times
        let mut g = Graph::new();
        let x = g.var(1.5).unwrap();
        let s = g.mul(x, x).unwrap();
        let a = g.add(s, s).unwrap();
        let b = g.add(a, a).unwrap();
        backward(&mut g, b).unwrap();
        assert_close(g.grad(x).unwrap(), 4.0 * 2.0 * 1.5);
        assert_eq!(g.grad(s).unwrap(), 4.0);
    }

    #[test]
    fn division_and_power() {
        let mut g = Graph::new();
        let a = g.var(3.0).unwrap();
        let b = g.var(4.0).unwrap();
        let q = g.div(a, b).unwrap();
        backward(&mut g, q).unwrap();
        assert_close(g.grad(a).unwrap(), 0.25);
        assert_close(g.grad(b).unwrap(), -3.0 / 16.0);

        let mut g = Graph::new();
        let base = g.var(2.0).unwrap();
        let exp = g.var(3.0).unwrap();
        let p = g.pow(base, exp).unwrap();
        backward(&mut g, p).unwrap();
        assert_close(g.grad(base).unwrap(), 12.0);
        assert_close(g.grad(exp).unwrap(), 8.0 * 2.0f64.ln());
    }

    #[test]
    fn constant_exponent_takes_no_gradient() {
        let mut g = Graph::new();
        let x = g.var(3.0).unwrap();
        let two = g.constant(2.0).unwrap();
        let p = g.pow(x, two).unwrap();
        backward(&mut g, p).unwrap();
        assert_close(g.grad(x).unwrap(), 6.0);
        assert_eq!(g.grad(two).unwrap(), 0.0);
    }

    #[test]
    fn unary_rules() {
        let x0 = 0.7;
        let mut g = Graph::new();
        let x = g.var(x0).unwrap();
        let e = g.exp(x).unwrap();
        let l = g.log(x).unwrap();
        let s = g.sin(x).unwrap();
        let c = g.cos(x).unwrap();
        let el = g.add(e, l).unwrap();
        let sc = g.add(s, c).unwrap();
        let y = g.add(el, sc).unwrap();
        backward(&mut g, y).unwrap();
        assert_close(
            g.grad(x).unwrap(),
            x0.exp() + 1.0 / x0 + x0.cos() - x0.sin(),
        );
    }

    #[test]
    fn unreachable_nodes_are_untouched_and_grads_accumulate() {
        let mut g = Graph::new();
        let x = g.var(2.0).unwrap();
        let y = g.mul(x, x).unwrap();
        let z = g.exp(x).unwrap();
        backward(&mut g, y).unwrap();
        assert_eq!(g.grad(z).unwrap(), 0.0);
        assert_eq!(g.grad(x).unwrap(), 4.0);

        backward(&mut g, y).unwrap();
        assert_eq!(g.grad(x).unwrap(), 8.0);
        g.zero_grad();
        assert_eq!(g.grad(x).unwrap(), 0.0);
        assert!(g.nodes().all(|n| !n.visited));
    }
}
