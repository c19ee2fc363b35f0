//! Block-level control-flow analysis over a finalised graph.
//!
//! Works on the `block`/`jmp`/`if` scaffolding: enumerating blocks,
//! resolving control edges to their real consumers, folding trivial blocks,
//! and maintaining the keepalive edges that keep infinite loops reachable
//! from the graph root. The back-end and the dispatcher query this module;
//! the straight-line translation pipeline never needs it.
//!
//! `simplify` expects the block marker pass to have run, so that every
//! reachable block knows its terminator.

use crate::frontend::REG_PC;
use crate::ir::{Graph, Mark, NodeId, Opcode, Value};

/// Enumerated `block` nodes of a graph, in operand-walk discovery order.
pub struct Blocks {
    blocks: Vec<NodeId>,
}

impl Blocks {
    pub fn new(graph: &Graph) -> Self {
        let mut blocks = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack: Vec<NodeId> = graph.root().into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if matches!(graph.node(id).opcode(), Opcode::Block { .. }) {
                blocks.push(id);
            }
            for &op in graph.node(id).operands() {
                stack.push(op.node);
            }
        }
        Blocks { blocks }
    }

    pub fn blocks(&self) -> &[NodeId] {
        &self.blocks
    }

    /// The real consumer of a control value, ignoring a keepalive use.
    pub fn get_target(graph: &Graph, control: Value) -> NodeId {
        let uses = graph.node(control.node).uses(control.index);
        assert!(
            uses.len() == 1 || uses.len() == 2,
            "control value with {} consumers",
            uses.len()
        );
        let skip_end = uses.len() == 2;
        for &user in uses {
            if skip_end && matches!(graph.node(user).opcode(), Opcode::End) {
                continue;
            }
            return user;
        }
        unreachable!("control value consumed only by keepalive edges");
    }

    /// If `control` is a tail jump (straight into `end`) and the PC written
    /// before it is a known value, return that value.
    ///
    /// The dispatcher uses this to chain a block directly to its successor.
    pub fn tail_jmp_pc(graph: &Graph, control: Value) -> Option<Value> {
        let uses = graph.node(control.node).uses(control.index);
        if uses.len() != 1 {
            // A keepalive edge means this terminator feeds a loop, not the
            // exit.
            return None;
        }
        if !matches!(graph.node(uses[0]).opcode(), Opcode::End) {
            return None;
        }

        let last_mem = graph.node(control.node).operand(0);
        let producer = graph.node(last_mem.node);
        match *producer.opcode() {
            Opcode::Fence => {
                for &op in producer.operands() {
                    let n = graph.node(op.node);
                    if matches!(n.opcode(), Opcode::StoreRegister { reg } if *reg == REG_PC) {
                        return Some(n.operand(1));
                    }
                }
                None
            }
            Opcode::StoreRegister { reg } if reg == REG_PC => Some(producer.operand(1)),
            _ => None,
        }
    }

    /// Find a block's terminator by walking its memory chain forward.
    /// Falls back gracefully when the marker pass has not paired it.
    fn terminator_of(graph: &Graph, block: NodeId) -> Option<NodeId> {
        if let Opcode::Block { mate: Some(term) } = *graph.node(block).opcode() {
            return Some(term);
        }
        let mut value = Value::new(block, 0);
        loop {
            let &consumer = graph.node(value.node).uses(value.index).first()?;
            match graph.node(consumer).opcode() {
                Opcode::Jmp { .. } | Opcode::If { .. } => return Some(consumer),
                op if op.has_side_effect() => value = Value::new(consumer, 0),
                _ => return None,
            }
        }
    }

    /// Fold trivial blocks.
    ///
    /// A block whose only entry is an unconditional jump merges into its
    /// predecessor: the two memory chains are joined and the surviving
    /// terminator is re-mated to the predecessor's block. A block that is
    /// empty (its terminator consumes the block's own token) dissolves by
    /// handing its incoming control straight to the terminator's consumers.
    pub fn simplify(&mut self, graph: &mut Graph) {
        let worklist = self.blocks.clone();
        for block in worklist {
            if !graph.contains(block) {
                continue;
            }
            if graph.node(block).operand_count() != 1 {
                continue;
            }
            let incoming = graph.node(block).operand(0);

            let from_jmp = matches!(graph.node(incoming.node).opcode(), Opcode::Jmp { .. })
                && graph.node(incoming.node).uses(incoming.index).len() == 1;
            if from_jmp {
                let prev_jmp = incoming.node;
                let next_term = match *graph.node(block).opcode() {
                    Opcode::Block { mate } => mate.expect("simplify requires the block marker"),
                    _ => unreachable!(),
                };
                let prev_block = match *graph.node(prev_jmp).opcode() {
                    Opcode::Jmp { mate } => mate,
                    _ => unreachable!(),
                };

                // Join the chains across the removed edge.
                let prev_mem = graph.node(prev_jmp).operand(0);
                graph.replace_value(Value::new(block, 0), prev_mem);

                let term_opcode = graph.node(next_term).opcode().clone();
                match term_opcode {
                    Opcode::Jmp { .. } => {
                        graph.set_opcode(next_term, Opcode::Jmp { mate: prev_block })
                    }
                    Opcode::If { .. } => {
                        graph.set_opcode(next_term, Opcode::If { mate: prev_block })
                    }
                    _ => unreachable!(),
                }
                if let Some(prev_block) = prev_block {
                    graph.set_opcode(
                        prev_block,
                        Opcode::Block {
                            mate: Some(next_term),
                        },
                    );
                }
                self.blocks.retain(|&b| b != block);
                continue;
            }

            // Empty block on a conditional edge: terminator directly
            // consumes the block's token.
            if let Some(term) = Self::terminator_of(graph, block) {
                let empty = matches!(graph.node(term).opcode(), Opcode::Jmp { .. })
                    && graph.node(term).operand(0) == Value::new(block, 0);
                if empty {
                    graph.replace_value(Value::new(term, 0), incoming);
                    self.blocks.retain(|&b| b != block);
                }
            }
        }
    }

    /// Drop stale keepalive edges from `end` and add the ones needed so
    /// every live block is reachable from the root.
    ///
    /// A block is live when something still consumes its memory token; a
    /// loop that never exits is live but invisible through operand edges,
    /// which is exactly what the keepalive edge repairs.
    pub fn update_keepalive(&mut self, graph: &mut Graph) {
        let root = graph.root().expect("keepalive update needs a rooted graph");
        assert!(matches!(graph.node(root).opcode(), Opcode::End));

        // An operand of end whose control has another consumer is a
        // keepalive; drop them all and re-derive the needed set.
        let mut index = 0;
        while index < graph.node(root).operand_count() {
            let op = graph.node(root).operand(index);
            if graph.node(op.node).uses(op.index).len() > 1 {
                graph.remove_operand(root, index);
            } else {
                index += 1;
            }
        }

        loop {
            self.mark_reachable(graph);
            let orphan = graph
                .iter_nodes()
                .filter(|(id, n)| {
                    matches!(n.opcode(), Opcode::Block { .. })
                        && graph.mark(*id) == Mark::Unvisited
                        && !n.uses(0).is_empty()
                })
                .map(|(id, _)| id)
                .min();
            let Some(block) = orphan else { break };
            let term =
                Self::terminator_of(graph, block).expect("live block without a terminator");
            graph.add_operand(root, Value::new(term, 0));
        }
    }

    fn mark_reachable(&self, graph: &mut Graph) {
        graph.clear_marks();
        let mut stack: Vec<NodeId> = graph.root().into_iter().collect();
        while let Some(id) = stack.pop() {
            if graph.mark(id) == Mark::Visited {
                continue;
            }
            graph.set_mark(id, Mark::Visited);
            for i in 0..graph.node(id).operand_count() {
                stack.push(graph.node(id).operand(i).node);
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
