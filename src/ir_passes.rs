//! Graph passes: the walker framework, register-access elimination, local
//! value numbering, and the block marker.
//!
//! Every pass is a depth-first post-order walk over the nodes reachable from
//! the graph root. Post-order means a node's operands are processed first,
//! which for side-effecting nodes is exactly chain order: each effectful node
//! holds its memory predecessor in operand 0, so the chain replays from the
//! block entry to the terminator.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::frontend::REG_COUNT;
use crate::ir::{sign_extend, zero_extend, Graph, Mark, NodeId, Opcode, Type, Value};

// ─── Pass framework ─────────────────────────────────────────────────────────

/// A graph walker.
///
/// `start` runs once, then each reachable node gets `before` (pre-order;
/// returning `true` aborts the descent into its operands and skips `after`),
/// a recursive visit of its operands, and `after` (post-order). `finish`
/// runs last. Hooks may rewrite the graph; the walker snapshots operand
/// lists before descending.
pub trait Pass {
    fn start(&mut self, _graph: &mut Graph) {}
    fn before(&mut self, _graph: &mut Graph, _node: NodeId) -> bool {
        false
    }
    fn after(&mut self, _graph: &mut Graph, _node: NodeId) {}
    fn finish(&mut self, _graph: &mut Graph) {}
}

/// Run a pass over everything reachable from the graph root.
pub fn run<P: Pass>(pass: &mut P, graph: &mut Graph) {
    graph.clear_marks();
    pass.start(graph);
    if let Some(root) = graph.root() {
        run_recurse(pass, graph, root);
    }
    pass.finish(graph);
}

fn run_recurse<P: Pass>(pass: &mut P, graph: &mut Graph, node: NodeId) {
    if graph.mark(node) != Mark::Unvisited {
        return;
    }
    if pass.before(graph, node) {
        graph.set_mark(node, Mark::Visited);
        return;
    }
    graph.set_mark(node, Mark::Visiting);
    let operands: SmallVec<[Value; 4]> = graph.node(node).operands().iter().copied().collect();
    for op in operands {
        run_recurse(pass, graph, op.node);
    }
    pass.after(graph, node);
    graph.set_mark(node, Mark::Visited);
}

// ─── Constant evaluation ────────────────────────────────────────────────────

/// Evaluate a cast from `old_ty` to `ty`.
///
/// All constant values are canonically sign-extended to 64 bits, so a signed
/// upcast is a plain re-extension and an unsigned upcast zero-extends at the
/// old type first.
pub fn eval_cast(ty: Type, old_ty: Type, sext: bool, value: u64) -> u64 {
    if sext {
        sign_extend(ty, value)
    } else {
        sign_extend(ty, zero_extend(old_ty, value))
    }
}

/// Evaluate a binary op at operand type `ty` with wrap-around semantics.
/// Shift amounts are masked to the operand width.
pub fn eval_binary(ty: Type, opcode: &Opcode, l: u64, r: u64) -> u64 {
    let shamt = |r: u64| (r as u32) & (ty.bits() - 1);
    match opcode {
        Opcode::Add => sign_extend(ty, l.wrapping_add(r)),
        Opcode::Sub => sign_extend(ty, l.wrapping_sub(r)),
        // Bitwise ops preserve the sign-extension.
        Opcode::Xor => l ^ r,
        Opcode::Or => l | r,
        Opcode::And => l & r,
        Opcode::Shl => sign_extend(ty, l.wrapping_shl(shamt(r))),
        // Logical shift works on the zero-extended form, then converts back.
        Opcode::Shr => sign_extend(ty, zero_extend(ty, l) >> shamt(r)),
        Opcode::Sar => ((l as i64) >> shamt(r)) as u64,
        Opcode::Eq => (l == r) as u64,
        Opcode::Ne => (l != r) as u64,
        // Comparisons work directly on the sign-extended form, which is the
        // reason that form was chosen.
        Opcode::Lt => ((l as i64) < (r as i64)) as u64,
        Opcode::Ge => ((l as i64) >= (r as i64)) as u64,
        Opcode::Ltu => (l < r) as u64,
        Opcode::Geu => (l >= r) as u64,
        _ => panic!("eval_binary on non-binary opcode {opcode:?}"),
    }
}

// ─── Structural value equality ──────────────────────────────────────────────

/// Whether two values are certainly equal: identical, equal constants, or
/// the same pure operation over certainly-equal operands.
///
/// Register-access elimination needs this for memory addresses because it
/// runs before value numbering has merged structurally equal expressions.
pub fn same_value(graph: &Graph, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    let na = graph.node(a.node);
    let nb = graph.node(b.node);
    if a.index != b.index || na.opcode() != nb.opcode() {
        return false;
    }
    if !na.opcode().is_pure() {
        return false;
    }
    if graph.value_type(a) != graph.value_type(b) {
        return false;
    }
    na.operand_count() == nb.operand_count()
        && (0..na.operand_count()).all(|i| same_value(graph, na.operand(i), nb.operand(i)))
}

// ─── Register-access elimination ────────────────────────────────────────────

/// Forwarding and dead-store removal over the local effect chain.
///
/// Register reads forward from the last write (or the last surviving read)
/// of the same register; a register write kills the previous write unless an
/// exception-capable node intervened, since a faulting instruction must
/// observe every store before it. Memory accesses get the same local
/// treatment: a repeated read of the same address forwards, and a same-width
/// write to the same address kills the previous write if nothing observed
/// it. `emulate` and `fence` drop all forwarding state.
pub struct RegisterAccessElimination {
    last_load: Vec<Option<NodeId>>,
    last_store: Vec<Option<NodeId>>,
    /// Set when an exception-capable node ran after the last store of the
    /// register; such a store must stay visible.
    exception_since_store: Vec<bool>,
    last_mem_load: Option<NodeId>,
    last_mem_store: Option<NodeId>,
}

impl Default for RegisterAccessElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccessElimination {
    pub fn new() -> Self {
        let regs = REG_COUNT as usize;
        RegisterAccessElimination {
            last_load: vec![None; regs],
            last_store: vec![None; regs],
            exception_since_store: vec![false; regs],
            last_mem_load: None,
            last_mem_store: None,
        }
    }

    fn reset(&mut self) {
        self.last_load.fill(None);
        self.last_store.fill(None);
        self.exception_since_store.fill(false);
        self.last_mem_load = None;
        self.last_mem_store = None;
    }

    fn mark_exception(&mut self) {
        self.exception_since_store.fill(true);
    }

    /// Take `node` off the effect chain: its memory consumers are reparented
    /// onto its memory predecessor. The node itself stays for the sweep.
    fn unchain(graph: &mut Graph, node: NodeId) {
        let pred = graph.node(node).operand(0);
        graph.replace_value(Value::new(node, 0), pred);
    }
}

impl Pass for RegisterAccessElimination {
    fn after(&mut self, graph: &mut Graph, node: NodeId) {
        let opcode = graph.node(node).opcode().clone();
        match opcode {
            // A new block means a new chain; nothing forwards across.
            Opcode::Block { .. } => self.reset(),

            Opcode::LoadRegister { reg } => {
                let reg = reg as usize;
                if let Some(store) = self.last_store[reg] {
                    // Read after write: forward the stored value.
                    let value = graph.node(store).operand(1);
                    graph.replace_value(Value::new(node, 1), value);
                    Self::unchain(graph, node);
                } else if let Some(load) = self.last_load[reg] {
                    // Read after read: forward the earlier load.
                    graph.replace_value(Value::new(node, 1), Value::new(load, 1));
                    Self::unchain(graph, node);
                } else {
                    self.last_load[reg] = Some(node);
                }
            }

            Opcode::StoreRegister { reg } => {
                let reg = reg as usize;
                if let Some(prev) = self.last_store[reg] {
                    if !self.exception_since_store[reg] {
                        Self::unchain(graph, prev);
                    }
                }
                self.last_store[reg] = Some(node);
                self.last_load[reg] = None;
                self.exception_since_store[reg] = false;
            }

            Opcode::LoadMemory => {
                let address = graph.node(node).operand(1);
                let ty = graph.node(node).output_type(1);
                let forward = self.last_mem_load.filter(|&prev| {
                    graph.node(prev).output_type(1) == ty
                        && same_value(graph, graph.node(prev).operand(1), address)
                });
                if let Some(prev) = forward {
                    graph.replace_value(Value::new(node, 1), Value::new(prev, 1));
                    Self::unchain(graph, node);
                } else {
                    self.mark_exception();
                    self.last_mem_store = None;
                    self.last_mem_load = Some(node);
                }
            }

            Opcode::StoreMemory => {
                let address = graph.node(node).operand(1);
                let ty = graph.value_type(graph.node(node).operand(2));
                let dead = self.last_mem_store.filter(|&prev| {
                    graph.value_type(graph.node(prev).operand(2)) == ty
                        && same_value(graph, graph.node(prev).operand(1), address)
                });
                if let Some(prev) = dead {
                    Self::unchain(graph, prev);
                }
                self.mark_exception();
                self.last_mem_store = Some(node);
                self.last_mem_load = None;
            }

            // The interpreter fallback can read and write anything.
            Opcode::Emulate { .. } => {
                self.mark_exception();
                self.last_load.fill(None);
                self.last_store.fill(None);
                self.last_mem_load = None;
                self.last_mem_store = None;
            }

            // Treated at least as strong as emulate.
            Opcode::Fence => {
                self.mark_exception();
                self.last_load.fill(None);
                self.last_store.fill(None);
                self.last_mem_load = None;
                self.last_mem_store = None;
            }

            _ => {}
        }
    }
}

// ─── Local value numbering ──────────────────────────────────────────────────

#[derive(PartialEq, Eq, Hash)]
struct NumberingKey {
    opcode: Opcode,
    ty: Type,
    operands: SmallVec<[Value; 2]>,
}

/// Common subexpression elimination plus constant and identity folding over
/// the pure opcodes of one block.
///
/// Runs after register-access elimination so that forwarded loads expose
/// shared subexpressions. Idempotent: a second run changes nothing.
#[derive(Default)]
pub struct LocalValueNumbering {
    table: HashMap<NumberingKey, Value>,
}

impl LocalValueNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn `node` into a constant in place, keeping its result type.
    fn replace_with_constant(graph: &mut Graph, node: NodeId, value: u64) {
        graph.set_operands(node, &[]);
        graph.set_opcode(node, Opcode::Constant { value });
    }

    /// Fold a cast node. Returns true if `node` was replaced outright.
    fn simplify_cast(graph: &mut Graph, node: NodeId, sext: bool) -> bool {
        let x = graph.node(node).operand(0);
        let ty = graph.node(node).output_type(0);

        if let Some(value) = graph.as_const(x) {
            let folded = eval_cast(ty, graph.value_type(x), sext, value);
            Self::replace_with_constant(graph, node, folded);
            return false;
        }

        // A cast of a cast can sometimes collapse.
        let x_opcode = graph.node(x.node).opcode().clone();
        if let Opcode::Cast { sext: x_sext } = x_opcode {
            let y = graph.node(x.node).operand(0);
            let ysize = graph.value_type(y).bits();
            let xsize = graph.value_type(x).bits();
            let size = ty.bits();

            // Same size as the original: the pair is a no-op.
            if ysize == size {
                graph.replace_value(Value::new(node, 0), y);
                return true;
            }

            // A down-cast followed by an up-cast cannot be folded.
            if ysize > xsize && xsize < size {
                return false;
            }

            // Up-cast chains fold only when the extensions agree.
            if ysize < xsize && xsize < size && x_sext != sext {
                return false;
            }

            // The result is an up-cast of y; it inherits the inner extension.
            if ysize < size {
                graph.set_opcode(node, Opcode::Cast { sext: x_sext });
            }
            graph.set_operand(node, 0, y);
        }
        false
    }

    /// Fold a binary node. Returns true if `node` was replaced outright.
    fn simplify_binary(&mut self, graph: &mut Graph, node: NodeId, opcode: Opcode) -> bool {
        let mut x = graph.node(node).operand(0);
        let mut y = graph.node(node).operand(1);

        if let (Some(l), Some(r)) = (graph.as_const(x), graph.as_const(y)) {
            let folded = eval_binary(graph.value_type(x), &opcode, l, r);
            Self::replace_with_constant(graph, node, folded);
            return false;
        }

        // Canonicalise: for commutative opcodes the constant moves right.
        if let Some(c) = graph.as_const(x) {
            if opcode.is_commutative() {
                graph.swap_operands(node, 0, 1);
                std::mem::swap(&mut x, &mut y);
            } else if c == 0 {
                match opcode {
                    Opcode::Sub => {
                        graph.set_operands(node, &[y]);
                        graph.set_opcode(node, Opcode::Neg);
                        return false;
                    }
                    Opcode::Shl | Opcode::Shr | Opcode::Sar => {
                        Self::replace_with_constant(graph, node, 0);
                        return false;
                    }
                    // 0 <u x is x != 0; 0 >=u x is x == 0.
                    Opcode::Ltu => {
                        graph.swap_operands(node, 0, 1);
                        graph.set_opcode(node, Opcode::Ne);
                        return false;
                    }
                    Opcode::Geu => {
                        graph.swap_operands(node, 0, 1);
                        graph.set_opcode(node, Opcode::Eq);
                        return false;
                    }
                    _ => {}
                }
            }
        }

        if let Some(c) = graph.as_const(y) {
            if c == 0 {
                match opcode {
                    // x @ 0 == x
                    Opcode::Add
                    | Opcode::Sub
                    | Opcode::Xor
                    | Opcode::Or
                    | Opcode::Shl
                    | Opcode::Shr
                    | Opcode::Sar => {
                        graph.replace_value(Value::new(node, 0), x);
                        return true;
                    }
                    // x @ 0 == 0
                    Opcode::And | Opcode::Ltu => {
                        Self::replace_with_constant(graph, node, 0);
                        return false;
                    }
                    // x >=u 0 is a tautology.
                    Opcode::Geu => {
                        Self::replace_with_constant(graph, node, 1);
                        return false;
                    }
                    _ => {}
                }
            } else if c == u64::MAX {
                match opcode {
                    Opcode::Xor => {
                        graph.set_operands(node, &[x]);
                        graph.set_opcode(node, Opcode::Not);
                        return false;
                    }
                    Opcode::And => {
                        graph.replace_value(Value::new(node, 0), x);
                        return true;
                    }
                    Opcode::Or => {
                        Self::replace_with_constant(graph, node, u64::MAX);
                        return false;
                    }
                    _ => {}
                }
            }
        }

        if x == y {
            match opcode {
                Opcode::Sub | Opcode::Xor | Opcode::Ne | Opcode::Lt | Opcode::Ltu => {
                    Self::replace_with_constant(graph, node, 0);
                    return false;
                }
                Opcode::Or | Opcode::And => {
                    graph.replace_value(Value::new(node, 0), x);
                    return true;
                }
                Opcode::Eq | Opcode::Ge | Opcode::Geu => {
                    Self::replace_with_constant(graph, node, 1);
                    return false;
                }
                _ => {}
            }
        }

        // add(add(a, c1), c2) absorbs into add(a, c1 + c2) when the outer
        // constant has no other user to disturb.
        if opcode == Opcode::Add {
            if let Some(c2) = graph.as_const(y) {
                if graph.node(y.node).uses(0).len() == 1
                    && *graph.node(x.node).opcode() == Opcode::Add
                {
                    let inner_rhs = graph.node(x.node).operand(1);
                    if let Some(c1) = graph.as_const(inner_rhs) {
                        let ty = graph.node(node).output_type(0);
                        let folded = sign_extend(ty, c2.wrapping_add(c1));
                        // The constant's payload changes, so its numbering
                        // entry must not keep matching the old value.
                        self.table.remove(&NumberingKey {
                            opcode: Opcode::Constant { value: c2 },
                            ty: graph.value_type(y),
                            operands: SmallVec::new(),
                        });
                        graph.set_opcode(y.node, Opcode::Constant { value: folded });
                        let a = graph.node(x.node).operand(0);
                        graph.set_operand(node, 0, a);
                    }
                }
            }
        }
        false
    }

    /// Total order used to canonicalise commutative operands before hashing:
    /// non-constants first, then by value identity.
    fn value_order(graph: &Graph, value: Value) -> (bool, usize, u16) {
        (
            graph.as_const(value).is_some(),
            value.node.index(),
            value.index,
        )
    }

    fn number(&mut self, graph: &mut Graph, node: NodeId) {
        if graph.node(node).opcode().is_commutative() {
            let x = graph.node(node).operand(0);
            let y = graph.node(node).operand(1);
            if Self::value_order(graph, y) < Self::value_order(graph, x) {
                graph.swap_operands(node, 0, 1);
            }
        }

        let key = NumberingKey {
            opcode: graph.node(node).opcode().clone(),
            ty: graph.node(node).output_type(0),
            operands: graph.node(node).operands().iter().copied().collect(),
        };
        match self.table.get(&key).copied() {
            Some(canonical) => {
                if canonical.node != node {
                    graph.replace_value(Value::new(node, 0), canonical);
                }
            }
            None => {
                self.table.insert(key, Value::new(node, 0));
            }
        }
    }
}

impl Pass for LocalValueNumbering {
    fn after(&mut self, graph: &mut Graph, node: NodeId) {
        let opcode = graph.node(node).opcode().clone();
        if !opcode.is_pure() {
            return;
        }

        let replaced = match opcode {
            Opcode::Cast { sext } => Self::simplify_cast(graph, node, sext),
            op if op.is_binary() => self.simplify_binary(graph, node, op),
            _ => false,
        };
        if replaced {
            return;
        }
        self.number(graph, node);
    }
}

// ─── Block marker ───────────────────────────────────────────────────────────

/// Pairs every `block` node with its terminator through the mate pointers.
///
/// Pre-order from the root reaches a terminator strictly before the block it
/// ends, so a single pending slot suffices.
#[derive(Default)]
pub struct BlockMarker {
    pending: Option<NodeId>,
}

impl BlockMarker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pass for BlockMarker {
    fn before(&mut self, graph: &mut Graph, node: NodeId) -> bool {
        let opcode = graph.node(node).opcode().clone();
        match opcode {
            Opcode::Block { .. } => {
                let term = self
                    .pending
                    .take()
                    .expect("block reached without a pending terminator");
                graph.set_opcode(node, Opcode::Block { mate: Some(term) });
                let term_opcode = graph.node(term).opcode().clone();
                match term_opcode {
                    Opcode::Jmp { .. } => graph.set_opcode(term, Opcode::Jmp { mate: Some(node) }),
                    Opcode::If { .. } => graph.set_opcode(term, Opcode::If { mate: Some(node) }),
                    _ => unreachable!("mate of a block must be a terminator"),
                }
            }
            Opcode::Jmp { .. } | Opcode::If { .. } => {
                assert!(
                    self.pending.is_none(),
                    "two terminators without a block between them"
                );
                self.pending = Some(node);
            }
            _ => {}
        }
        false
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
