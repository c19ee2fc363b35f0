//! IR-based dynamic binary translation core for RV64 guests.
//!
//! Guest basic blocks arrive from the decoder as straight-line instruction
//! sequences. [`compile_block`] turns one block into a sea-of-nodes graph,
//! runs register-access elimination, local value numbering and the block
//! marker over it, and returns the finalised graph for the host back-end to
//! lower. The dispatcher owns the translation cache and the executable
//! memory; this crate owns everything between the decoder and the emitter.
//!
//! Set `RVJIT_DUMP_IR` to print each compiled block's IR to stderr.

pub mod analysis;
pub mod frontend;
pub mod ir;
pub mod ir_backend;
pub mod ir_passes;

use std::sync::OnceLock;

use tracing::trace;

pub use frontend::{BasicBlock, DecodedInst, GuestOpcode};
pub use ir::Graph;
pub use ir_backend::{CodeBuffer, HostBackend};

use ir_passes::{run, BlockMarker, LocalValueNumbering, RegisterAccessElimination};

/// Per-compilation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Skip the per-block instret update. Costs accuracy of the retired
    /// instruction counter, saves two chain nodes per block.
    pub no_instret: bool,
}

static DUMP_IR: OnceLock<bool> = OnceLock::new();

/// Whether compiled IR is dumped to stderr.
///
/// Read once from `RVJIT_DUMP_IR`, then cached. Any value other than `0`
/// enables the dump.
fn dump_ir() -> bool {
    *DUMP_IR.get_or_init(|| std::env::var_os("RVJIT_DUMP_IR").is_some_and(|v| v != "0"))
}

/// Compile one decoded basic block into a finalised graph.
///
/// Pipeline: front-end translation, register-access elimination, local value
/// numbering, block marker, garbage collection. The returned graph is ready
/// for a [`HostBackend`].
pub fn compile_block(block: &BasicBlock, options: &CompileOptions) -> Graph {
    trace!(
        start_pc = block.start_pc,
        end_pc = block.end_pc,
        insts = block.insts.len(),
        "translating block"
    );

    let mut graph = frontend::translate(block, options.no_instret);
    run(&mut RegisterAccessElimination::new(), &mut graph);
    run(&mut LocalValueNumbering::new(), &mut graph);
    run(&mut BlockMarker::new(), &mut graph);
    graph.garbage_collect();

    if dump_ir() {
        eprintln!("block {:#x}:\n{graph}", block.start_pc);
    }
    graph
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{REG_INSTRET, REG_PC};
    use crate::ir::{NodeId, Opcode, Type, Value};
    use pretty_assertions::assert_eq;

    fn block(start_pc: u64, insts: Vec<DecodedInst>) -> BasicBlock {
        let end_pc = start_pc + insts.iter().map(|i| i.length as u64).sum::<u64>();
        BasicBlock {
            start_pc,
            end_pc,
            insts,
        }
    }

    fn compile(insts: Vec<DecodedInst>) -> Graph {
        let graph = compile_block(&block(0, insts), &CompileOptions::default());
        graph.validate();
        graph
    }

    fn count<F: Fn(&Opcode) -> bool>(graph: &Graph, pred: F) -> usize {
        graph.iter_nodes().filter(|(_, n)| pred(n.opcode())).count()
    }

    fn find_store(graph: &Graph, reg: u16) -> NodeId {
        graph
            .iter_nodes()
            .find(|(_, n)| matches!(n.opcode(), Opcode::StoreRegister { reg: r } if *r == reg))
            .map(|(id, _)| id)
            .unwrap_or_else(|| panic!("no store of r{reg}"))
    }

    /// Side-effecting chain nodes in program order.
    fn chain(graph: &Graph) -> Vec<NodeId> {
        let mut node = graph.root().expect("rooted graph");
        let mut order = Vec::new();
        loop {
            if graph.node(node).opcode().has_side_effect() {
                order.push(node);
            }
            if graph.node(node).operand_count() == 0 {
                break;
            }
            node = graph.node(node).operand(0).node;
        }
        order.reverse();
        order
    }

    #[test]
    fn scenario_addi_from_zero() {
        // addi x5, x0, 7
        let graph = compile(vec![DecodedInst::new(GuestOpcode::Addi, 5, 0, 0, 7)]);

        assert_eq!(
            graph.to_string(),
            "i64 %0 = load_register r64\n\
             i64 %1 = constant 4\n\
             i64 %2 = add %0, %1\n\
             store_register r64, %2\n\
             i64 %3 = load_register r65\n\
             i64 %4 = constant 1\n\
             i64 %5 = add %3, %4\n\
             store_register r65, %5\n\
             i64 %6 = constant 7\n\
             store_register r5, %6\n"
        );

        let store = find_store(&graph, 5);
        assert_eq!(graph.as_const(graph.node(store).operand(1)), Some(7));
        assert_eq!(
            count(&graph, |op| matches!(op, Opcode::LoadRegister { reg: 5 })),
            0
        );
    }

    #[test]
    fn scenario_write_to_x0_vanishes() {
        // addi x0, x1, 1 — only the PC and instret updates survive.
        let graph = compile(vec![DecodedInst::new(GuestOpcode::Addi, 0, 1, 0, 1)]);

        assert_eq!(
            graph.to_string(),
            "i64 %0 = load_register r64\n\
             i64 %1 = constant 4\n\
             i64 %2 = add %0, %1\n\
             store_register r64, %2\n\
             i64 %3 = load_register r65\n\
             i64 %4 = constant 1\n\
             i64 %5 = add %3, %4\n\
             store_register r65, %5\n"
        );
    }

    #[test]
    fn scenario_dependent_adds_share_load() {
        // addi x2, x1, 1 ; addi x3, x2, 1
        let graph = compile(vec![
            DecodedInst::new(GuestOpcode::Addi, 2, 1, 0, 1),
            DecodedInst::new(GuestOpcode::Addi, 3, 2, 0, 1),
        ]);

        assert_eq!(
            count(&graph, |op| matches!(op, Opcode::LoadRegister { reg: 1 })),
            1
        );
        assert_eq!(
            count(&graph, |op| matches!(op, Opcode::LoadRegister { reg: 2 })),
            0
        );

        let v2 = graph.node(find_store(&graph, 2)).operand(1);
        let v3 = graph.node(find_store(&graph, 3)).operand(1);
        assert!(matches!(graph.node(v2.node).opcode(), Opcode::Add));
        assert!(matches!(graph.node(v3.node).opcode(), Opcode::Add));
        // x3's value chains off x2's, which chains off the single load.
        assert_eq!(graph.node(v3.node).operand(0), v2);
        let (load, _) = graph
            .iter_nodes()
            .find(|(_, n)| matches!(n.opcode(), Opcode::LoadRegister { reg: 1 }))
            .unwrap();
        assert_eq!(graph.node(v2.node).operand(0), Value::new(load, 1));
    }

    #[test]
    fn scenario_repeated_word_load() {
        // lw x5, 0(x6) ; lw x7, 0(x6)
        let graph = compile(vec![
            DecodedInst::new(GuestOpcode::Lw, 5, 6, 0, 0),
            DecodedInst::new(GuestOpcode::Lw, 7, 6, 0, 0),
        ]);

        assert_eq!(count(&graph, |op| matches!(op, Opcode::LoadMemory)), 1);

        // Both stores share the sign-extension of the one load.
        let v5 = graph.node(find_store(&graph, 5)).operand(1);
        let v7 = graph.node(find_store(&graph, 7)).operand(1);
        assert_eq!(v5, v7);
        assert!(matches!(
            graph.node(v5.node).opcode(),
            Opcode::Cast { sext: true }
        ));
        assert_eq!(
            graph.value_type(graph.node(v5.node).operand(0)),
            Type::I32
        );

        // The zero displacement folded away: the address is the x6 value.
        let (lm, _) = graph
            .iter_nodes()
            .find(|(_, n)| matches!(n.opcode(), Opcode::LoadMemory))
            .unwrap();
        let address = graph.node(lm).operand(1);
        assert!(matches!(
            graph.node(address.node).opcode(),
            Opcode::LoadRegister { reg: 6 }
        ));
    }

    #[test]
    fn scenario_repeated_word_store() {
        // sw x5, 0(x6) ; sw x7, 0(x6) — the first store is dead.
        let graph = compile(vec![
            DecodedInst::new(GuestOpcode::Sw, 0, 6, 5, 0),
            DecodedInst::new(GuestOpcode::Sw, 0, 6, 7, 0),
        ]);

        assert_eq!(count(&graph, |op| matches!(op, Opcode::StoreMemory)), 1);

        let (sm, _) = graph
            .iter_nodes()
            .find(|(_, n)| matches!(n.opcode(), Opcode::StoreMemory))
            .unwrap();
        let value = graph.node(sm).operand(2);
        assert_eq!(graph.value_type(value), Type::I32);
        assert!(matches!(
            graph.node(value.node).opcode(),
            Opcode::Cast { sext: false }
        ));
        assert!(matches!(
            graph.node(graph.node(value.node).operand(0).node).opcode(),
            Opcode::LoadRegister { reg: 7 }
        ));
    }

    #[test]
    fn scenario_shift_left_immediate() {
        // slli x5, x1, 3
        let graph = compile(vec![DecodedInst::new(GuestOpcode::Slli, 5, 1, 0, 3)]);

        let v5 = graph.node(find_store(&graph, 5)).operand(1);
        assert!(matches!(graph.node(v5.node).opcode(), Opcode::Shl));
        assert_eq!(graph.value_type(v5), Type::I64);

        let amount = graph.node(v5.node).operand(1);
        assert_eq!(graph.value_type(amount), Type::I8);
        assert_eq!(graph.as_const(amount), Some(3));

        // The result is already i64; nothing needs widening.
        assert_eq!(count(&graph, |op| matches!(op, Opcode::Cast { .. })), 0);
    }

    #[test]
    fn emulate_keeps_its_place_in_the_chain() {
        // addi x5, x0, 1 ; ecall ; addi x5, x0, 2
        let graph = compile(vec![
            DecodedInst::new(GuestOpcode::Addi, 5, 0, 0, 1),
            DecodedInst::new(GuestOpcode::Ecall, 0, 0, 0, 0),
            DecodedInst::new(GuestOpcode::Addi, 5, 0, 0, 2),
        ]);

        // The interpreter may observe x5 == 1; both stores survive.
        assert_eq!(
            count(&graph, |op| matches!(op, Opcode::StoreRegister { reg: 5 })),
            2
        );

        let order = chain(&graph);
        let stores: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(_, &id)| {
                matches!(graph.node(id).opcode(), Opcode::StoreRegister { reg: 5 })
            })
            .map(|(i, _)| i)
            .collect();
        let emulate = order
            .iter()
            .position(|&id| matches!(graph.node(id).opcode(), Opcode::Emulate { .. }))
            .expect("emulate on chain");
        assert_eq!(stores.len(), 2);
        assert!(stores[0] < emulate && emulate < stores[1]);
    }

    #[test]
    fn pc_advance_uses_block_length() {
        let b = block(
            0x8000,
            vec![
                DecodedInst::new(GuestOpcode::Addi, 1, 1, 0, 1),
                DecodedInst::new(GuestOpcode::Addi, 2, 2, 0, 1).with_length(2),
            ],
        );
        let graph = compile_block(&b, &CompileOptions::default());
        graph.validate();

        let pc_store = find_store(&graph, REG_PC);
        let value = graph.node(pc_store).operand(1);
        assert!(matches!(graph.node(value.node).opcode(), Opcode::Add));
        assert_eq!(graph.as_const(graph.node(value.node).operand(1)), Some(6));
    }

    #[test]
    fn no_instret_option_suppresses_counter() {
        let b = block(0, vec![DecodedInst::new(GuestOpcode::Addi, 5, 0, 0, 7)]);
        let graph = compile_block(
            &b,
            &CompileOptions {
                no_instret: true,
            },
        );
        graph.validate();

        assert_eq!(
            count(&graph, |op| matches!(
                op,
                Opcode::LoadRegister { reg } | Opcode::StoreRegister { reg } if *reg == REG_INSTRET
            )),
            0
        );
    }

    #[test]
    fn no_block_ever_writes_x0() {
        let programs = vec![
            vec![DecodedInst::new(GuestOpcode::Addi, 0, 1, 0, 5)],
            vec![DecodedInst::new(GuestOpcode::Lw, 0, 1, 0, 8)],
            vec![DecodedInst::new(GuestOpcode::Lui, 0, 0, 0, 0x1000)],
            vec![DecodedInst::new(GuestOpcode::Auipc, 0, 0, 0, 0x1000)],
            vec![DecodedInst::new(GuestOpcode::Sll, 0, 1, 2, 0)],
        ];
        for insts in programs {
            let graph = compile(insts);
            assert_eq!(
                count(&graph, |op| matches!(op, Opcode::StoreRegister { reg: 0 })),
                0
            );
        }
    }
}
