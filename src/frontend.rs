//! RV64 front-end: translates one decoded basic block into an IR subgraph.
//!
//! The translation is a single pass and performs no optimisation: every
//! architectural register access becomes an explicit `load_register` /
//! `store_register`, serialised through the running memory token, and the
//! register-access elimination pass cleans up afterwards. Instructions
//! without an IR lowering become `emulate` nodes carrying the decoded
//! instruction for the interpreter fallback.

use crate::ir::{Builder, Graph, Opcode, Type, Value};

/// Guest program counter, modelled as an extra register.
pub const REG_PC: u16 = 64;
/// Retired-instruction counter, modelled as an extra register.
pub const REG_INSTRET: u16 = 65;
/// Size of the register state space visible to the passes.
pub const REG_COUNT: u16 = 66;

// ─── Decoder boundary ───────────────────────────────────────────────────────

/// Guest opcodes as produced by the decoder.
///
/// Only the straight-line subset gets a native IR lowering. Branches, jumps,
/// system instructions and everything else are named here so the decoder can
/// classify them, but the front-end lowers them to `emulate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestOpcode {
    // Loads and stores.
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
    Sb,
    Sh,
    Sw,
    Sd,
    // Immediate ALU.
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Addiw,
    Slliw,
    Srliw,
    Sraiw,
    // Register ALU.
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    // Upper immediates.
    Lui,
    Auipc,
    // No IR lowering; handled through `emulate`.
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Ecall,
    Ebreak,
    Fence,
    FenceI,
    Mul,
    Div,
    Rem,
    /// Anything the decoder recognised but nothing above covers.
    Other,
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInst {
    pub opcode: GuestOpcode,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    /// Immediate, already sign-extended (and pre-shifted for `lui`/`auipc`).
    pub imm: i64,
    /// Encoded length in bytes (4, or 2 for a compressed instruction).
    pub length: u8,
}

impl DecodedInst {
    pub fn new(opcode: GuestOpcode, rd: u8, rs1: u8, rs2: u8, imm: i64) -> Self {
        DecodedInst {
            opcode,
            rd,
            rs1,
            rs2,
            imm,
            length: 4,
        }
    }

    pub fn with_length(mut self, length: u8) -> Self {
        self.length = length;
        self
    }
}

/// A decoded basic block: straight-line instructions ending just before the
/// control transfer at `end_pc`.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start_pc: u64,
    pub end_pc: u64,
    pub insts: Vec<DecodedInst>,
}

// ─── Translation ────────────────────────────────────────────────────────────

/// Translate one basic block into a fresh graph.
///
/// The graph root is set to the terminal `end` node, anchored on the final
/// memory token through a `jmp`.
pub fn translate(block: &BasicBlock, no_instret: bool) -> Graph {
    let mut graph = Graph::new();
    let entry = graph.entry_memory();
    let mut frontend = Frontend {
        builder: Builder::new(&mut graph),
        block,
        last_memory: entry,
    };
    frontend.run(no_instret);
    graph
}

struct Frontend<'a, 'g> {
    builder: Builder<'g>,
    block: &'a BasicBlock,
    /// The latest memory token; every side effect is chained through here.
    last_memory: Value,
}

impl Frontend<'_, '_> {
    /// Read a guest register at `ty`. Register 0 is hardwired to zero and
    /// never touches the memory chain.
    fn load_reg(&mut self, ty: Type, reg: u8) -> Value {
        if reg == 0 {
            return self.builder.constant(ty, 0);
        }
        let (mem, value) = self.builder.load_register(self.last_memory, reg as u16);
        self.last_memory = mem;
        self.builder.cast(ty, false, value)
    }

    /// Write a guest register, promoting the value to `i64` first. The
    /// caller has already dropped writes to register 0.
    fn store_reg(&mut self, reg: u8, value: Value, sext: bool) {
        assert!(reg != 0, "stores to x0 must be dropped by the caller");
        let value = self.builder.cast(Type::I64, sext, value);
        self.last_memory = self
            .builder
            .store_register(self.last_memory, reg as u16, value);
    }

    fn emit_load(&mut self, inst: DecodedInst, ty: Type, sext: bool) {
        let base = self.load_reg(Type::I64, inst.rs1);
        let imm = self.builder.constant(Type::I64, inst.imm as u64);
        let address = self.builder.arithmetic(Opcode::Add, base, imm);
        let (mem, value) = self.builder.load_memory(self.last_memory, ty, address);
        self.last_memory = mem;
        // The memory access must still happen for x0; only the write is
        // dropped.
        if inst.rd != 0 {
            self.store_reg(inst.rd, value, sext);
        }
    }

    fn emit_store(&mut self, inst: DecodedInst, ty: Type) {
        let value = self.load_reg(ty, inst.rs2);
        let base = self.load_reg(Type::I64, inst.rs1);
        let imm = self.builder.constant(Type::I64, inst.imm as u64);
        let address = self.builder.arithmetic(Opcode::Add, base, imm);
        self.last_memory = self.builder.store_memory(self.last_memory, address, value);
    }

    fn emit_alui(&mut self, inst: DecodedInst, opcode: Opcode, w: bool) {
        if inst.rd == 0 {
            return;
        }
        let ty = if w { Type::I32 } else { Type::I64 };
        let left = self.load_reg(ty, inst.rs1);
        let right = self.builder.constant(ty, inst.imm as u64);
        let value = self.builder.arithmetic(opcode, left, right);
        self.store_reg(inst.rd, value, true);
    }

    fn emit_shifti(&mut self, inst: DecodedInst, opcode: Opcode, w: bool) {
        if inst.rd == 0 {
            return;
        }
        let ty = if w { Type::I32 } else { Type::I64 };
        let left = self.load_reg(ty, inst.rs1);
        let amount = self.builder.constant(Type::I8, inst.imm as u64);
        let value = self.builder.shift(opcode, left, amount);
        self.store_reg(inst.rd, value, true);
    }

    fn emit_slti(&mut self, inst: DecodedInst, opcode: Opcode) {
        if inst.rd == 0 {
            return;
        }
        let left = self.load_reg(Type::I64, inst.rs1);
        let right = self.builder.constant(Type::I64, inst.imm as u64);
        let value = self.builder.compare(opcode, left, right);
        self.store_reg(inst.rd, value, false);
    }

    fn emit_alu(&mut self, inst: DecodedInst, opcode: Opcode, w: bool) {
        if inst.rd == 0 {
            return;
        }
        let ty = if w { Type::I32 } else { Type::I64 };
        let left = self.load_reg(ty, inst.rs1);
        let right = self.load_reg(ty, inst.rs2);
        let value = self.builder.arithmetic(opcode, left, right);
        self.store_reg(inst.rd, value, true);
    }

    fn emit_shift(&mut self, inst: DecodedInst, opcode: Opcode, w: bool) {
        if inst.rd == 0 {
            return;
        }
        let ty = if w { Type::I32 } else { Type::I64 };
        let left = self.load_reg(ty, inst.rs1);
        let amount = self.load_reg(Type::I8, inst.rs2);
        let value = self.builder.shift(opcode, left, amount);
        self.store_reg(inst.rd, value, true);
    }

    fn emit_slt(&mut self, inst: DecodedInst, opcode: Opcode) {
        if inst.rd == 0 {
            return;
        }
        let left = self.load_reg(Type::I64, inst.rs1);
        let right = self.load_reg(Type::I64, inst.rs2);
        let value = self.builder.compare(opcode, left, right);
        self.store_reg(inst.rd, value, false);
    }

    /// `auipc` at block offset `pc_offset` relative to the already-advanced
    /// PC: loading PC yields `end_pc`, so the constant folds the distance
    /// back to the instruction's own address into the immediate.
    fn emit_auipc(&mut self, inst: DecodedInst, pc_offset: i64) {
        if inst.rd == 0 {
            return;
        }
        let (mem, pc) = self.builder.load_register(self.last_memory, REG_PC);
        self.last_memory = mem;
        let offset = self
            .builder
            .constant(Type::I64, pc_offset.wrapping_add(inst.imm) as u64);
        let value = self.builder.arithmetic(Opcode::Add, pc, offset);
        self.store_reg(inst.rd, value, false);
    }

    fn run(&mut self, no_instret: bool) {
        let block = self.block;
        assert!(block.end_pc >= block.start_pc, "basic block ends before it starts");
        let block_len = block.end_pc - block.start_pc;

        // Advance PC past the block and credit the retired instructions,
        // before any instruction is translated.
        let (mem, pc) = self.builder.load_register(self.last_memory, REG_PC);
        self.last_memory = mem;
        let delta = self.builder.constant(Type::I64, block_len);
        let new_pc = self.builder.arithmetic(Opcode::Add, pc, delta);
        self.last_memory = self.builder.store_register(self.last_memory, REG_PC, new_pc);

        if !no_instret {
            let (mem, instret) = self.builder.load_register(self.last_memory, REG_INSTRET);
            self.last_memory = mem;
            let count = self.builder.constant(Type::I64, block.insts.len() as u64);
            let new_instret = self.builder.arithmetic(Opcode::Add, instret, count);
            self.last_memory =
                self.builder
                    .store_register(self.last_memory, REG_INSTRET, new_instret);
        }

        // Distance from the advanced PC back to the current instruction.
        let mut pc_offset = -(block_len as i64);

        for &inst in &block.insts {
            use GuestOpcode::*;
            match inst.opcode {
                Lb => self.emit_load(inst, Type::I8, true),
                Lh => self.emit_load(inst, Type::I16, true),
                Lw => self.emit_load(inst, Type::I32, true),
                Ld => self.emit_load(inst, Type::I64, false),
                Lbu => self.emit_load(inst, Type::I8, false),
                Lhu => self.emit_load(inst, Type::I16, false),
                Lwu => self.emit_load(inst, Type::I32, false),
                Sb => self.emit_store(inst, Type::I8),
                Sh => self.emit_store(inst, Type::I16),
                Sw => self.emit_store(inst, Type::I32),
                Sd => self.emit_store(inst, Type::I64),
                Addi => self.emit_alui(inst, Opcode::Add, false),
                Slti => self.emit_slti(inst, Opcode::Lt),
                Sltiu => self.emit_slti(inst, Opcode::Ltu),
                Xori => self.emit_alui(inst, Opcode::Xor, false),
                Ori => self.emit_alui(inst, Opcode::Or, false),
                Andi => self.emit_alui(inst, Opcode::And, false),
                Slli => self.emit_shifti(inst, Opcode::Shl, false),
                Srli => self.emit_shifti(inst, Opcode::Shr, false),
                Srai => self.emit_shifti(inst, Opcode::Sar, false),
                Addiw => self.emit_alui(inst, Opcode::Add, true),
                Slliw => self.emit_shifti(inst, Opcode::Shl, true),
                Srliw => self.emit_shifti(inst, Opcode::Shr, true),
                Sraiw => self.emit_shifti(inst, Opcode::Sar, true),
                Add => self.emit_alu(inst, Opcode::Add, false),
                Sub => self.emit_alu(inst, Opcode::Sub, false),
                Sll => self.emit_shift(inst, Opcode::Shl, false),
                Slt => self.emit_slt(inst, Opcode::Lt),
                Sltu => self.emit_slt(inst, Opcode::Ltu),
                Xor => self.emit_alu(inst, Opcode::Xor, false),
                Srl => self.emit_shift(inst, Opcode::Shr, false),
                Sra => self.emit_shift(inst, Opcode::Sar, false),
                Or => self.emit_alu(inst, Opcode::Or, false),
                And => self.emit_alu(inst, Opcode::And, false),
                Addw => self.emit_alu(inst, Opcode::Add, true),
                Subw => self.emit_alu(inst, Opcode::Sub, true),
                Sllw => self.emit_shift(inst, Opcode::Shl, true),
                Srlw => self.emit_shift(inst, Opcode::Shr, true),
                Sraw => self.emit_shift(inst, Opcode::Sar, true),
                Lui => {
                    if inst.rd != 0 {
                        let value = self.builder.constant(Type::I64, inst.imm as u64);
                        self.last_memory =
                            self.builder
                                .store_register(self.last_memory, inst.rd as u16, value);
                    }
                }
                Auipc => self.emit_auipc(inst, pc_offset),
                _ => {
                    self.last_memory = self.builder.emulate(self.last_memory, inst);
                }
            }
            pc_offset += inst.length as i64;
        }

        let jmp = self.builder.jmp(self.last_memory);
        let end = self.builder.end(&[jmp]);
        self.builder.graph().set_root(end);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
